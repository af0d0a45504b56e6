#![allow(dead_code)]
// hw.rs
//!
//! Register and port primitives.
//! Everything above this module talks to the machine only through these two
//! traits, so the same code runs on the thin client (`arch::x86::BareMetal`)
//! and against the recording fake (`sim::SimulatedBoard`).

/// Raw x86 port I/O.
pub trait PortIo {
    fn inb(&mut self, port: u16) -> u8;
    fn inw(&mut self, port: u16) -> u16;
    fn inl(&mut self, port: u16) -> u32;
    fn outb(&mut self, port: u16, value: u8);
    fn outw(&mut self, port: u16, value: u16);
    fn outl(&mut self, port: u16, value: u32);
}

/// Operand of `lgdt`/`sgdt`/`lidt`/`sidt` in 32-bit protected mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u32,
}

impl DescriptorTablePointer {
    /// Number of 8-byte slots covered by `limit`.
    pub fn entries(&self) -> usize {
        (self.limit as usize + 1) / 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegisters {
    pub cs: u16,
    pub ds: u16,
    pub ss: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidResult {
    /// Vendor string of leaf 0 (EBX, EDX, ECX order).
    pub fn vendor(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.ebx.to_le_bytes());
        out[4..8].copy_from_slice(&self.edx.to_le_bytes());
        out[8..12].copy_from_slice(&self.ecx.to_le_bytes());
        out
    }
}

/// Control, segment and descriptor-table registers.
pub trait CpuRegisters {
    fn segment_registers(&mut self) -> SegmentRegisters;
    fn eflags(&mut self) -> u32;
    fn cr0(&mut self) -> u32;
    fn cr2(&mut self) -> u32;
    fn cr3(&mut self) -> u32;
    fn cr4(&mut self) -> u32;
    fn write_cr0(&mut self, value: u32);

    fn store_gdt(&mut self) -> DescriptorTablePointer;
    fn load_gdt(&mut self, gdtr: &DescriptorTablePointer);
    fn store_idt(&mut self) -> DescriptorTablePointer;

    fn cpuid(&mut self, leaf: u32) -> CpuidResult;

    /// Jumps to the 32-bit kernel entry with `%esi` pointing at the zero page,
    /// `CS = code_selector` and every data segment `= data_selector`.
    /// Never returns; nothing before this point can be undone.
    fn enter_kernel(
        &mut self,
        entry: u32,
        boot_params: u32,
        code_selector: u16,
        data_selector: u16,
    ) -> !;
}
