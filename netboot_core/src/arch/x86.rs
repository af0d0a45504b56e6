// arch/x86.rs
//!
//! i386 protected-mode backend: every primitive is a single privileged
//! instruction. Only meaningful at CPL 0 with interrupts disabled, which is
//! how the resident loader hands over control.

use core::arch::asm;

use crate::handoff::{self, HandoffOptions};
use crate::hw::{CpuRegisters, CpuidResult, DescriptorTablePointer, PortIo, SegmentRegisters};
use crate::loader::{BootPayload, Ramdisk};
use crate::memory::PhysMemory;
use crate::platform::PlatformConfig;

/// The machine itself.
pub struct BareMetal {
    _private: (),
}

impl BareMetal {
    /// # Safety
    ///
    /// Caller must be running at CPL 0 and be the only user of the
    /// hardware for the rest of the boot.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// Inert halt used when a fatal error leaves nothing to boot.
    pub fn halt(&mut self) -> ! {
        loop {
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }
}

fn pack(p: &DescriptorTablePointer) -> [u8; 6] {
    let mut raw = [0u8; 6];
    raw[0..2].copy_from_slice(&p.limit.to_le_bytes());
    raw[2..6].copy_from_slice(&p.base.to_le_bytes());
    raw
}

fn unpack(raw: &[u8; 6]) -> DescriptorTablePointer {
    DescriptorTablePointer {
        limit: u16::from_le_bytes([raw[0], raw[1]]),
        base: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
    }
}

macro_rules! read_reg {
    ($insn:literal) => {{
        let v: u32;
        unsafe { asm!($insn, out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }};
}

macro_rules! read_seg {
    ($insn:literal) => {{
        let v: u16;
        unsafe { asm!($insn, out(reg) v, options(nomem, nostack, preserves_flags)) };
        v
    }};
}

impl PortIo for BareMetal {
    fn inb(&mut self, port: u16) -> u8 {
        let v: u8;
        unsafe { asm!("in al, dx", out("al") v, in("dx") port, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn inw(&mut self, port: u16) -> u16 {
        let v: u16;
        unsafe { asm!("in ax, dx", out("ax") v, in("dx") port, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn inl(&mut self, port: u16) -> u32 {
        let v: u32;
        unsafe { asm!("in eax, dx", out("eax") v, in("dx") port, options(nomem, nostack, preserves_flags)) };
        v
    }

    fn outb(&mut self, port: u16, value: u8) {
        unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
    }

    fn outw(&mut self, port: u16, value: u16) {
        unsafe { asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags)) };
    }

    fn outl(&mut self, port: u16, value: u32) {
        unsafe { asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags)) };
    }
}

impl CpuRegisters for BareMetal {
    fn segment_registers(&mut self) -> SegmentRegisters {
        SegmentRegisters {
            cs: read_seg!("mov {0:x}, cs"),
            ds: read_seg!("mov {0:x}, ds"),
            ss: read_seg!("mov {0:x}, ss"),
            es: read_seg!("mov {0:x}, es"),
            fs: read_seg!("mov {0:x}, fs"),
            gs: read_seg!("mov {0:x}, gs"),
        }
    }

    fn eflags(&mut self) -> u32 {
        let v: u32;
        unsafe { asm!("pushfd", "pop {}", out(reg) v, options(nomem, preserves_flags)) };
        v
    }

    fn cr0(&mut self) -> u32 {
        read_reg!("mov {}, cr0")
    }

    fn cr2(&mut self) -> u32 {
        read_reg!("mov {}, cr2")
    }

    fn cr3(&mut self) -> u32 {
        read_reg!("mov {}, cr3")
    }

    fn cr4(&mut self) -> u32 {
        read_reg!("mov {}, cr4")
    }

    fn write_cr0(&mut self, value: u32) {
        unsafe { asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    fn store_gdt(&mut self) -> DescriptorTablePointer {
        let mut raw = [0u8; 6];
        unsafe { asm!("sgdt [{}]", in(reg) raw.as_mut_ptr(), options(nostack, preserves_flags)) };
        unpack(&raw)
    }

    fn load_gdt(&mut self, gdtr: &DescriptorTablePointer) {
        let raw = pack(gdtr);
        unsafe { asm!("lgdt [{}]", in(reg) raw.as_ptr(), options(readonly, nostack, preserves_flags)) };
    }

    fn store_idt(&mut self) -> DescriptorTablePointer {
        let mut raw = [0u8; 6];
        unsafe { asm!("sidt [{}]", in(reg) raw.as_mut_ptr(), options(nostack, preserves_flags)) };
        unpack(&raw)
    }

    fn cpuid(&mut self, leaf: u32) -> CpuidResult {
        // The GX1 predates CPUID leaf 0x80000000 but has leaves 0..=2.
        let r = unsafe { core::arch::x86::__cpuid(leaf) };
        CpuidResult { eax: r.eax, ebx: r.ebx, ecx: r.ecx, edx: r.edx }
    }

    fn enter_kernel(
        &mut self,
        entry: u32,
        boot_params: u32,
        code_selector: u16,
        data_selector: u16,
    ) -> ! {
        // Boot protocol: %esi = zero page, %ebp = %edi = %ebx = 0.
        unsafe {
            asm!(
                "mov ds, dx",
                "mov es, dx",
                "mov fs, dx",
                "mov gs, dx",
                "mov ss, dx",
                "push ebx",
                "push eax",
                "mov esi, ecx",
                "xor ebx, ebx",
                "xor edi, edi",
                "xor ebp, ebp",
                "retf",
                in("eax") entry,
                in("ebx") code_selector as u32,
                in("ecx") boot_params,
                in("edx") data_selector as u32,
                options(noreturn),
            )
        }
    }
}

/// Runs the whole stage on the machine and jumps to the kernel, or halts.
///
/// # Safety
///
/// RAM must be identity-mapped from address 0 for `platform.ram_size` bytes,
/// with paging and interrupts off, at CPL 0.
pub unsafe fn boot(platform: &PlatformConfig, payload: &BootPayload, options: &HandoffOptions) -> ! {
    let mut machine = BareMetal::new();
    let mut mem = PhysMemory::from_raw(core::ptr::null_mut(), platform.ram_size as usize);

    match handoff::run_handoff(&mut mem, &mut machine, platform, payload, options) {
        Ok(kernel) => handoff::enter_kernel(&mut machine, &kernel),
        Err(e) => {
            tracing::error!(error = %e, "Handoff failed; halting");
            machine.halt()
        }
    }
}

/// Entry the resident loader calls once the download is in RAM. A zero
/// `initrd_size` means no ramdisk.
///
/// # Safety
///
/// Same as [`boot`]; every address must be one the loader actually filled.
#[no_mangle]
pub unsafe extern "C" fn netboot_handoff(
    image_addr: u32,
    image_size: u32,
    cmdline_addr: u32,
    cmdline_len: u32,
    initrd_addr: u32,
    initrd_size: u32,
) -> ! {
    let payload = BootPayload {
        image_addr,
        image_size,
        cmdline_addr,
        cmdline_len,
        ramdisk: (initrd_size != 0).then_some(Ramdisk { addr: initrd_addr, size: initrd_size }),
    };
    boot(&PlatformConfig::evo_t30(), &payload, &HandoffOptions::default())
}
