#![allow(dead_code)]
// sim.rs
//!
//! Recording stand-in for the thin client's hardware.
//! Models just enough of the board for the handoff to run hosted:
//! - PCI configuration mechanism #1 (0xCF8/0xCFC) over a set of config spaces
//! - ELCR at 0x4D0/0x4D1, other ports as plain latches
//! - descriptor-table and control registers
//!
//! Every port access is kept in a log for tests to inspect.

use std::collections::{BTreeMap, BTreeSet};

use crate::hw::{CpuRegisters, CpuidResult, DescriptorTablePointer, PortIo, SegmentRegisters};
use crate::pci::{PciAddress, CONFIG_ADDRESS, CONFIG_DATA};

// ============================================================================
// ACCESS LOG
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAccess {
    pub access: Access,
    pub port: u16,
    /// Width in bytes.
    pub width: u8,
    pub value: u32,
}

// ============================================================================
// SIMULATED BOARD
// ============================================================================

pub struct SimulatedBoard {
    config_address: u32,
    config_spaces: BTreeMap<PciAddress, [u8; 256]>,
    read_only: BTreeSet<(PciAddress, u8)>,
    latches: BTreeMap<u16, u8>,
    log: Vec<PortAccess>,

    segments: SegmentRegisters,
    eflags: u32,
    cr: [u32; 5],
    gdtr: DescriptorTablePointer,
    idtr: DescriptorTablePointer,
    cpuid: BTreeMap<u32, CpuidResult>,
}

impl SimulatedBoard {
    /// Empty board: no PCI devices, all registers zero.
    pub fn new() -> Self {
        Self {
            config_address: 0,
            config_spaces: BTreeMap::new(),
            read_only: BTreeSet::new(),
            latches: BTreeMap::new(),
            log: Vec::new(),
            segments: SegmentRegisters::default(),
            eflags: 0x2,
            cr: [0; 5],
            gdtr: DescriptorTablePointer::default(),
            idtr: DescriptorTablePointer::default(),
            cpuid: BTreeMap::new(),
        }
    }

    /// The Evo T30 as the resident loader leaves it: CS5530A functions,
    /// USB and CardBus present, stale steering and interrupt-line values,
    /// loader's own flat segments loaded.
    pub fn evo_t30() -> Self {
        let mut board = Self::new();

        // (devfn, vendor, device)
        let devices: [(u8, u16, u16); 7] = [
            (0x90, 0x1078, 0x0100), // CS5530A bridge
            (0x91, 0x1078, 0x0101), // SMI status / ACPI timer
            (0x92, 0x1078, 0x0102), // IDE
            (0x93, 0x1078, 0x0103), // XpressAUDIO
            (0x94, 0x1078, 0x0104), // video
            (0x98, 0x0E11, 0xA0F8), // USB OHCI
            (0x70, 0x104C, 0xAC50), // PCI1410 CardBus
        ];
        for (devfn, vendor, device) in devices {
            let mut space = [0u8; 256];
            space[0..2].copy_from_slice(&vendor.to_le_bytes());
            space[2..4].copy_from_slice(&device.to_le_bytes());
            space[0x3C] = 0x0B;
            space[0x3D] = 0x01;
            board.add_device(PciAddress::from_devfn(0, devfn), space);
        }

        // Whatever a previous firmware run left behind.
        board.poke_config(PciAddress::from_devfn(0, 0x90), 0x5C, 0xBA);
        board.poke_config(PciAddress::from_devfn(0, 0x90), 0x5D, 0x0B);
        board.latches.insert(0x4D0, 0x20);
        board.latches.insert(0x4D1, 0x0C);

        board.segments = SegmentRegisters { cs: 0x08, ds: 0x10, ss: 0x10, es: 0x10, fs: 0x10, gs: 0x10 };
        board.cr[0] = 0x0000_0011;
        board.gdtr = DescriptorTablePointer { limit: 0x17, base: 0x0000_0500 };
        board.idtr = DescriptorTablePointer { limit: 0x7F, base: 0x0000_0600 };

        board.cpuid.insert(
            0,
            CpuidResult {
                eax: 2,
                ebx: u32::from_le_bytes(*b"Cyri"),
                edx: u32::from_le_bytes(*b"xIns"),
                ecx: u32::from_le_bytes(*b"tead"),
            },
        );
        board.cpuid.insert(1, CpuidResult { eax: 0x540, ebx: 0, ecx: 0, edx: 0x0080_8131 });
        board.cpuid.insert(2, CpuidResult { eax: 0x0000_0101, ebx: 0, ecx: 0, edx: 0x0000_0070 });
        board
    }

    pub fn add_device(&mut self, addr: PciAddress, space: [u8; 256]) {
        self.config_spaces.insert(addr, space);
    }

    /// Writes config space directly, bypassing the port log.
    pub fn poke_config(&mut self, addr: PciAddress, offset: u8, value: u8) {
        if let Some(space) = self.config_spaces.get_mut(&addr) {
            space[offset as usize] = value;
        }
    }

    /// Reads config space directly, bypassing the port log.
    pub fn peek_config(&self, addr: PciAddress, offset: u8) -> Option<u8> {
        self.config_spaces.get(&addr).map(|s| s[offset as usize])
    }

    /// Drops all future writes to one config byte, as a wedged register would.
    pub fn make_read_only(&mut self, addr: PciAddress, offset: u8) {
        self.read_only.insert((addr, offset));
    }

    pub fn log(&self) -> &[PortAccess] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn set_cpuid(&mut self, leaf: u32, result: CpuidResult) {
        self.cpuid.insert(leaf, result);
    }

    fn selected(&self) -> Option<(PciAddress, u8)> {
        if self.config_address & 0x8000_0000 == 0 {
            return None;
        }
        let bus = (self.config_address >> 16) as u8;
        let devfn = (self.config_address >> 8) as u8;
        Some((PciAddress::from_devfn(bus, devfn), (self.config_address & 0xFC) as u8))
    }

    fn read_port(&mut self, port: u16, width: u8) -> u32 {
        let value = if (CONFIG_DATA..CONFIG_DATA + 4).contains(&port) {
            let lane = (port - CONFIG_DATA) as u8;
            match self.selected() {
                Some((addr, base)) => match self.config_spaces.get(&addr) {
                    Some(space) => {
                        let mut v = 0u32;
                        for i in 0..width {
                            let off = (base as usize + lane as usize + i as usize) & 0xFF;
                            v |= (space[off] as u32) << (8 * i as u32);
                        }
                        v
                    }
                    None => u32::MAX >> (32 - 8 * width as u32),
                },
                None => u32::MAX >> (32 - 8 * width as u32),
            }
        } else if port == CONFIG_ADDRESS && width == 4 {
            self.config_address
        } else {
            let mut v = 0u32;
            for i in 0..width as u16 {
                let b = self.latches.get(&(port + i)).copied().unwrap_or(0);
                v |= (b as u32) << (8 * i as u32);
            }
            v
        };
        self.log.push(PortAccess { access: Access::Read, port, width, value });
        value
    }

    fn write_port(&mut self, port: u16, width: u8, value: u32) {
        self.log.push(PortAccess { access: Access::Write, port, width, value });
        if port == CONFIG_ADDRESS && width == 4 {
            self.config_address = value;
        } else if (CONFIG_DATA..CONFIG_DATA + 4).contains(&port) {
            let lane = (port - CONFIG_DATA) as u8;
            if let Some((addr, base)) = self.selected() {
                for i in 0..width {
                    let off = base.wrapping_add(lane).wrapping_add(i);
                    if self.read_only.contains(&(addr, off)) {
                        continue;
                    }
                    if let Some(space) = self.config_spaces.get_mut(&addr) {
                        space[off as usize] = (value >> (8 * i as u32)) as u8;
                    }
                }
            }
        } else {
            for i in 0..width as u16 {
                self.latches.insert(port + i, (value >> (8 * i as u32)) as u8);
            }
        }
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIo for SimulatedBoard {
    fn inb(&mut self, port: u16) -> u8 {
        self.read_port(port, 1) as u8
    }

    fn inw(&mut self, port: u16) -> u16 {
        self.read_port(port, 2) as u16
    }

    fn inl(&mut self, port: u16) -> u32 {
        self.read_port(port, 4)
    }

    fn outb(&mut self, port: u16, value: u8) {
        self.write_port(port, 1, value as u32)
    }

    fn outw(&mut self, port: u16, value: u16) {
        self.write_port(port, 2, value as u32)
    }

    fn outl(&mut self, port: u16, value: u32) {
        self.write_port(port, 4, value)
    }
}

impl CpuRegisters for SimulatedBoard {
    fn segment_registers(&mut self) -> SegmentRegisters {
        self.segments
    }

    fn eflags(&mut self) -> u32 {
        self.eflags
    }

    fn cr0(&mut self) -> u32 {
        self.cr[0]
    }

    fn cr2(&mut self) -> u32 {
        self.cr[2]
    }

    fn cr3(&mut self) -> u32 {
        self.cr[3]
    }

    fn cr4(&mut self) -> u32 {
        self.cr[4]
    }

    fn write_cr0(&mut self, value: u32) {
        self.cr[0] = value;
    }

    fn store_gdt(&mut self) -> DescriptorTablePointer {
        self.gdtr
    }

    fn load_gdt(&mut self, gdtr: &DescriptorTablePointer) {
        self.gdtr = *gdtr;
    }

    fn store_idt(&mut self) -> DescriptorTablePointer {
        self.idtr
    }

    fn cpuid(&mut self, leaf: u32) -> CpuidResult {
        self.cpuid.get(&leaf).copied().unwrap_or_default()
    }

    fn enter_kernel(
        &mut self,
        entry: u32,
        boot_params: u32,
        code_selector: u16,
        data_selector: u16,
    ) -> ! {
        tracing::info!(
            cs = code_selector,
            ds = data_selector,
            "Simulated jump to kernel entry {:#010x} with %esi={:#010x}; stopping here",
            entry,
            boot_params
        );
        std::process::exit(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_device_reads_all_ones() {
        let mut board = SimulatedBoard::new();
        board.outl(CONFIG_ADDRESS, PciAddress::new(0, 3, 0).config_address(0));
        assert_eq!(board.inl(CONFIG_DATA), 0xFFFF_FFFF);
        assert_eq!(board.inb(CONFIG_DATA + 1), 0xFF);
    }

    #[test]
    fn test_log_records_accesses_in_order() {
        let mut board = SimulatedBoard::new();
        board.outb(0x4D0, 0x08);
        let v = board.inb(0x4D0);
        assert_eq!(v, 0x08);
        assert_eq!(
            board.log(),
            &[
                PortAccess { access: Access::Write, port: 0x4D0, width: 1, value: 0x08 },
                PortAccess { access: Access::Read, port: 0x4D0, width: 1, value: 0x08 },
            ]
        );
        board.clear_log();
        assert!(board.log().is_empty());
    }

    #[test]
    fn test_disabled_config_address_selects_nothing() {
        let mut board = SimulatedBoard::evo_t30();
        board.outl(CONFIG_ADDRESS, 0x0000_9000);
        board.outb(CONFIG_DATA, 0x55);
        assert_eq!(board.peek_config(PciAddress::from_devfn(0, 0x90), 0), Some(0x78));
    }

    #[test]
    fn test_evo_t30_starts_with_stale_state() {
        let board = SimulatedBoard::evo_t30();
        let usb = PciAddress::from_devfn(0, 0x98);
        assert_eq!(board.peek_config(usb, 0x3C), Some(0x0B));
        assert_eq!(board.peek_config(PciAddress::from_devfn(0, 0x90), 0x5C), Some(0xBA));
    }

    #[test]
    fn test_descriptor_registers_round_trip() {
        let mut board = SimulatedBoard::new();
        let p = DescriptorTablePointer { limit: 31, base: 0x8000 };
        board.load_gdt(&p);
        assert_eq!(board.store_gdt(), p);
        board.write_cr0(0x11);
        assert_eq!(board.cr0(), 0x11);
    }
}
