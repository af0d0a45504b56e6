// platform.rs
//!
//! Fixed physical addresses and board wiring, passed by reference through
//! every stage instead of living in globals.

use crate::error::{HandoffError, HandoffResult};
use crate::gdt::{LinuxGdt, DESCRIPTOR_SIZE};
use crate::linux::ZERO_PAGE_SIZE;
use crate::pci::PciAddress;
use crate::pirq::{PirqSlot, HEADER_SIZE, MAX_SLOTS, SLOT_SIZE};

/// PCI functions on the Evo T30 and how their pins reach the CS5530A router.
///
/// Found by trial and error on real units; keep as is.
pub static EVO_T30_SLOTS: [PirqSlot; 7] = [
    PirqSlot::all_pins(0x90),    // CS5530A F0: bridge configuration
    PirqSlot::all_pins(0x91),    // F1: SMI status / ACPI timer
    PirqSlot::all_pins(0x92),    // F2: IDE
    PirqSlot::all_pins(0x93),    // F3: XpressAUDIO
    PirqSlot::all_pins(0x94),    // F4: video
    PirqSlot::single_pin(0x98),  // USB OHCI (device 0x13)
    PirqSlot::single_pin(0x70),  // TI PCI1410 CardBus (device 0x0e)
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformConfig {
    pub name: &'static str,
    /// Installed RAM in bytes.
    pub ram_size: u32,

    /// Where the protected-mode kernel body runs from (also its entry point).
    pub kernel_load_addr: u32,
    pub zero_page_addr: u32,
    pub gdt_addr: u32,
    pub pirq_table_addr: u32,

    /// Where the resident loader leaves the downloaded bzImage.
    pub payload_base: u32,
    /// Where the resident loader leaves the command line.
    pub cmdline_addr: u32,

    pub router: PciAddress,
    pub router_compat_vendor: u16,
    pub router_compat_device: u16,
    pub exclusive_irqs: u16,
    pub slots: &'static [PirqSlot],
}

impl PlatformConfig {
    /// HP/Compaq Evo T30: Geode GX1, CS5530A, 29.5 MiB usable RAM.
    pub fn evo_t30() -> Self {
        Self {
            name: "HP/Compaq Evo T30",
            ram_size: 0x01D8_0000,
            kernel_load_addr: 0x0010_0000,
            zero_page_addr: 0x0009_0000,
            gdt_addr: 0x0000_8000,
            pirq_table_addr: 0x000F_0000,
            payload_base: 0x0108_0000,
            cmdline_addr: 0x0002_0000,
            router: PciAddress::new(0, 0x12, 0),
            router_compat_vendor: 0x1078, // Cyrix
            router_compat_device: 0x0002, // 5520
            exclusive_irqs: 0,
            slots: &EVO_T30_SLOTS,
        }
    }

    pub fn pirq_table_size(&self) -> usize {
        HEADER_SIZE + self.slots.len() * SLOT_SIZE
    }

    /// Fixed regions below the kernel, as (name, start, end).
    fn low_regions(&self) -> [(&'static str, u64, u64); 3] {
        let region = |name, start: u32, len: usize| (name, start as u64, start as u64 + len as u64);
        [
            region("GDT", self.gdt_addr, LinuxGdt::ENTRIES * DESCRIPTOR_SIZE),
            region("zero page", self.zero_page_addr, ZERO_PAGE_SIZE),
            region("$PIR table", self.pirq_table_addr, self.pirq_table_size()),
        ]
    }

    /// A command line of `len` bytes plus its NUL must miss every fixed region.
    pub fn check_cmdline(&self, len: u32) -> HandoffResult<()> {
        let start = self.cmdline_addr as u64;
        let end = start + len as u64 + 1;
        for (name, r_start, r_end) in self.low_regions() {
            if start < r_end && r_start < end {
                return Err(HandoffError::InvalidConfiguration(format!(
                    "command line at {:#x}..{:#x} overlaps the {} at {:#x}",
                    start, end, name, r_start
                )));
            }
        }
        Ok(())
    }

    /// Checks that the fixed regions fit in RAM and stay out of each other's way.
    pub fn validate(&self) -> HandoffResult<()> {
        if self.slots.len() > MAX_SLOTS {
            return Err(HandoffError::TooManySlots(self.slots.len()));
        }

        let regions = self.low_regions();
        for (i, &(name, start, end)) in regions.iter().enumerate() {
            if end > self.kernel_load_addr as u64 {
                return Err(HandoffError::InvalidConfiguration(format!(
                    "{} at {:#x} runs into the kernel at {:#x}",
                    name, start, self.kernel_load_addr
                )));
            }
            for &(other, o_start, o_end) in &regions[i + 1..] {
                if start < o_end && o_start < end {
                    return Err(HandoffError::InvalidConfiguration(format!(
                        "{} at {:#x} overlaps {} at {:#x}",
                        name, start, other, o_start
                    )));
                }
            }
        }
        self.check_cmdline(0)?;

        if self.zero_page_addr as usize % ZERO_PAGE_SIZE != 0 {
            return Err(HandoffError::InvalidConfiguration(format!(
                "zero page at {:#x} is not page aligned",
                self.zero_page_addr
            )));
        }
        if self.payload_base <= self.kernel_load_addr || self.payload_base >= self.ram_size {
            return Err(HandoffError::InvalidConfiguration(format!(
                "payload at {:#x} must sit between the kernel at {:#x} and the end of RAM at {:#x}",
                self.payload_base, self.kernel_load_addr, self.ram_size
            )));
        }
        Ok(())
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::evo_t30()
    }
}

// ============================================================================
// TESTS
// ============================================================================
