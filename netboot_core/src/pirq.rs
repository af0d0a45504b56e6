// pirq.rs
//!
//! `$PIR` PCI interrupt routing table.
//!
//! The thin client's firmware publishes no routing table, so Linux cannot
//! find which router link feeds each PCI interrupt pin. We synthesize one
//! in the BIOS area (Microsoft "PCI IRQ Routing Table Specification" 1.0)
//! and clear the CS5530A steering registers, so the kernel assigns every
//! IRQ itself instead of trusting whatever a previous run left behind.
//!
//! The router compatibility IDs name the Cyrix 5520, whose router driver
//! Linux already has and which programs the same steering registers.

use std::fmt;

use crate::error::{HandoffError, HandoffResult};
use crate::hw::PortIo;
use crate::memory::PhysMemory;
use crate::pci::{InterruptRouter, PciAddress, PciConfigAccess, Pin, SteeringState, INTERRUPT_LINE, VENDOR_ID};
use crate::platform::PlatformConfig;

// ============================================================================
// LAYOUT
// ============================================================================

pub const SIGNATURE: [u8; 4] = *b"$PIR";
pub const VERSION: u16 = 0x0100;

pub const HEADER_SIZE: usize = 32;
pub const SLOT_SIZE: usize = 16;
pub const MAX_SLOTS: usize = 16;
pub const MAX_TABLE_SIZE: usize = HEADER_SIZE + MAX_SLOTS * SLOT_SIZE;

const TABLE_SIZE_OFFSET: usize = 6;
const ROUTER_BUS_OFFSET: usize = 8;
const ROUTER_DEVFN_OFFSET: usize = 9;
const EXCLUSIVE_IRQS_OFFSET: usize = 10;
const COMPAT_VENDOR_OFFSET: usize = 12;
const COMPAT_DEVICE_OFFSET: usize = 14;
const MINIPORT_OFFSET: usize = 16;
const CHECKSUM_OFFSET: usize = 31;

/// Every ISA IRQ the steering registers can produce: 1, 3-7, 9-12, 14, 15.
pub const ISA_IRQ_MASK: u16 = 0xDEFA;

/// Byte that makes `data` plus itself sum to zero modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    0u8.wrapping_sub(data.iter().fold(0u8, |acc, &x| acc.wrapping_add(x)))
}

// ============================================================================
// SLOTS
// ============================================================================

/// Link value and usable IRQs for one interrupt pin. Link 0 means the pin
/// is not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinRoute {
    pub link: u8,
    pub irq_bitmap: u16,
}

impl PinRoute {
    pub const UNWIRED: Self = Self { link: 0, irq_bitmap: 0 };

    pub const fn link(link: u8) -> Self {
        Self { link, irq_bitmap: ISA_IRQ_MASK }
    }

    pub const fn is_wired(&self) -> bool {
        self.link != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PirqSlot {
    pub bus: u8,
    pub devfn: u8,
    /// INTA# through INTD#.
    pub pins: [PinRoute; 4],
    /// 0 for on-board devices.
    pub slot_number: u8,
}

impl PirqSlot {
    // Links as the CS5530A board wiring presents them to each function.
    const LINK_A: u8 = 2;
    const LINK_B: u8 = 1;
    const LINK_C: u8 = 4;
    const LINK_D: u8 = 3;

    /// Device with all four pins wired to the router.
    pub const fn all_pins(devfn: u8) -> Self {
        Self {
            bus: 0,
            devfn,
            pins: [
                PinRoute::link(Self::LINK_A),
                PinRoute::link(Self::LINK_B),
                PinRoute::link(Self::LINK_C),
                PinRoute::link(Self::LINK_D),
            ],
            slot_number: 0,
        }
    }

    /// Device hard-wired to a single upstream pin; only INTA# is declared.
    pub const fn single_pin(devfn: u8) -> Self {
        Self {
            bus: 0,
            devfn,
            pins: [
                PinRoute::link(Self::LINK_A),
                PinRoute::UNWIRED,
                PinRoute::UNWIRED,
                PinRoute::UNWIRED,
            ],
            slot_number: 0,
        }
    }

    pub fn address(&self) -> PciAddress {
        PciAddress::from_devfn(self.bus, self.devfn)
    }

    pub fn pin(&self, pin: Pin) -> PinRoute {
        self.pins[pin.index()]
    }

    pub fn to_bytes(&self) -> [u8; SLOT_SIZE] {
        let mut raw = [0u8; SLOT_SIZE];
        raw[0] = self.bus;
        raw[1] = self.devfn;
        for (i, route) in self.pins.iter().enumerate() {
            let off = 2 + i * 3;
            raw[off] = route.link;
            raw[off + 1..off + 3].copy_from_slice(&route.irq_bitmap.to_le_bytes());
        }
        raw[14] = self.slot_number;
        raw
    }

    pub fn from_bytes(raw: &[u8; SLOT_SIZE]) -> Self {
        let mut pins = [PinRoute::UNWIRED; 4];
        for (i, route) in pins.iter_mut().enumerate() {
            let off = 2 + i * 3;
            route.link = raw[off];
            route.irq_bitmap = u16::from_le_bytes([raw[off + 1], raw[off + 2]]);
        }
        Self {
            bus: raw[0],
            devfn: raw[1],
            pins,
            slot_number: raw[14],
        }
    }
}

impl fmt::Display for PirqSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        for pin in Pin::ALL {
            let route = self.pin(pin);
            if route.is_wired() {
                write!(f, " {}=link{:02x}/{:#06x}", pin, route.link, route.irq_bitmap)?;
            } else {
                write!(f, " {}=-", pin)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PirqHeader {
    pub router: PciAddress,
    /// IRQs reserved for PCI, bit n = IRQ n.
    pub exclusive_irqs: u16,
    pub compat_vendor: u16,
    pub compat_device: u16,
    pub miniport_data: u32,
}

/// Encoded table: header, slots and checksum, ready to copy into memory.
#[derive(Clone)]
pub struct PirqTable {
    bytes: [u8; MAX_TABLE_SIZE],
    len: usize,
}

impl PirqTable {
    pub fn build(header: &PirqHeader, slots: &[PirqSlot]) -> HandoffResult<Self> {
        if slots.len() > MAX_SLOTS {
            return Err(HandoffError::TooManySlots(slots.len()));
        }
        let len = HEADER_SIZE + slots.len() * SLOT_SIZE;
        let mut bytes = [0u8; MAX_TABLE_SIZE];

        bytes[0..4].copy_from_slice(&SIGNATURE);
        bytes[4..6].copy_from_slice(&VERSION.to_le_bytes());
        bytes[TABLE_SIZE_OFFSET..TABLE_SIZE_OFFSET + 2].copy_from_slice(&(len as u16).to_le_bytes());
        bytes[ROUTER_BUS_OFFSET] = header.router.bus;
        bytes[ROUTER_DEVFN_OFFSET] = header.router.devfn;
        bytes[EXCLUSIVE_IRQS_OFFSET..EXCLUSIVE_IRQS_OFFSET + 2]
            .copy_from_slice(&header.exclusive_irqs.to_le_bytes());
        bytes[COMPAT_VENDOR_OFFSET..COMPAT_VENDOR_OFFSET + 2]
            .copy_from_slice(&header.compat_vendor.to_le_bytes());
        bytes[COMPAT_DEVICE_OFFSET..COMPAT_DEVICE_OFFSET + 2]
            .copy_from_slice(&header.compat_device.to_le_bytes());
        bytes[MINIPORT_OFFSET..MINIPORT_OFFSET + 4].copy_from_slice(&header.miniport_data.to_le_bytes());

        for (i, slot) in slots.iter().enumerate() {
            let off = HEADER_SIZE + i * SLOT_SIZE;
            bytes[off..off + SLOT_SIZE].copy_from_slice(&slot.to_bytes());
        }

        bytes[CHECKSUM_OFFSET] = checksum(&bytes[..len]);
        Ok(Self { bytes, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn slot_count(&self) -> usize {
        (self.len - HEADER_SIZE) / SLOT_SIZE
    }

    pub fn slot(&self, index: usize) -> Option<PirqSlot> {
        if index >= self.slot_count() {
            return None;
        }
        let off = HEADER_SIZE + index * SLOT_SIZE;
        let mut raw = [0u8; SLOT_SIZE];
        raw.copy_from_slice(&self.bytes[off..off + SLOT_SIZE]);
        Some(PirqSlot::from_bytes(&raw))
    }

    pub fn checksum_byte(&self) -> u8 {
        self.bytes[CHECKSUM_OFFSET]
    }
}

impl fmt::Debug for PirqTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PirqTable")
            .field("len", &self.len)
            .field("slots", &self.slot_count())
            .field("checksum", &format_args!("{:#04x}", self.checksum_byte()))
            .finish()
    }
}

// ============================================================================
// SYNTHESIS
// ============================================================================

/// What `synthesize_pirq_table` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PirqReport {
    /// Steering as left by the previous owner of the machine.
    pub before: SteeringState,
    /// Steering read back after clearing, before the table was written.
    pub after: SteeringState,
    pub table_addr: u32,
    pub table_size: usize,
    pub slots: usize,
    /// Slot devices whose interrupt-line byte was cleared.
    pub lines_cleared: usize,
}

pub fn synthesize_pirq_table<P: PortIo>(
    mem: &mut PhysMemory,
    io: &mut P,
    platform: &PlatformConfig,
) -> HandoffResult<PirqReport> {
    let router = InterruptRouter::new(platform.router);

    let before = router.snapshot(io);
    for pin in Pin::ALL {
        let irq = before.irq(pin);
        if irq == 0 {
            tracing::info!(pin = %pin, "PCI interrupt pin unrouted");
        } else {
            tracing::info!(
                pin = %pin,
                irq,
                trigger = ?before.trigger(irq),
                "PCI interrupt pin routed by previous firmware"
            );
        }
    }

    let after = router.clear_all(io);
    if !after.is_cleared() {
        tracing::warn!(pins = ?after.pins, "Steering registers did not clear; kernel may inherit stale routing");
    }

    let header = PirqHeader {
        router: platform.router,
        exclusive_irqs: platform.exclusive_irqs,
        compat_vendor: platform.router_compat_vendor,
        compat_device: platform.router_compat_device,
        miniport_data: 0,
    };
    let table = PirqTable::build(&header, platform.slots)?;

    let addr = platform.pirq_table_addr as usize;
    mem.fill(addr, table.len(), 0)?;
    mem.write_slice(addr, table.as_bytes())?;
    tracing::info!(
        addr = platform.pirq_table_addr,
        size = table.len(),
        slots = table.slot_count(),
        "PCI IRQ routing table written at {:#x}",
        platform.pirq_table_addr
    );
    for slot in platform.slots {
        tracing::debug!("$PIR slot {}", slot);
    }

    // Several drivers trust a non-zero interrupt line over the table.
    let mut lines_cleared = 0;
    for slot in platform.slots {
        let addr = slot.address();
        if io.pci_read16(addr, VENDOR_ID) == 0xFFFF {
            tracing::debug!(device = %addr, "No device in slot; interrupt line left alone");
            continue;
        }
        io.pci_write8(addr, INTERRUPT_LINE, 0);
        let line = io.pci_read8(addr, INTERRUPT_LINE);
        if line != 0 {
            tracing::warn!(device = %addr, line, "Interrupt line did not clear");
            continue;
        }
        lines_cleared += 1;
    }

    Ok(PirqReport {
        before,
        after,
        table_addr: platform.pirq_table_addr,
        table_size: table.len(),
        slots: table.slot_count(),
        lines_cleared,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{STEERING_AB, STEERING_CD};
    use crate::sim::SimulatedBoard;

    fn setup() -> (PhysMemory, SimulatedBoard, PlatformConfig) {
        let platform = PlatformConfig::evo_t30();
        let mem = PhysMemory::new(0x0010_0000).unwrap();
        (mem, SimulatedBoard::evo_t30(), platform)
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01]), 0xFF);
        assert_eq!(checksum(&[0x80, 0x80, 0x10]), 0xF0);
    }

    #[test]
    fn test_slot_encoding() {
        let raw = PirqSlot::all_pins(0x92).to_bytes();
        assert_eq!(
            raw,
            [0x00, 0x92, 0x02, 0xFA, 0xDE, 0x01, 0xFA, 0xDE, 0x04, 0xFA, 0xDE, 0x03, 0xFA, 0xDE, 0x00, 0x00]
        );
        let raw = PirqSlot::single_pin(0x70).to_bytes();
        assert_eq!(&raw[0..5], &[0x00, 0x70, 0x02, 0xFA, 0xDE]);
        assert!(raw[5..].iter().all(|&b| b == 0));
        assert_eq!(PirqSlot::from_bytes(&raw), PirqSlot::single_pin(0x70));
    }

    #[test]
    fn test_table_header() {
        let platform = PlatformConfig::evo_t30();
        let header = PirqHeader {
            router: platform.router,
            exclusive_irqs: 0,
            compat_vendor: 0x1078,
            compat_device: 0x0002,
            miniport_data: 0,
        };
        let table = PirqTable::build(&header, platform.slots).unwrap();
        let b = table.as_bytes();

        assert_eq!(&b[0..4], b"$PIR");
        assert_eq!(&b[4..6], &[0x00, 0x01]);
        assert_eq!(u16::from_le_bytes([b[6], b[7]]) as usize, 32 + 7 * 16);
        assert_eq!(b.len(), 144);
        assert_eq!(b[8], 0);
        assert_eq!(b[9], 0x90);
        assert_eq!(&b[12..16], &[0x78, 0x10, 0x02, 0x00]);
        assert!(b[20..31].iter().all(|&x| x == 0));
        assert_eq!(b.iter().fold(0u8, |a, &x| a.wrapping_add(x)), 0);
        assert_eq!(table.slot(6).map(|s| s.devfn), Some(0x70));
        assert_eq!(table.slot(7), None);
    }

    #[test]
    fn test_empty_table_is_still_valid() {
        let header = PirqHeader {
            router: PciAddress::new(0, 0x12, 0),
            exclusive_irqs: 0,
            compat_vendor: 0x1078,
            compat_device: 0x0002,
            miniport_data: 0,
        };
        let table = PirqTable::build(&header, &[]).unwrap();
        assert_eq!(table.len(), HEADER_SIZE);
        assert_eq!(table.slot_count(), 0);
        assert_eq!(table.as_bytes().iter().fold(0u8, |a, &x| a.wrapping_add(x)), 0);
    }

    #[test]
    fn test_too_many_slots() {
        let header = PirqHeader {
            router: PciAddress::new(0, 0x12, 0),
            exclusive_irqs: 0,
            compat_vendor: 0,
            compat_device: 0,
            miniport_data: 0,
        };
        let slots = [PirqSlot::all_pins(0x90); MAX_SLOTS + 1];
        assert!(matches!(
            PirqTable::build(&header, &slots),
            Err(HandoffError::TooManySlots(17))
        ));
    }

    #[test]
    fn test_synthesized_table_sums_to_zero() {
        let (mut mem, mut board, platform) = setup();
        mem.fill(0xF0000, 0x200, 0xA5).unwrap();

        let report = synthesize_pirq_table(&mut mem, &mut board, &platform).unwrap();
        assert_eq!(report.table_size, 144);
        assert_eq!(report.slots, 7);

        let table = mem.read_slice(0xF0000, report.table_size).unwrap();
        assert_eq!(table.iter().fold(0u8, |a, &x| a.wrapping_add(x)), 0);
        // Bytes past the table are not ours.
        assert_eq!(mem.read_u8(0xF0000 + 144).unwrap(), 0xA5);
    }

    #[test]
    fn test_pins_cleared_before_table_written() {
        let (mut mem, mut board, platform) = setup();
        let report = synthesize_pirq_table(&mut mem, &mut board, &platform).unwrap();

        assert_eq!(report.before.pins, [0xA, 0xB, 0xB, 0x0]);
        assert_eq!(report.after.pins, [0, 0, 0, 0]);
        assert_eq!(board.peek_config(platform.router, STEERING_AB), Some(0));
        assert_eq!(board.peek_config(platform.router, STEERING_CD), Some(0));
    }

    #[test]
    fn test_interrupt_lines_cleared() {
        let (mut mem, mut board, platform) = setup();
        let report = synthesize_pirq_table(&mut mem, &mut board, &platform).unwrap();

        assert_eq!(report.lines_cleared, 7);
        for slot in platform.slots {
            assert_eq!(board.peek_config(slot.address(), INTERRUPT_LINE), Some(0));
        }
    }

    #[test]
    fn test_unwired_pins_are_zero_in_memory() {
        let (mut mem, mut board, platform) = setup();
        synthesize_pirq_table(&mut mem, &mut board, &platform).unwrap();

        let index = platform.slots.iter().position(|s| s.devfn == 0x98).unwrap();
        let off = 0xF0000 + HEADER_SIZE + index * SLOT_SIZE;
        let raw = mem.read_slice(off, SLOT_SIZE).unwrap();
        assert_eq!(raw[1], 0x98);
        assert_eq!(&raw[2..5], &[0x02, 0xFA, 0xDE]);
        assert!(raw[5..14].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stuck_steering_still_writes_table() {
        let (mut mem, mut board, platform) = setup();
        board.make_read_only(platform.router, STEERING_AB);

        let report = synthesize_pirq_table(&mut mem, &mut board, &platform).unwrap();
        assert!(!report.after.is_cleared());
        assert_eq!(report.after.irq(Pin::C), 0);
        assert_eq!(mem.read_slice(0xF0000, 4).unwrap(), b"$PIR");
    }

    #[test]
    fn test_missing_device_is_skipped() {
        let (mut mem, _, platform) = setup();
        let mut board = SimulatedBoard::new();
        let report = synthesize_pirq_table(&mut mem, &mut board, &platform).unwrap();
        assert_eq!(report.lines_cleared, 0);
        assert_eq!(report.slots, 7);
    }
}
