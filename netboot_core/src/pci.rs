#![allow(dead_code)]
// pci.rs
//!
//! PCI configuration mechanism #1 and the CS5530A interrupt router.
//!
//! The router lives in CS5530A function 0 (bus 0, device 0x12). Its two
//! "PCI Interrupt Steering" registers each hold two 4-bit IRQ numbers:
//! - F0:5Ch: INTA# (bits 3:0), INTB# (bits 7:4)
//! - F0:5Dh: INTC# (bits 3:0), INTD# (bits 7:4)
//!
//! Trigger mode of ISA IRQs is held in the ELCR pair at 4D0h/4D1h
//! (bit set = level-triggered).

use std::fmt;

use crate::error::{HandoffError, HandoffResult};
use crate::hw::PortIo;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const CONFIG_ADDRESS: u16 = 0xCF8;
pub const CONFIG_DATA: u16 = 0xCFC;

const CONFIG_ENABLE: u32 = 0x8000_0000;

pub const VENDOR_ID: u8 = 0x00;
pub const INTERRUPT_LINE: u8 = 0x3C;

pub const STEERING_AB: u8 = 0x5C;
pub const STEERING_CD: u8 = 0x5D;

pub const ELCR_LOW: u16 = 0x4D0;
pub const ELCR_HIGH: u16 = 0x4D1;

/// IRQs whose ELCR bits must stay clear (timer, keyboard, cascade, RTC, FPU).
const EDGE_ONLY_IRQS: u16 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 8) | (1 << 13);

// ============================================================================
// ADDRESSING
// ============================================================================

/// Bus number plus the packed device/function byte (`device << 3 | function`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub devfn: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            devfn: ((device & 0x1F) << 3) | (function & 0x7),
        }
    }

    pub const fn from_devfn(bus: u8, devfn: u8) -> Self {
        Self { bus, devfn }
    }

    pub const fn device(self) -> u8 {
        self.devfn >> 3
    }

    pub const fn function(self) -> u8 {
        self.devfn & 0x7
    }

    /// Value written to 0xCF8 to select the dword holding `offset`.
    pub const fn config_address(self, offset: u8) -> u32 {
        CONFIG_ENABLE
            | ((self.bus as u32) << 16)
            | ((self.devfn as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device(), self.function())
    }
}

// ============================================================================
// CONFIGURATION SPACE ACCESS
// ============================================================================

/// Configuration-space accessors layered on raw port I/O.
pub trait PciConfigAccess: PortIo {
    fn pci_read8(&mut self, addr: PciAddress, offset: u8) -> u8 {
        self.outl(CONFIG_ADDRESS, addr.config_address(offset));
        self.inb(CONFIG_DATA | (offset as u16 & 3))
    }

    fn pci_read16(&mut self, addr: PciAddress, offset: u8) -> u16 {
        self.outl(CONFIG_ADDRESS, addr.config_address(offset));
        self.inw(CONFIG_DATA | (offset as u16 & 2))
    }

    fn pci_read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
        self.outl(CONFIG_ADDRESS, addr.config_address(offset));
        self.inl(CONFIG_DATA)
    }

    fn pci_write8(&mut self, addr: PciAddress, offset: u8, value: u8) {
        self.outl(CONFIG_ADDRESS, addr.config_address(offset));
        self.outb(CONFIG_DATA | (offset as u16 & 3), value);
    }
}

impl<T: PortIo + ?Sized> PciConfigAccess for T {}

// ============================================================================
// INTERRUPT ROUTER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pin {
    A,
    B,
    C,
    D,
}

impl Pin {
    pub const ALL: [Pin; 4] = [Pin::A, Pin::B, Pin::C, Pin::D];

    pub const fn index(self) -> usize {
        match self {
            Pin::A => 0,
            Pin::B => 1,
            Pin::C => 2,
            Pin::D => 3,
        }
    }

    /// Steering register and nibble shift for this pin.
    const fn steering(self) -> (u8, u8) {
        match self {
            Pin::A => (STEERING_AB, 0),
            Pin::B => (STEERING_AB, 4),
            Pin::C => (STEERING_CD, 0),
            Pin::D => (STEERING_CD, 4),
        }
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Pin::A => 'A',
            Pin::B => 'B',
            Pin::C => 'C',
            Pin::D => 'D',
        };
        write!(f, "INT{}#", c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

/// Steering registers plus ELCR, as read at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SteeringState {
    /// IRQ per pin, 0 = unrouted.
    pub pins: [u8; 4],
    /// ELCR bits, IRQ n at bit n.
    pub elcr: u16,
}

impl SteeringState {
    pub fn irq(&self, pin: Pin) -> u8 {
        self.pins[pin.index()]
    }

    pub fn trigger(&self, irq: u8) -> Trigger {
        if irq < 16 && self.elcr & (1 << irq) != 0 {
            Trigger::Level
        } else {
            Trigger::Edge
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.pins.iter().all(|&irq| irq == 0)
    }
}

/// CS5530A function 0 acting as PCI interrupt router.
#[derive(Debug, Clone, Copy)]
pub struct InterruptRouter {
    addr: PciAddress,
}

impl InterruptRouter {
    pub const fn new(addr: PciAddress) -> Self {
        Self { addr }
    }

    pub fn address(&self) -> PciAddress {
        self.addr
    }

    pub fn pin_irq<P: PortIo>(&self, io: &mut P, pin: Pin) -> u8 {
        let (reg, shift) = pin.steering();
        (io.pci_read8(self.addr, reg) >> shift) & 0xF
    }

    /// Rewrites one steering nibble and reads it back.
    ///
    /// A register stuck at the value being written reads back fine and is
    /// not reported.
    pub fn set_pin_irq<P: PortIo>(&self, io: &mut P, pin: Pin, irq: u8) -> HandoffResult<()> {
        if irq > 15 {
            return Err(HandoffError::InvalidIrq(irq));
        }
        let (reg, shift) = pin.steering();
        let old = io.pci_read8(self.addr, reg);
        let new = (old & !(0xF << shift)) | (irq << shift);
        io.pci_write8(self.addr, reg, new);

        let actual = io.pci_read8(self.addr, reg);
        if actual != new {
            return Err(HandoffError::RegisterReadback {
                register: if reg == STEERING_AB { "F0:5Ch" } else { "F0:5Dh" },
                expected: new,
                actual,
            });
        }
        Ok(())
    }

    pub fn elcr<P: PortIo>(&self, io: &mut P) -> u16 {
        io.inb(ELCR_LOW) as u16 | ((io.inb(ELCR_HIGH) as u16) << 8)
    }

    pub fn set_trigger<P: PortIo>(&self, io: &mut P, irq: u8, trigger: Trigger) -> HandoffResult<()> {
        if irq > 15 || (trigger == Trigger::Level && EDGE_ONLY_IRQS & (1 << irq) != 0) {
            return Err(HandoffError::InvalidIrq(irq));
        }
        let (port, bit) = if irq < 8 { (ELCR_LOW, irq) } else { (ELCR_HIGH, irq - 8) };
        let old = io.inb(port);
        let new = match trigger {
            Trigger::Level => old | (1 << bit),
            Trigger::Edge => old & !(1 << bit),
        };
        io.outb(port, new);
        Ok(())
    }

    pub fn snapshot<P: PortIo>(&self, io: &mut P) -> SteeringState {
        let mut state = SteeringState { pins: [0; 4], elcr: self.elcr(io) };
        for pin in Pin::ALL {
            state.pins[pin.index()] = self.pin_irq(io, pin);
        }
        state
    }

    /// Routes `pin` to `irq` and makes the IRQ level-triggered, as PCI
    /// interrupts require.
    pub fn route_pin<P: PortIo>(&self, io: &mut P, pin: Pin, irq: u8) -> HandoffResult<()> {
        self.set_trigger(io, irq, Trigger::Level)?;
        self.set_pin_irq(io, pin, irq)
    }

    /// Sets every pin to IRQ 0 and returns the state read back afterwards.
    ///
    /// Read-back mismatches are logged, not returned: the kernel reassigns
    /// the pins anyway.
    pub fn clear_all<P: PortIo>(&self, io: &mut P) -> SteeringState {
        for pin in Pin::ALL {
            if let Err(e) = self.set_pin_irq(io, pin, 0) {
                tracing::warn!(pin = %pin, error = %e, "Failed to clear PCI interrupt steering");
            }
        }
        self.snapshot(io)
    }
}

// ============================================================================
// TESTS
// ============================================================================
