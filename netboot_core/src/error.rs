#![allow(dead_code)]

use std::fmt;
use std::io;






#[derive(Debug)]
pub enum HandoffError {

    PayloadTruncated { needed: usize, actual: usize },
    BadBootFlag(u16),
    ImplausibleHeader(String),
    EmptyKernelBody,


    MemoryAllocation(String),
    MemoryWrite { addr: u64, len: usize, limit: usize },
    MemoryRead { addr: u64, len: usize, limit: usize },


    MemoryMapTooShort(usize),
    MemoryMapFull,
    MemoryMapDisorder { index: usize, addr: u64 },
    MemoryMapEmptyEntry(usize),
    MemoryMapMalformed(usize),
    NotUsableRam { addr: u64, len: u64 },


    RegisterReadback { register: &'static str, expected: u8, actual: u8 },
    InvalidIrq(u8),
    TooManySlots(usize),


    InvalidConfiguration(String),
    IoError(io::Error),
}





impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTruncated { needed, actual } => write!(
                f,
                "Boot payload truncated: need {} bytes, container holds {}",
                needed, actual
            ),
            Self::BadBootFlag(flag) => {
                write!(f, "Boot flag mismatch: {:#06x} (expected 0xaa55)", flag)
            }
            Self::ImplausibleHeader(msg) => write!(f, "Implausible setup header: {}", msg),
            Self::EmptyKernelBody => write!(f, "Protected-mode kernel body is empty"),

            Self::MemoryAllocation(msg) => write!(f, "Memory allocation failed: {}", msg),
            Self::MemoryWrite { addr, len, limit } => write!(
                f,
                "Memory write overflow: addr={:#x}, len={}, limit={:#x}",
                addr, len, limit
            ),
            Self::MemoryRead { addr, len, limit } => write!(
                f,
                "Memory read overflow: addr={:#x}, len={}, limit={:#x}",
                addr, len, limit
            ),

            Self::MemoryMapTooShort(n) => {
                write!(f, "Memory map has {} entries, the kernel needs at least 2", n)
            }
            Self::MemoryMapFull => write!(f, "Memory map is full"),
            Self::MemoryMapDisorder { index, addr } => write!(
                f,
                "Memory map entry {} at {:#x} overlaps or precedes its predecessor",
                index, addr
            ),
            Self::MemoryMapEmptyEntry(index) => {
                write!(f, "Memory map entry {} has zero length", index)
            }
            Self::MemoryMapMalformed(len) => {
                write!(f, "Raw e820 buffer of {} bytes is not a whole number of entries", len)
            }
            Self::NotUsableRam { addr, len } => write!(
                f,
                "Memory map does not cover {} bytes at {:#x} with usable RAM",
                len, addr
            ),

            Self::RegisterReadback { register, expected, actual } => write!(
                f,
                "Register {} read back {:#04x} after writing {:#04x}",
                register, actual, expected
            ),
            Self::InvalidIrq(irq) => write!(f, "IRQ {} cannot be routed to a PCI pin", irq),
            Self::TooManySlots(n) => write!(f, "Routing table cannot hold {} slots", n),

            Self::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

// ============================================================================
// ERROR TRAIT IMPLEMENTATION
// ============================================================================

impl std::error::Error for HandoffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}





impl From<io::Error> for HandoffError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}






pub type HandoffResult<T> = Result<T, HandoffError>;






#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl HandoffError {

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // The kernel would be handed a corrupt zero page.
            Self::PayloadTruncated { .. }
            | Self::BadBootFlag(_)
            | Self::ImplausibleHeader(_)
            | Self::EmptyKernelBody
            | Self::MemoryMapTooShort(_)
            | Self::NotUsableRam { .. } => ErrorSeverity::Fatal,


            Self::MemoryAllocation(_)
            | Self::MemoryWrite { .. }
            | Self::MemoryRead { .. }
            | Self::InvalidConfiguration(_) => ErrorSeverity::Critical,


            Self::MemoryMapFull
            | Self::MemoryMapDisorder { .. }
            | Self::MemoryMapEmptyEntry(_)
            | Self::MemoryMapMalformed(_)
            | Self::TooManySlots(_) => ErrorSeverity::Error,

            // Steering state is redone by the kernel anyway.
            Self::RegisterReadback { .. } | Self::InvalidIrq(_) => ErrorSeverity::Warning,

            Self::IoError(_) => ErrorSeverity::Error,
        }
    }


    pub fn can_proceed(&self) -> bool {
        self.severity() < ErrorSeverity::Error
    }


    pub fn requires_halt(&self) -> bool {
        self.severity() >= ErrorSeverity::Critical
    }
}
