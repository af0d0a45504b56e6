#![allow(dead_code)]
// gdt.rs
//!
//! Segment descriptors and the flat global descriptor table the Linux 32-bit
//! boot protocol expects.
//!
//! The protocol wants a 4-entry table:
//! - GDT[0]: null descriptor
//! - GDT[1]: unused
//! - GDT[2]: `__BOOT_CS` (0x10), 4 GiB flat, execute/read
//! - GDT[3]: `__BOOT_DS` (0x18), 4 GiB flat, read/write

use std::fmt;

use crate::error::HandoffResult;
use crate::hw::{CpuRegisters, DescriptorTablePointer};
use crate::memory::PhysMemory;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const DESCRIPTOR_SIZE: usize = 8;

pub const BOOT_CS: u16 = 0x10;
pub const BOOT_DS: u16 = 0x18;

/// Execute/read, accessed.
pub const TYPE_CODE: u8 = 0xB;
/// Read/write, accessed.
pub const TYPE_DATA: u8 = 0x3;

const LIMIT_LOW_MASK: u64 = 0xFFFF;
const BASE_LOW_SHIFT: u32 = 16;
const TYPE_SHIFT: u32 = 40;
const S_BIT: u32 = 44;
const DPL_SHIFT: u32 = 45;
const P_BIT: u32 = 47;
const LIMIT_HIGH_SHIFT: u32 = 48;
const AVL_BIT: u32 = 52;
const DB_BIT: u32 = 54;
const G_BIT: u32 = 55;
const BASE_HIGH_SHIFT: u32 = 56;

// ============================================================================
// SEGMENT DESCRIPTOR
// ============================================================================

/// One 8-byte descriptor. Bit positions are those of the Intel SDM,
/// independent of any struct layout.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn from_bytes(bytes: [u8; DESCRIPTOR_SIZE]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; DESCRIPTOR_SIZE] {
        self.0.to_le_bytes()
    }

    /// Present, ring 0, code/data, 32-bit, page-granular segment covering
    /// all 4 GiB.
    pub const fn flat_32(kind: u8) -> Self {
        Self::NULL
            .with_base(0)
            .with_limit(0xFFFFF)
            .with_kind(kind)
            .with_flag(S_BIT, true)
            .with_dpl(0)
            .with_flag(P_BIT, true)
            .with_flag(DB_BIT, true)
            .with_flag(G_BIT, true)
    }

    /// Byte-granular 64 KiB 16-bit segment, as real mode sees it.
    pub const fn real_16(kind: u8) -> Self {
        Self::NULL
            .with_base(0)
            .with_limit(0x0FFFF)
            .with_kind(kind)
            .with_flag(S_BIT, true)
            .with_dpl(0)
            .with_flag(P_BIT, true)
    }

    const fn with_flag(self, bit: u32, on: bool) -> Self {
        if on {
            Self(self.0 | (1 << bit))
        } else {
            Self(self.0 & !(1 << bit))
        }
    }

    const fn flag(self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    pub const fn with_base(self, base: u32) -> Self {
        let cleared = self.0 & !(0xFF_FFFF << BASE_LOW_SHIFT) & !(0xFF << BASE_HIGH_SHIFT);
        Self(
            cleared
                | ((base as u64 & 0xFF_FFFF) << BASE_LOW_SHIFT)
                | (((base as u64 >> 24) & 0xFF) << BASE_HIGH_SHIFT),
        )
    }

    /// 20-bit limit; bits above 19 are dropped.
    pub const fn with_limit(self, limit: u32) -> Self {
        let cleared = self.0 & !LIMIT_LOW_MASK & !(0xF << LIMIT_HIGH_SHIFT);
        Self(
            cleared
                | (limit as u64 & LIMIT_LOW_MASK)
                | (((limit as u64 >> 16) & 0xF) << LIMIT_HIGH_SHIFT),
        )
    }

    pub const fn with_kind(self, kind: u8) -> Self {
        Self((self.0 & !(0xF << TYPE_SHIFT)) | ((kind as u64 & 0xF) << TYPE_SHIFT))
    }

    pub const fn with_dpl(self, dpl: u8) -> Self {
        Self((self.0 & !(0x3 << DPL_SHIFT)) | ((dpl as u64 & 0x3) << DPL_SHIFT))
    }

    pub const fn base(self) -> u32 {
        (((self.0 >> BASE_LOW_SHIFT) & 0xFF_FFFF) | (((self.0 >> BASE_HIGH_SHIFT) & 0xFF) << 24)) as u32
    }

    pub const fn limit(self) -> u32 {
        ((self.0 & LIMIT_LOW_MASK) | (((self.0 >> LIMIT_HIGH_SHIFT) & 0xF) << 16)) as u32
    }

    pub const fn kind(self) -> u8 {
        ((self.0 >> TYPE_SHIFT) & 0xF) as u8
    }

    pub const fn dpl(self) -> u8 {
        ((self.0 >> DPL_SHIFT) & 0x3) as u8
    }

    /// S bit: code/data rather than system.
    pub const fn is_code_or_data(self) -> bool {
        self.flag(S_BIT)
    }

    pub const fn is_present(self) -> bool {
        self.flag(P_BIT)
    }

    pub const fn avl(self) -> bool {
        self.flag(AVL_BIT)
    }

    pub const fn is_32bit(self) -> bool {
        self.flag(DB_BIT)
    }

    pub const fn is_page_granular(self) -> bool {
        self.flag(G_BIT)
    }

    /// Last addressable offset, after granularity scaling.
    pub const fn effective_limit(self) -> u32 {
        if self.is_page_granular() {
            (self.limit() << 12) | 0xFFF
        } else {
            self.limit()
        }
    }
}

impl fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentDescriptor({:#018x})", self.0)
    }
}

impl fmt::Display for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "base={:#010x} limit={:#07x} AVL={} D/B={} DPL={} G={} P={} S={} TYPE={:#x}",
            self.base(),
            self.limit(),
            self.avl() as u8,
            self.is_32bit() as u8,
            self.dpl(),
            self.is_page_granular() as u8,
            self.is_present() as u8,
            self.is_code_or_data() as u8,
            self.kind()
        )
    }
}

// ============================================================================
// DESCRIPTOR TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable<const N: usize> {
    entries: [SegmentDescriptor; N],
}

impl<const N: usize> DescriptorTable<N> {
    pub const ENTRIES: usize = N;

    /// All-null table.
    pub const fn new() -> Self {
        Self { entries: [SegmentDescriptor::NULL; N] }
    }

    /// Flat 4 GiB model: code at `BOOT_CS`, data at `BOOT_DS`, everything else null.
    pub const fn flat() -> Self {
        const { assert!(N >= 4, "flat table needs room for __BOOT_CS and __BOOT_DS") };
        let mut table = Self::new();
        table.entries[(BOOT_CS >> 3) as usize] = SegmentDescriptor::flat_32(TYPE_CODE);
        table.entries[(BOOT_DS >> 3) as usize] = SegmentDescriptor::flat_32(TYPE_DATA);
        table
    }

    pub fn entries(&self) -> &[SegmentDescriptor; N] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<SegmentDescriptor> {
        self.entries.get(index).copied()
    }

    pub const fn limit(&self) -> u16 {
        (N * DESCRIPTOR_SIZE - 1) as u16
    }

    pub const fn pointer(&self, base: u32) -> DescriptorTablePointer {
        DescriptorTablePointer { limit: self.limit(), base }
    }

    pub fn write_to(&self, mem: &mut PhysMemory, base: u32) -> HandoffResult<()> {
        for (i, desc) in self.entries.iter().enumerate() {
            mem.write_slice(base as usize + i * DESCRIPTOR_SIZE, &desc.to_bytes())?;
        }
        Ok(())
    }

    /// Places the table at `base` and points GDTR at it.
    ///
    /// The bytes at `base` must stay untouched for as long as the mode this
    /// table enables is in use, i.e. for the rest of the boot.
    pub fn install<C: CpuRegisters>(
        &self,
        mem: &mut PhysMemory,
        cpu: &mut C,
        base: u32,
    ) -> HandoffResult<DescriptorTablePointer> {
        self.write_to(mem, base)?;
        let gdtr = self.pointer(base);
        cpu.load_gdt(&gdtr);

        let readback = cpu.store_gdt();
        if readback != gdtr {
            tracing::warn!(
                base = readback.base,
                limit = readback.limit,
                "GDTR did not read back as written"
            );
        }
        tracing::debug!(base = gdtr.base, limit = gdtr.limit, "GDT installed");
        Ok(gdtr)
    }
}

impl<const N: usize> Default for DescriptorTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable<5> {
    /// Table for dropping back to real mode: flat 32-bit code/data at 0x08/0x10,
    /// 16-bit 64 KiB code/data at 0x18/0x20.
    pub const fn transition() -> Self {
        let mut table = Self::new();
        table.entries[1] = SegmentDescriptor::flat_32(TYPE_CODE);
        table.entries[2] = SegmentDescriptor::flat_32(TYPE_DATA);
        table.entries[3] = SegmentDescriptor::real_16(TYPE_CODE);
        table.entries[4] = SegmentDescriptor::real_16(TYPE_DATA);
        table
    }
}

/// Table handed to the kernel.
pub type LinuxGdt = DescriptorTable<4>;

/// Reads `gdtr.entries()` descriptors back out of memory.
pub fn read_table(
    mem: &PhysMemory,
    gdtr: &DescriptorTablePointer,
) -> HandoffResult<Vec<SegmentDescriptor>> {
    let raw = mem.read_slice(gdtr.base as usize, gdtr.entries() * DESCRIPTOR_SIZE)?;
    Ok(raw
        .chunks_exact(DESCRIPTOR_SIZE)
        .map(|c| SegmentDescriptor::from_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

// ============================================================================
// TESTS
// ============================================================================
