#![allow(dead_code)]
// linux.rs
//!
//! Linux x86 boot protocol: the zero page ("boot_params") and the e820
//! memory map handed to the kernel through it.
//!
//! Every field is addressed by its byte offset from the start of the page
//! instead of through a packed struct, so each offset is visible and tested.

use std::fmt;

use crate::error::{HandoffError, HandoffResult};

// ============================================================================
// ZERO PAGE LAYOUT
// ============================================================================

pub const ZERO_PAGE_SIZE: usize = 4096;
pub const SECTOR_SIZE: usize = 512;

/// `setup_sects == 0` means 4 for historical reasons.
pub const DEFAULT_SETUP_SECTS: u8 = 4;

pub const E820_ENTRIES: usize = 0x1E8;
/// Start of `struct setup_header`; everything below is loader scratch.
pub const SETUP_HEADER: usize = 0x1F1;
pub const SETUP_SECTS: usize = 0x1F1;
pub const SYSSIZE: usize = 0x1F4;
pub const VID_MODE: usize = 0x1FA;
pub const BOOT_FLAG: usize = 0x1FE;
pub const JUMP: usize = 0x200;
pub const HEADER: usize = 0x202;
pub const VERSION: usize = 0x206;
pub const TYPE_OF_LOADER: usize = 0x210;
pub const LOADFLAGS: usize = 0x211;
pub const RAMDISK_IMAGE: usize = 0x218;
pub const RAMDISK_SIZE: usize = 0x21C;
pub const CMD_LINE_PTR: usize = 0x228;
pub const CMDLINE_SIZE: usize = 0x238;
pub const E820_TABLE: usize = 0x2D0;

pub const E820_MAX_ENTRIES: usize = 128;
pub const E820_ENTRY_SIZE: usize = 20;

pub const BOOT_FLAG_MAGIC: u16 = 0xAA55;
/// "HdrS"
pub const HDRS_MAGIC: u32 = 0x5372_6448;

/// `vga=normal`
pub const VID_MODE_NORMAL: u16 = 0xFFFF;
/// Loader not known to the kernel.
pub const LOADER_TYPE_OTHER: u8 = 0xFF;
/// LOADED_HIGH only: no heap, not quiet, segments reloaded by the kernel.
pub const LOADFLAGS_LOADED_HIGH: u8 = 0x01;

/// First protocol version that publishes `cmdline_size`.
pub const PROTOCOL_CMDLINE_SIZE: u16 = 0x0206;
/// Command line limit assumed for older kernels.
pub const LEGACY_CMDLINE_MAX: u32 = 255;

fn le16(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

fn le32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn le64(raw: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[off..off + 8]);
    u64::from_le_bytes(b)
}

// ============================================================================
// SETUP HEADER
// ============================================================================

/// The handful of setup-header fields the relocator needs, as found in the
/// kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    /// Raw value; see [`SetupHeader::setup_sects`].
    pub raw_setup_sects: u8,
    pub syssize: u32,
    pub boot_flag: u16,
    pub jump: u16,
    pub header: u32,
    pub version: u16,
    pub cmdline_size: u32,
}

impl SetupHeader {
    /// Bytes needed to read every field up to and including `jump`.
    pub const MIN_LEN: usize = JUMP + 2;

    /// Reads the header from the start of a bzImage (or a zero page).
    pub fn parse(raw: &[u8]) -> HandoffResult<Self> {
        if raw.len() < Self::MIN_LEN {
            return Err(HandoffError::PayloadTruncated {
                needed: Self::MIN_LEN,
                actual: raw.len(),
            });
        }

        let header = if raw.len() >= HEADER + 4 { le32(raw, HEADER) } else { 0 };
        let version = if header == HDRS_MAGIC && raw.len() >= VERSION + 2 {
            le16(raw, VERSION)
        } else {
            0
        };
        let cmdline_size = if version >= PROTOCOL_CMDLINE_SIZE && raw.len() >= CMDLINE_SIZE + 4 {
            le32(raw, CMDLINE_SIZE)
        } else {
            LEGACY_CMDLINE_MAX
        };

        Ok(Self {
            raw_setup_sects: raw[SETUP_SECTS],
            syssize: le32(raw, SYSSIZE),
            boot_flag: le16(raw, BOOT_FLAG),
            jump: le16(raw, JUMP),
            header,
            version,
            cmdline_size,
        })
    }

    pub fn setup_sects(&self) -> u8 {
        if self.raw_setup_sects == 0 {
            DEFAULT_SETUP_SECTS
        } else {
            self.raw_setup_sects
        }
    }

    /// Bytes of the image copied into the zero page.
    ///
    /// The high byte of the `jump` instruction is the offset of the end of
    /// the header, relative to 0x202.
    pub fn control_block_size(&self) -> usize {
        HEADER + (self.jump >> 8) as usize
    }

    /// Real-mode setup code plus boot sector.
    pub fn setup_size(&self) -> usize {
        (self.setup_sects() as usize + 1) * SECTOR_SIZE
    }

    /// Offset of the protected-mode body inside the image.
    pub fn body_offset(&self) -> usize {
        self.setup_size()
    }

    /// Size of the protected-mode body (`syssize` counts 16-byte paragraphs).
    pub fn body_size(&self) -> u64 {
        self.syssize as u64 * 16
    }

    pub fn has_signature(&self) -> bool {
        self.header == HDRS_MAGIC
    }

    pub fn protocol(&self) -> (u8, u8) {
        ((self.version >> 8) as u8, self.version as u8)
    }
}

// ============================================================================
// E820 MEMORY MAP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Kind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Unusable,
    Other(u32),
}

impl E820Kind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Unusable,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Usable => 1,
            Self::Reserved => 2,
            Self::AcpiReclaimable => 3,
            Self::AcpiNvs => 4,
            Self::Unusable => 5,
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for E820Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usable => write!(f, "usable"),
            Self::Reserved => write!(f, "reserved"),
            Self::AcpiReclaimable => write!(f, "ACPI data"),
            Self::AcpiNvs => write!(f, "ACPI NVS"),
            Self::Unusable => write!(f, "unusable"),
            Self::Other(raw) => write!(f, "type {}", raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub kind: E820Kind,
}

impl E820Entry {
    const EMPTY: Self = Self { addr: 0, size: 0, kind: E820Kind::Other(0) };

    pub const fn new(addr: u64, size: u64, kind: E820Kind) -> Self {
        Self { addr, size, kind }
    }

    /// One past the last byte; saturates instead of wrapping.
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }

    pub fn to_bytes(&self) -> [u8; E820_ENTRY_SIZE] {
        let mut raw = [0u8; E820_ENTRY_SIZE];
        raw[0..8].copy_from_slice(&self.addr.to_le_bytes());
        raw[8..16].copy_from_slice(&self.size.to_le_bytes());
        raw[16..20].copy_from_slice(&self.kind.raw().to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8; E820_ENTRY_SIZE]) -> Self {
        Self {
            addr: le64(raw, 0),
            size: le64(raw, 8),
            kind: E820Kind::from_raw(le32(raw, 16)),
        }
    }
}

impl fmt::Display for E820Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[mem {:#018x}-{:#018x}] {}",
            self.addr,
            self.end().saturating_sub(1),
            self.kind
        )
    }
}

/// Ordered, non-overlapping e820 entries in a fixed 128-slot array, the
/// capacity of the zero page's table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    entries: [E820Entry; E820_MAX_ENTRIES],
    len: usize,
}

impl MemoryMap {
    pub const fn new() -> Self {
        Self {
            entries: [E820Entry::EMPTY; E820_MAX_ENTRIES],
            len: 0,
        }
    }

    /// The thin client's map: low RAM minus its last page, that page
    /// reserved, and everything from 640 KiB up as usable.
    ///
    /// The reserved page is there only to keep the map longer than one
    /// entry; the kernel ignores single-entry maps.
    pub fn reference(ram_size: u64) -> HandoffResult<Self> {
        const LOW_RAM_END: u64 = 0x9F000;
        const HIGH_RAM_START: u64 = 0xA0000;

        if ram_size <= HIGH_RAM_START {
            return Err(HandoffError::InvalidConfiguration(format!(
                "RAM size {:#x} does not reach past 640 KiB",
                ram_size
            )));
        }

        let mut map = Self::new();
        map.push(E820Entry::new(0, LOW_RAM_END, E820Kind::Usable))?;
        map.push(E820Entry::new(LOW_RAM_END, HIGH_RAM_START - LOW_RAM_END, E820Kind::Reserved))?;
        map.push(E820Entry::new(HIGH_RAM_START, ram_size - HIGH_RAM_START, E820Kind::Usable))?;
        Ok(map)
    }

    /// Reads a raw table of 20-byte e820 records as a BIOS or loader would
    /// leave it. Records are sorted by address first; overlaps are rejected.
    pub fn parse(raw: &[u8]) -> HandoffResult<Self> {
        if raw.len() % E820_ENTRY_SIZE != 0 {
            return Err(HandoffError::MemoryMapMalformed(raw.len()));
        }
        let count = raw.len() / E820_ENTRY_SIZE;
        if count > E820_MAX_ENTRIES {
            return Err(HandoffError::MemoryMapFull);
        }

        let mut staged = [E820Entry::EMPTY; E820_MAX_ENTRIES];
        for (slot, chunk) in staged.iter_mut().zip(raw.chunks_exact(E820_ENTRY_SIZE)) {
            let mut record = [0u8; E820_ENTRY_SIZE];
            record.copy_from_slice(chunk);
            *slot = E820Entry::from_bytes(&record);
        }
        staged[..count].sort_unstable_by_key(|e| e.addr);

        let mut map = Self::new();
        for entry in &staged[..count] {
            map.push(*entry)?;
        }
        Ok(map)
    }

    /// Appends an entry that must start at or after the end of the last one.
    pub fn push(&mut self, entry: E820Entry) -> HandoffResult<()> {
        if self.len == E820_MAX_ENTRIES {
            return Err(HandoffError::MemoryMapFull);
        }
        if entry.size == 0 {
            return Err(HandoffError::MemoryMapEmptyEntry(self.len));
        }
        if entry.addr.checked_add(entry.size).is_none() {
            return Err(HandoffError::MemoryMapDisorder { index: self.len, addr: entry.addr });
        }
        if let Some(last) = self.last() {
            if entry.addr < last.end() {
                return Err(HandoffError::MemoryMapDisorder { index: self.len, addr: entry.addr });
            }
        }
        self.entries[self.len] = entry;
        self.len += 1;
        Ok(())
    }

    /// Checks the map is fit to hand to the kernel.
    pub fn validate(&self) -> HandoffResult<()> {
        if self.len < 2 {
            return Err(HandoffError::MemoryMapTooShort(self.len));
        }
        for (i, pair) in self.entries().windows(2).enumerate() {
            if pair[1].addr < pair[0].end() {
                return Err(HandoffError::MemoryMapDisorder { index: i + 1, addr: pair[1].addr });
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[E820Entry] {
        &self.entries[..self.len]
    }

    pub fn last(&self) -> Option<&E820Entry> {
        self.entries().last()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn usable_bytes(&self) -> u64 {
        self.entries()
            .iter()
            .filter(|e| e.kind == E820Kind::Usable)
            .map(|e| e.size)
            .sum()
    }

    /// True if `[addr, addr + len)` is covered by usable entries that follow
    /// one another with no gap.
    pub fn is_usable(&self, addr: u64, len: u64) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut covered = addr;
        for e in self.entries() {
            if e.end() <= covered {
                continue;
            }
            if e.addr > covered || e.kind != E820Kind::Usable {
                return false;
            }
            covered = e.end();
            if covered >= end {
                return true;
            }
        }
        false
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

// ============================================================================
// ZERO PAGE
// ============================================================================

/// A zero page under construction. Built in this buffer, then written to
/// its physical address in one piece.
#[derive(Clone, PartialEq, Eq)]
pub struct ZeroPage {
    bytes: [u8; ZERO_PAGE_SIZE],
}

impl ZeroPage {
    pub const fn new() -> Self {
        Self { bytes: [0; ZERO_PAGE_SIZE] }
    }

    pub fn from_bytes(bytes: [u8; ZERO_PAGE_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; ZERO_PAGE_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; ZERO_PAGE_SIZE] {
        &mut self.bytes
    }

    pub fn setup_header(&self) -> HandoffResult<SetupHeader> {
        SetupHeader::parse(&self.bytes)
    }

    pub fn u8_at(&self, off: usize) -> u8 {
        self.bytes[off]
    }

    pub fn u16_at(&self, off: usize) -> u16 {
        le16(&self.bytes, off)
    }

    pub fn u32_at(&self, off: usize) -> u32 {
        le32(&self.bytes, off)
    }

    fn put_u16(&mut self, off: usize, val: u16) {
        self.bytes[off..off + 2].copy_from_slice(&val.to_le_bytes());
    }

    fn put_u32(&mut self, off: usize, val: u32) {
        self.bytes[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    pub fn set_vid_mode(&mut self, mode: u16) {
        self.put_u16(VID_MODE, mode);
    }

    pub fn set_type_of_loader(&mut self, loader: u8) {
        self.bytes[TYPE_OF_LOADER] = loader;
    }

    pub fn set_loadflags(&mut self, flags: u8) {
        self.bytes[LOADFLAGS] = flags;
    }

    pub fn set_cmd_line_ptr(&mut self, addr: u32) {
        self.put_u32(CMD_LINE_PTR, addr);
    }

    /// `None` clears both ramdisk fields.
    pub fn set_ramdisk(&mut self, ramdisk: Option<(u32, u32)>) {
        let (image, size) = ramdisk.unwrap_or((0, 0));
        self.put_u32(RAMDISK_IMAGE, image);
        self.put_u32(RAMDISK_SIZE, size);
    }

    /// Writes the map and its entry count; unused table slots are zeroed.
    pub fn set_memory_map(&mut self, map: &MemoryMap) {
        let table = E820_TABLE..E820_TABLE + E820_MAX_ENTRIES * E820_ENTRY_SIZE;
        self.bytes[table].fill(0);
        for (i, entry) in map.entries().iter().enumerate() {
            let off = E820_TABLE + i * E820_ENTRY_SIZE;
            self.bytes[off..off + E820_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }
        self.bytes[E820_ENTRIES] = map.len() as u8;
    }

    /// Reads the e820 table back, trusting `e820_entries`.
    pub fn memory_map(&self) -> HandoffResult<MemoryMap> {
        let count = (self.bytes[E820_ENTRIES] as usize).min(E820_MAX_ENTRIES);
        MemoryMap::parse(&self.bytes[E820_TABLE..E820_TABLE + count * E820_ENTRY_SIZE])
    }
}

impl Default for ZeroPage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ZeroPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroPage")
            .field("setup_sects", &self.u8_at(SETUP_SECTS))
            .field("syssize", &self.u32_at(SYSSIZE))
            .field("vid_mode", &format_args!("{:#06x}", self.u16_at(VID_MODE)))
            .field("type_of_loader", &format_args!("{:#04x}", self.u8_at(TYPE_OF_LOADER)))
            .field("loadflags", &format_args!("{:#04x}", self.u8_at(LOADFLAGS)))
            .field("cmd_line_ptr", &format_args!("{:#010x}", self.u32_at(CMD_LINE_PTR)))
            .field("ramdisk_image", &format_args!("{:#010x}", self.u32_at(RAMDISK_IMAGE)))
            .field("ramdisk_size", &self.u32_at(RAMDISK_SIZE))
            .field("e820_entries", &self.u8_at(E820_ENTRIES))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
