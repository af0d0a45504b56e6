// loader.rs
//!
//! Kernel relocator and zero-page builder.
//!
//! The resident loader leaves a whole bzImage in RAM. From it we:
//! 1. copy the setup header into a fresh zero page, erasing loader scratch
//! 2. move the protected-mode body to the fixed load address
//! 3. fill in the fields a boot loader owns (video mode, loader type,
//!    load flags, command line, ramdisk, e820 map)
//!
//! Nothing here jumps to the kernel; see `handoff`.

use crate::error::{HandoffError, HandoffResult};
use crate::linux::{
    MemoryMap, SetupHeader, ZeroPage, BOOT_FLAG_MAGIC, LOADER_TYPE_OTHER, LOADFLAGS_LOADED_HIGH,
    SETUP_HEADER, VID_MODE_NORMAL, ZERO_PAGE_SIZE,
};
use crate::memory::PhysMemory;
use crate::platform::PlatformConfig;

// ============================================================================
// PAYLOAD DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ramdisk {
    pub addr: u32,
    pub size: u32,
}

/// Where the resident loader put each part of the download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPayload {
    /// Start of the raw bzImage (boot sector included).
    pub image_addr: u32,
    pub image_size: u32,
    /// NUL-terminated command line.
    pub cmdline_addr: u32,
    /// Length without the terminator.
    pub cmdline_len: u32,
    pub ramdisk: Option<Ramdisk>,
}

/// Everything the final jump needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandoff {
    pub entry_point: u32,
    /// Goes in `%esi`.
    pub boot_params_addr: u32,
}

fn range_in(mem: &PhysMemory, addr: u64, len: u64) -> bool {
    addr.checked_add(len).is_some_and(|end| end <= mem.len() as u64)
}

// ============================================================================
// HEADER
// ============================================================================

/// Reads and sanity-checks the setup header of the bzImage in memory.
///
/// Everything that could make us copy garbage, or copy past the image, is
/// rejected here, before any byte is moved.
pub fn read_setup_header(mem: &PhysMemory, payload: &BootPayload) -> HandoffResult<SetupHeader> {
    let image_size = payload.image_size as usize;
    if image_size < SetupHeader::MIN_LEN {
        return Err(HandoffError::PayloadTruncated {
            needed: SetupHeader::MIN_LEN,
            actual: image_size,
        });
    }

    let head = mem.read_slice(payload.image_addr as usize, image_size.min(ZERO_PAGE_SIZE))?;
    let hdr = SetupHeader::parse(head)?;

    if hdr.boot_flag != BOOT_FLAG_MAGIC {
        return Err(HandoffError::BadBootFlag(hdr.boot_flag));
    }
    if !hdr.has_signature() {
        tracing::warn!(header = hdr.header, "No HdrS signature; treating as a pre-2.00 kernel");
    }

    let cbs = hdr.control_block_size();
    if cbs > hdr.setup_size() || cbs > ZERO_PAGE_SIZE {
        return Err(HandoffError::ImplausibleHeader(format!(
            "setup header claims {} bytes, setup area holds {}",
            cbs,
            hdr.setup_size()
        )));
    }
    if cbs > image_size {
        return Err(HandoffError::PayloadTruncated { needed: cbs, actual: image_size });
    }

    let body_size = hdr.body_size();
    if body_size == 0 {
        return Err(HandoffError::EmptyKernelBody);
    }
    let body_end = hdr.body_offset() as u64 + body_size;
    if body_end > image_size as u64 {
        return Err(HandoffError::PayloadTruncated {
            needed: body_end.min(usize::MAX as u64) as usize,
            actual: image_size,
        });
    }

    let (major, minor) = hdr.protocol();
    tracing::info!(
        setup_sects = hdr.setup_sects(),
        syssize = hdr.syssize,
        control_block_size = cbs,
        "Kernel setup header valid. Protocol version: {}.{:02}",
        major,
        minor
    );
    Ok(hdr)
}

// ============================================================================
// RELOCATION
// ============================================================================

/// Builds the unpopulated zero page and writes it to `zero_page_addr`.
///
/// The page comes out zero except for `[0x1F1, control_block_size)`, which
/// holds the image's setup header verbatim. Whatever was at the destination
/// before is gone.
pub fn stage_zero_page(
    mem: &mut PhysMemory,
    payload: &BootPayload,
    hdr: &SetupHeader,
    zero_page_addr: u32,
) -> HandoffResult<ZeroPage> {
    let cbs = hdr.control_block_size();
    let mut zero_page = ZeroPage::new();

    let src = mem.read_slice(payload.image_addr as usize, cbs)?;
    zero_page.as_bytes_mut()[..cbs].copy_from_slice(src);
    zero_page.as_bytes_mut()[..SETUP_HEADER].fill(0);

    mem.write_slice(zero_page_addr as usize, zero_page.as_bytes())?;
    tracing::debug!(
        addr = zero_page_addr,
        bytes = cbs,
        "Copied setup header into zero page at {:#x}",
        zero_page_addr
    );
    Ok(zero_page)
}

/// Both ends of the body move must lie inside `mem`.
fn check_body_placement(
    mem: &PhysMemory,
    payload: &BootPayload,
    hdr: &SetupHeader,
    load_addr: u32,
) -> HandoffResult<()> {
    let src = payload.image_addr as u64 + hdr.body_offset() as u64;
    let size = hdr.body_size();
    if !range_in(mem, src, size) {
        return Err(HandoffError::MemoryRead { addr: src, len: size as usize, limit: mem.len() });
    }
    if !range_in(mem, load_addr as u64, size) {
        return Err(HandoffError::MemoryWrite {
            addr: load_addr as u64,
            len: size as usize,
            limit: mem.len(),
        });
    }
    Ok(())
}

/// Moves the protected-mode body to `load_addr`. Returns its size.
pub fn relocate_kernel_body(
    mem: &mut PhysMemory,
    payload: &BootPayload,
    hdr: &SetupHeader,
    load_addr: u32,
) -> HandoffResult<usize> {
    check_body_placement(mem, payload, hdr, load_addr)?;
    let src = payload.image_addr as u64 + hdr.body_offset() as u64;
    let dst = load_addr as u64;
    let size = hdr.body_size();
    let (src, dst, size) = (src as usize, dst as usize, size as usize);

    // The destination is cleared first unless it shares bytes with the source.
    if src + size <= dst || dst + size <= src {
        mem.fill(dst, size, 0)?;
    } else {
        tracing::debug!(src, dst, "Kernel body overlaps its destination; moving in place");
    }
    mem.copy_within(src, dst, size)?;

    tracing::info!(
        size,
        "Copied 32-bit kernel ({} KiB) from {:#010x} to {:#010x}",
        size / 1024,
        src,
        dst
    );
    if let Ok(head) = mem.read_slice(dst, size.min(16)) {
        tracing::trace!("Kernel first bytes at {:#x}: {:02x?}", dst, head);
    }
    Ok(size)
}

/// Fills in the loader-owned zero-page fields.
pub fn populate_zero_page(zero_page: &mut ZeroPage, payload: &BootPayload, map: &MemoryMap) {
    zero_page.set_vid_mode(VID_MODE_NORMAL);
    zero_page.set_type_of_loader(LOADER_TYPE_OTHER);
    zero_page.set_loadflags(LOADFLAGS_LOADED_HIGH);
    zero_page.set_cmd_line_ptr(payload.cmdline_addr);
    zero_page.set_ramdisk(payload.ramdisk.map(|rd| (rd.addr, rd.size)));
    zero_page.set_memory_map(map);
}

fn check_cmdline(mem: &PhysMemory, payload: &BootPayload, hdr: &SetupHeader) -> HandoffResult<()> {
    let len = payload.cmdline_len as usize;
    let text = mem.read_slice(payload.cmdline_addr as usize, len + 1)?;
    if text[len] != 0 {
        tracing::warn!(addr = payload.cmdline_addr, "Command line is not NUL-terminated");
    }
    if payload.cmdline_len > hdr.cmdline_size {
        tracing::warn!(
            len = payload.cmdline_len,
            max = hdr.cmdline_size,
            "Command line longer than the kernel accepts; it will be truncated"
        );
    }
    tracing::info!(cmdline = %String::from_utf8_lossy(&text[..len]), "Kernel command line");
    Ok(())
}

fn check_ramdisk(mem: &PhysMemory, ramdisk: &Ramdisk, map: &MemoryMap) -> HandoffResult<()> {
    if !range_in(mem, ramdisk.addr as u64, ramdisk.size as u64) {
        return Err(HandoffError::MemoryRead {
            addr: ramdisk.addr as u64,
            len: ramdisk.size as usize,
            limit: mem.len(),
        });
    }
    if !map.is_usable(ramdisk.addr as u64, ramdisk.size as u64) {
        tracing::warn!(addr = ramdisk.addr, size = ramdisk.size, "Ramdisk is not in usable RAM");
    }
    tracing::info!(
        size = ramdisk.size,
        "Ramdisk at {:#010x} ({} KiB)",
        ramdisk.addr,
        ramdisk.size / 1024
    );
    Ok(())
}

/// Relocates the kernel and leaves a complete zero page at
/// `platform.zero_page_addr`.
pub fn load_linux(
    mem: &mut PhysMemory,
    platform: &PlatformConfig,
    payload: &BootPayload,
    map: &MemoryMap,
) -> HandoffResult<KernelHandoff> {
    let hdr = read_setup_header(mem, payload)?;
    map.validate()?;

    let body_size = hdr.body_size();
    if !map.is_usable(platform.kernel_load_addr as u64, body_size) {
        return Err(HandoffError::NotUsableRam {
            addr: platform.kernel_load_addr as u64,
            len: body_size,
        });
    }
    check_body_placement(mem, payload, &hdr, platform.kernel_load_addr)?;

    platform.check_cmdline(payload.cmdline_len)?;
    check_cmdline(mem, payload, &hdr)?;
    if let Some(ramdisk) = &payload.ramdisk {
        check_ramdisk(mem, ramdisk, map)?;
    }

    let mut zero_page = stage_zero_page(mem, payload, &hdr, platform.zero_page_addr)?;
    relocate_kernel_body(mem, payload, &hdr, platform.kernel_load_addr)?;

    populate_zero_page(&mut zero_page, payload, map);
    mem.write_slice(platform.zero_page_addr as usize, zero_page.as_bytes())?;

    for entry in map.entries() {
        tracing::debug!("e820: {}", entry);
    }
    tracing::info!(
        e820_entries = map.len(),
        "Zero page written at {:#x}",
        platform.zero_page_addr
    );

    Ok(KernelHandoff {
        entry_point: platform.kernel_load_addr,
        boot_params_addr: platform.zero_page_addr,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux::{
        CMD_LINE_PTR, E820_ENTRIES, LOADFLAGS, RAMDISK_IMAGE, RAMDISK_SIZE, TYPE_OF_LOADER, VID_MODE,
    };

    const MEM_SIZE: usize = 0x0200_0000;
    const IMAGE_ADDR: u32 = 0x0108_0000;
    const CMDLINE: &[u8] = b"console=ttyS0,115200 root=/dev/ram0";

    /// bzImage-shaped bytes: a recognizable scratch pattern below 0x1F1, a
    /// protocol 2.04 header, setup sectors of 0x5E and a body of 0xB0 + i.
    fn synthetic_image(setup_sects: u8, syssize: u32) -> Vec<u8> {
        let sects = if setup_sects == 0 { 4 } else { setup_sects as usize };
        let setup = (sects + 1) * 512;
        let body = syssize as usize * 16;
        let mut image = vec![0x5Eu8; setup + body];
        image[..0x1F1].fill(0xC3);
        image[0x1F1] = setup_sects;
        image[0x1F4..0x1F8].copy_from_slice(&syssize.to_le_bytes());
        image[0x1FA..0x1FC].copy_from_slice(&0xFFFDu16.to_le_bytes());
        image[0x1FE..0x200].copy_from_slice(&0xAA55u16.to_le_bytes());
        image[0x200..0x202].copy_from_slice(&[0xEB, 0x66]);
        image[0x202..0x206].copy_from_slice(b"HdrS");
        image[0x206..0x208].copy_from_slice(&0x0204u16.to_le_bytes());
        image[0x210] = 0;
        image[0x211] = 0x80;
        for (i, b) in image[setup..].iter_mut().enumerate() {
            *b = 0xB0u8.wrapping_add(i as u8);
        }
        image
    }

    fn place(mem: &mut PhysMemory, image: &[u8]) -> BootPayload {
        let platform = PlatformConfig::evo_t30();
        mem.write_slice(IMAGE_ADDR as usize, image).unwrap();
        mem.write_slice(platform.cmdline_addr as usize, CMDLINE).unwrap();
        mem.write_u8(platform.cmdline_addr as usize + CMDLINE.len(), 0).unwrap();
        BootPayload {
            image_addr: IMAGE_ADDR,
            image_size: image.len() as u32,
            cmdline_addr: platform.cmdline_addr,
            cmdline_len: CMDLINE.len() as u32,
            ramdisk: None,
        }
    }

    #[test]
    fn test_relocation_round_trip() {
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let image = synthetic_image(4, 100);
        let payload = place(&mut mem, &image);
        mem.fill(0x0010_0000, 0x1000, 0xEE).unwrap();

        let hdr = read_setup_header(&mem, &payload).unwrap();
        assert_eq!(hdr.body_offset(), 2560);
        let copied = relocate_kernel_body(&mut mem, &payload, &hdr, 0x0010_0000).unwrap();

        assert_eq!(copied, 1600);
        assert_eq!(mem.read_slice(0x0010_0000, 1600).unwrap(), &image[2560..2560 + 1600]);
        // Pre-zeroed for exactly the body size; beyond it is untouched.
        assert_eq!(mem.read_u8(0x0010_0000 + 1600).unwrap(), 0xEE);
    }

    #[test]
    fn test_staging_over_all_ones() {
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let image = synthetic_image(4, 100);
        let payload = place(&mut mem, &image);
        mem.fill(0x0009_0000, ZERO_PAGE_SIZE, 0xFF).unwrap();

        let hdr = read_setup_header(&mem, &payload).unwrap();
        let cbs = hdr.control_block_size();
        assert_eq!(cbs, 0x268);
        stage_zero_page(&mut mem, &payload, &hdr, 0x0009_0000).unwrap();

        let page = mem.read_slice(0x0009_0000, ZERO_PAGE_SIZE).unwrap();
        assert!(page[..0x1F1].iter().all(|&b| b == 0));
        assert_eq!(&page[0x1F1..cbs], &image[0x1F1..cbs]);
        assert!(page[cbs..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_page_is_idempotent() {
        let platform = PlatformConfig::evo_t30();
        let map = MemoryMap::reference(platform.ram_size as u64).unwrap();
        let image = synthetic_image(4, 100);

        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let payload = place(&mut mem, &image);
        load_linux(&mut mem, &platform, &payload, &map).unwrap();
        let first = mem.read_slice(platform.zero_page_addr as usize, ZERO_PAGE_SIZE).unwrap().to_vec();

        mem.fill(platform.zero_page_addr as usize, ZERO_PAGE_SIZE, 0x77).unwrap();
        load_linux(&mut mem, &platform, &payload, &map).unwrap();
        let second = mem.read_slice(platform.zero_page_addr as usize, ZERO_PAGE_SIZE).unwrap();
        assert_eq!(first.as_slice(), second);
    }

    #[test]
    fn test_zero_page_fields() {
        let platform = PlatformConfig::evo_t30();
        let map = MemoryMap::reference(platform.ram_size as u64).unwrap();
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let mut payload = place(&mut mem, &synthetic_image(8, 0x200));
        payload.ramdisk = Some(Ramdisk { addr: 0x0180_0000, size: 0x0004_0000 });

        let handoff = load_linux(&mut mem, &platform, &payload, &map).unwrap();
        assert_eq!(handoff, KernelHandoff { entry_point: 0x0010_0000, boot_params_addr: 0x0009_0000 });

        let zp = 0x0009_0000usize;
        assert_eq!(mem.read_u16(zp + VID_MODE).unwrap(), 0xFFFF);
        assert_eq!(mem.read_u8(zp + TYPE_OF_LOADER).unwrap(), 0xFF);
        assert_eq!(mem.read_u8(zp + LOADFLAGS).unwrap(), 0x01);
        assert_eq!(mem.read_u32(zp + CMD_LINE_PTR).unwrap(), 0x0002_0000);
        assert_eq!(mem.read_u32(zp + RAMDISK_IMAGE).unwrap(), 0x0180_0000);
        assert_eq!(mem.read_u32(zp + RAMDISK_SIZE).unwrap(), 0x0004_0000);
        assert_eq!(mem.read_u8(zp + E820_ENTRIES).unwrap(), 3);
        // setup_sects survives from the image
        assert_eq!(mem.read_u8(zp + 0x1F1).unwrap(), 8);
    }

    #[test]
    fn test_zero_setup_sects_uses_four() {
        let platform = PlatformConfig::evo_t30();
        let map = MemoryMap::reference(platform.ram_size as u64).unwrap();
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let image = synthetic_image(0, 64);
        let payload = place(&mut mem, &image);

        load_linux(&mut mem, &platform, &payload, &map).unwrap();
        assert_eq!(mem.read_slice(0x0010_0000, 1024).unwrap(), &image[2560..2560 + 1024]);
    }

    #[test]
    fn test_bad_boot_flag() {
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let mut image = synthetic_image(4, 100);
        image[0x1FE] = 0;
        let payload = place(&mut mem, &image);
        let err = read_setup_header(&mem, &payload).unwrap_err();
        assert!(matches!(err, HandoffError::BadBootFlag(0xAA00)));
        assert!(err.requires_halt());
    }

    #[test]
    fn test_empty_body_rejected() {
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let payload = place(&mut mem, &synthetic_image(4, 0));
        assert!(matches!(read_setup_header(&mem, &payload), Err(HandoffError::EmptyKernelBody)));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let image = synthetic_image(4, 100);
        let mut payload = place(&mut mem, &image);
        payload.image_size -= 16;
        assert!(matches!(
            read_setup_header(&mem, &payload),
            Err(HandoffError::PayloadTruncated { needed: 4160, actual: 4144 })
        ));

        payload.image_size = 0x100;
        assert!(matches!(
            read_setup_header(&mem, &payload),
            Err(HandoffError::PayloadTruncated { needed: 0x202, .. })
        ));
    }

    #[test]
    fn test_image_shorter_than_control_block() {
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let mut image = synthetic_image(4, 100);
        image.truncate(0x220);
        let payload = place(&mut mem, &image);
        assert!(matches!(
            read_setup_header(&mem, &payload),
            Err(HandoffError::PayloadTruncated { needed: 0x268, actual: 0x220 })
        ));
    }

    #[test]
    fn test_short_memory_map_rejected() {
        let platform = PlatformConfig::evo_t30();
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let payload = place(&mut mem, &synthetic_image(4, 100));
        let mut map = MemoryMap::new();
        map.push(crate::linux::E820Entry::new(0, 0x01D8_0000, crate::linux::E820Kind::Usable))
            .unwrap();
        assert!(matches!(
            load_linux(&mut mem, &platform, &payload, &map),
            Err(HandoffError::MemoryMapTooShort(1))
        ));
    }

    #[test]
    fn test_kernel_outside_usable_ram_rejected() {
        let platform = PlatformConfig::evo_t30();
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let payload = place(&mut mem, &synthetic_image(4, 100));
        let mut map = MemoryMap::new();
        map.push(crate::linux::E820Entry::new(0, 0x9F000, crate::linux::E820Kind::Usable)).unwrap();
        map.push(crate::linux::E820Entry::new(0x9F000, 0x61000, crate::linux::E820Kind::Reserved))
            .unwrap();
        assert!(matches!(
            load_linux(&mut mem, &platform, &payload, &map),
            Err(HandoffError::NotUsableRam { addr: 0x0010_0000, len: 1600 })
        ));
    }

    #[test]
    fn test_kernel_across_adjacent_usable_entries() {
        use crate::linux::{E820Entry, E820Kind};

        let platform = PlatformConfig::evo_t30();
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let image = synthetic_image(4, 100);
        let payload = place(&mut mem, &image);
        let mut map = MemoryMap::new();
        map.push(E820Entry::new(0, 0x9F000, E820Kind::Usable)).unwrap();
        map.push(E820Entry::new(0x9F000, 0x61000, E820Kind::Reserved)).unwrap();
        map.push(E820Entry::new(0x10_0000, 0x400, E820Kind::Usable)).unwrap();
        map.push(E820Entry::new(0x10_0400, 0x01C7_FC00, E820Kind::Usable)).unwrap();

        load_linux(&mut mem, &platform, &payload, &map).unwrap();
        assert_eq!(mem.read_slice(0x0010_0000, 1600).unwrap(), &image[2560..2560 + 1600]);
        assert_eq!(mem.read_u8(0x0009_0000 + crate::linux::E820_ENTRIES).unwrap(), 4);
    }

    #[test]
    fn test_body_outside_ram_leaves_zero_page_alone() {
        let platform = PlatformConfig { kernel_load_addr: 0x01FF_F000, ..PlatformConfig::evo_t30() };
        let mut mem = PhysMemory::new(MEM_SIZE).unwrap();
        let payload = place(&mut mem, &synthetic_image(4, 0x200));
        mem.fill(platform.zero_page_addr as usize, ZERO_PAGE_SIZE, 0x77).unwrap();
        let mut map = MemoryMap::new();
        map.push(crate::linux::E820Entry::new(0, 0x9F000, crate::linux::E820Kind::Usable))
            .unwrap();
        map.push(crate::linux::E820Entry::new(0x10_0000, 0x0400_0000, crate::linux::E820Kind::Usable))
            .unwrap();

        assert!(matches!(
            load_linux(&mut mem, &platform, &payload, &map),
            Err(HandoffError::MemoryWrite { addr: 0x01FF_F000, len: 0x2000, .. })
        ));
        let page = mem.read_slice(platform.zero_page_addr as usize, ZERO_PAGE_SIZE).unwrap();
        assert!(page.iter().all(|&b| b == 0x77));
    }
}
