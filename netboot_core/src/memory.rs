#![allow(dead_code)]

use std::ptr;
use libc::{
    c_void, mmap, munmap,
    MAP_PRIVATE, MAP_ANONYMOUS, PROT_READ, PROT_WRITE, MAP_FAILED,
};

use crate::error::{HandoffError, HandoffResult};


/// Window onto physical memory, indexed by physical address.
///
/// On the target the window is identity-mapped RAM starting at address 0
/// (`from_raw`). Hosted, it is an anonymous mapping standing in for the
/// thin client's RAM (`new`), so every table can be checked byte by byte.
pub struct PhysMemory {
    ptr: *mut u8,
    len: usize,
    owned: bool,
}


unsafe impl Send for PhysMemory {}

impl PhysMemory {

    pub fn new(size: usize) -> HandoffResult<Self> {

        let page_mask = 4096 - 1;
        let aligned_size = (size + page_mask) & !page_mask;

        unsafe {

            let ptr = mmap(
                ptr::null_mut(),
                aligned_size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            );

            if ptr == MAP_FAILED {
                return Err(HandoffError::MemoryAllocation(format!(
                    "mmap failed (Size: {} KiB)",
                    aligned_size / 1024
                )));
            }

            // Anonymous mappings are zero-filled; real RAM is not.
            ptr::write_bytes(ptr as *mut u8, 0, aligned_size);

            tracing::debug!(size_kib = size / 1024, "Physical memory window mapped");

            Ok(Self {
                ptr: ptr as *mut u8,
                len: size,
                owned: true,
            })
        }
    }

    /// Wraps already-present memory without taking ownership.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes for the lifetime
    /// of the returned value, and nothing else may access it concurrently.
    /// On the target `base` is null (identity mapping from address 0).
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self {
            ptr: base,
            len,
            owned: false,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    fn check(&self, addr: usize, len: usize) -> Option<()> {
        match addr.checked_add(len) {
            Some(end) if end <= self.len => Some(()),
            _ => None,
        }
    }

    pub fn write_slice(&mut self, addr: usize, data: &[u8]) -> HandoffResult<()> {
        self.check(addr, data.len()).ok_or(HandoffError::MemoryWrite {
            addr: addr as u64,
            len: data.len(),
            limit: self.len,
        })?;
        unsafe {
            let dest = self.ptr.wrapping_add(addr);
            ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }
        Ok(())
    }

    pub fn read_slice(&self, addr: usize, len: usize) -> HandoffResult<&[u8]> {
        self.check(addr, len).ok_or(HandoffError::MemoryRead {
            addr: addr as u64,
            len,
            limit: self.len,
        })?;
        unsafe {
            let src = self.ptr.wrapping_add(addr);
            Ok(std::slice::from_raw_parts(src, len))
        }
    }

    pub fn fill(&mut self, addr: usize, len: usize, byte: u8) -> HandoffResult<()> {
        self.check(addr, len).ok_or(HandoffError::MemoryWrite {
            addr: addr as u64,
            len,
            limit: self.len,
        })?;
        unsafe {
            ptr::write_bytes(self.ptr.wrapping_add(addr), byte, len);
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> HandoffResult<()> {
        self.check(src, len).ok_or(HandoffError::MemoryRead {
            addr: src as u64,
            len,
            limit: self.len,
        })?;
        self.check(dst, len).ok_or(HandoffError::MemoryWrite {
            addr: dst as u64,
            len,
            limit: self.len,
        })?;
        unsafe {
            ptr::copy(self.ptr.wrapping_add(src), self.ptr.wrapping_add(dst), len);
        }
        Ok(())
    }



    pub fn write_u8(&mut self, addr: usize, val: u8) -> HandoffResult<()> {
        self.write_slice(addr, &[val])
    }

    pub fn write_u16(&mut self, addr: usize, val: u16) -> HandoffResult<()> {
        self.write_slice(addr, &val.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: usize, val: u32) -> HandoffResult<()> {
        self.write_slice(addr, &val.to_le_bytes())
    }

    pub fn read_u8(&self, addr: usize) -> HandoffResult<u8> {
        Ok(self.read_slice(addr, 1)?[0])
    }

    pub fn read_u16(&self, addr: usize) -> HandoffResult<u16> {
        let b = self.read_slice(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, addr: usize) -> HandoffResult<u32> {
        let b = self.read_slice(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {


        if self.owned && !self.ptr.is_null() {
            unsafe {
                munmap(self.ptr as *mut c_void, self.len);
            }
        }
    }
}





#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_memory_is_zeroed() {
        let mem = PhysMemory::new(0x2000).unwrap();
        assert_eq!(mem.len(), 0x2000);
        assert!(mem.read_slice(0, 0x2000).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scalar_round_trip_is_little_endian() {
        let mut mem = PhysMemory::new(0x1000).unwrap();
        mem.write_u32(0x10, 0x1234_5678).unwrap();
        assert_eq!(mem.read_slice(0x10, 4).unwrap(), &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(mem.read_u16(0x12).unwrap(), 0x1234);
    }

    #[test]
    fn test_out_of_bounds_access_is_rejected() {
        let mut mem = PhysMemory::new(0x1000).unwrap();
        assert!(matches!(
            mem.write_slice(0xFFE, &[1, 2, 3]),
            Err(HandoffError::MemoryWrite { addr: 0xFFE, len: 3, .. })
        ));
        assert!(matches!(mem.read_slice(usize::MAX, 2), Err(HandoffError::MemoryRead { .. })));
        assert!(mem.fill(0x800, 0x801, 0).is_err());
    }

    #[test]
    fn test_copy_within_handles_overlap() {
        let mut mem = PhysMemory::new(0x1000).unwrap();
        mem.write_slice(0x100, &[1, 2, 3, 4]).unwrap();
        mem.copy_within(0x100, 0x102, 4).unwrap();
        assert_eq!(mem.read_slice(0x100, 6).unwrap(), &[1, 2, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fill() {
        let mut mem = PhysMemory::new(0x1000).unwrap();
        mem.fill(0x20, 8, 0xFF).unwrap();
        assert_eq!(mem.read_u32(0x24).unwrap(), 0xFFFF_FFFF);
        assert_eq!(mem.read_u8(0x28).unwrap(), 0);
    }
}
