//! Physical frame pool backed by an anonymous host mapping

use crate::error::{Result, ShareError};
use parking_lot::Mutex;
use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ptr::NonNull;

/// Size of a page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Physical address of the first frame
pub const PHYS_BASE: usize = 0x8000_0000;

/// Round `addr` down to a page boundary
#[inline(always)]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to a page boundary
///
/// Saturates to the last page boundary instead of overflowing.
#[inline(always)]
pub const fn page_round_up(addr: usize) -> usize {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => page_round_down(v),
        None => page_round_down(usize::MAX),
    }
}

/// Pool of page frames standing in for machine memory
///
/// Frame contents are plain bytes with no lock of their own. Only the
/// free list is synchronized.
pub struct PhysMemory {
    base: NonNull<u8>,
    frames: usize,
    /// Bytes covered by the mapping
    len: usize,
    free: Mutex<Vec<usize>>,
}

// SAFETY: the backing mapping lives as long as the pool and frame contents
// are only reached through raw pointers whose users follow the descriptor
// handoff protocol.
unsafe impl Send for PhysMemory {}
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    /// Reserve `frames` page frames
    pub fn new(frames: usize) -> Result<Self> {
        if frames == 0 {
            return Err(ShareError::OutOfMemory);
        }
        // The physical window must fit in the address space too
        let len = frames
            .checked_mul(PAGE_SIZE)
            .filter(|len| PHYS_BASE.checked_add(*len).is_some())
            .ok_or(ShareError::OutOfMemory)?;

        let addr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .map_err(|e| ShareError::Mmap(e.into()))?
        };
        let base = NonNull::new(addr.cast::<u8>()).ok_or(ShareError::OutOfMemory)?;

        // Hand out low addresses first
        let free = (0..frames).rev().map(|i| PHYS_BASE + i * PAGE_SIZE).collect();

        Ok(Self {
            base,
            frames,
            len,
            free: Mutex::new(free),
        })
    }

    /// Allocate one zero-filled frame and return its physical address
    pub fn alloc_frame(&self) -> Result<usize> {
        let pa = self.free.lock().pop().ok_or(ShareError::OutOfMemory)?;
        unsafe {
            std::ptr::write_bytes(self.host_ptr(pa), 0, PAGE_SIZE);
        }
        Ok(pa)
    }

    /// Return a frame to the pool
    pub fn free_frame(&self, pa: usize) {
        debug_assert!(self.contains(pa), "freeing foreign frame 0x{pa:x}");
        self.free.lock().push(page_round_down(pa));
    }

    /// Host pointer to the byte at physical address `pa`
    ///
    /// Returns `None` for addresses outside the pool.
    #[inline]
    pub fn frame_ptr(&self, pa: usize) -> Option<*mut u8> {
        self.contains(pa).then(|| self.host_ptr(pa))
    }

    /// Number of frames currently free
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of frames in the pool
    #[inline(always)]
    pub fn total_frames(&self) -> usize {
        self.frames
    }

    #[inline(always)]
    fn contains(&self, pa: usize) -> bool {
        pa >= PHYS_BASE && pa - PHYS_BASE < self.len
    }

    #[inline(always)]
    fn host_ptr(&self, pa: usize) -> *mut u8 {
        unsafe { self.base.as_ptr().add(pa - PHYS_BASE) }
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let phys = PhysMemory::new(4).unwrap();
        assert_eq!(phys.free_frames(), 4);

        let a = phys.alloc_frame().unwrap();
        let b = phys.alloc_frame().unwrap();
        assert_eq!(a, PHYS_BASE);
        assert_eq!(b, PHYS_BASE + PAGE_SIZE);
        assert_eq!(phys.free_frames(), 2);

        phys.free_frame(a);
        assert_eq!(phys.free_frames(), 3);
    }

    #[test]
    fn test_frames_are_zeroed() {
        let phys = PhysMemory::new(1).unwrap();
        let pa = phys.alloc_frame().unwrap();
        let ptr = phys.frame_ptr(pa).unwrap();
        unsafe { std::ptr::write_bytes(ptr, 0xAB, PAGE_SIZE) };
        phys.free_frame(pa);

        let pa = phys.alloc_frame().unwrap();
        let ptr = phys.frame_ptr(pa).unwrap();
        let page = unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE) };
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhaustion() {
        let phys = PhysMemory::new(1).unwrap();
        phys.alloc_frame().unwrap();
        assert!(matches!(phys.alloc_frame(), Err(ShareError::OutOfMemory)));
    }

    #[test]
    fn test_oversized_pool_rejected() {
        assert!(matches!(
            PhysMemory::new(usize::MAX / PAGE_SIZE + 1),
            Err(ShareError::OutOfMemory)
        ));
        assert!(matches!(
            PhysMemory::new(usize::MAX / PAGE_SIZE),
            Err(ShareError::OutOfMemory)
        ));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(page_round_down(5000), 4096);
        assert_eq!(page_round_up(5000), 8192);
        assert_eq!(page_round_up(8192), 8192);
        assert_eq!(page_round_up(0), 0);
    }
}
