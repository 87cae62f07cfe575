//! Byte view over a translated user range
//!
//! A [`MappedRegion`] is a snapshot of the page-table translation of
//! `[va, va + len)` taken under the owning process's lock. Contiguous
//! virtual bytes may live in scattered frames, so every access is split at
//! page boundaries.

use crate::error::{Result, ShareError};
use crate::phys::{page_round_down, PhysMemory, PAGE_SIZE};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Translated view of a user address range
pub struct MappedRegion {
    phys: Arc<PhysMemory>,
    va: usize,
    len: usize,
    /// Physical address of each page, starting at `page_round_down(va)`
    frames: Vec<usize>,
}

impl MappedRegion {
    pub(crate) fn new(phys: Arc<PhysMemory>, va: usize, len: usize, frames: Vec<usize>) -> Self {
        Self {
            phys,
            va,
            len,
            frames,
        }
    }

    /// Virtual address of the first byte
    #[inline(always)]
    pub fn va(&self) -> usize {
        self.va
    }

    /// Length of the view in bytes
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical frames backing the view
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let (ptr, avail) = self.locate(offset + done)?;
            let n = avail.min(buf.len() - done);
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, buf[done..].as_mut_ptr(), n);
            }
            done += n;
        }
        Ok(())
    }

    /// Copy `data` into the view starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let (ptr, avail) = self.locate(offset + done)?;
            let n = avail.min(data.len() - done);
            unsafe {
                std::ptr::copy_nonoverlapping(data[done..].as_ptr(), ptr, n);
            }
            done += n;
        }
        Ok(())
    }

    /// Read `len` bytes starting at `offset` into a new buffer
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes)?;
        Ok(u32::from_ne_bytes(bytes))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_ne_bytes())
    }

    /// Atomic view of the naturally aligned word at `offset`
    ///
    /// An aligned word never straddles a page, so it lives in one frame.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check(offset, 4)?;
        if (self.va + offset) % 4 != 0 {
            return Err(ShareError::InvalidRange {
                va: self.va + offset,
                size: 4,
            });
        }
        let (ptr, _) = self.locate(offset)?;
        // SAFETY: the pointer is 4-byte aligned, inside a live frame of the
        // pool held by `self.phys`, and the word is only accessed atomically
        // by the handoff protocol.
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShareError::InvalidRange {
                va: self.va.wrapping_add(offset),
                size: len,
            }),
        }
    }

    /// Host pointer for the byte at `offset` and the bytes left in its page
    fn locate(&self, offset: usize) -> Result<(*mut u8, usize)> {
        let va = self.va + offset;
        let index = (page_round_down(va) - page_round_down(self.va)) / PAGE_SIZE;
        let in_page = va % PAGE_SIZE;
        let pa = self
            .frames
            .get(index)
            .copied()
            .ok_or(ShareError::InvalidRange { va, size: 1 })?;
        let ptr = self
            .phys
            .frame_ptr(pa + in_page)
            .ok_or(ShareError::PermissionDenied { va })?;
        Ok((ptr, PAGE_SIZE - in_page))
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("va", &format_args!("0x{:x}", self.va))
            .field("len", &self.len)
            .field("pages", &self.frames.len())
            .finish()
    }
}
