//! User address space: page table plus size accounting

use crate::error::{Result, ShareError};
use crate::page_table::{PageFlags, PageTable, Pte};
use crate::phys::{page_round_down, page_round_up, PhysMemory, PAGE_SIZE};
use crate::region::MappedRegion;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Highest user virtual address on Sv39 (one bit less than the maximum to
/// avoid sign extension)
pub const MAX_VA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Record of a shared region installed into this space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GrantRecord {
    pub size: usize,
    /// Size of the space before the grant was installed
    pub prior_size: usize,
}

/// One process's view of memory
#[derive(Debug)]
pub struct AddressSpace {
    page_table: PageTable,
    size: usize,
    max_va: usize,
    grants: BTreeMap<usize, GrantRecord>,
}

impl AddressSpace {
    pub fn new(max_va: usize) -> Self {
        Self {
            page_table: PageTable::new(),
            size: 0,
            max_va,
            grants: BTreeMap::new(),
        }
    }

    /// Current size in bytes; user memory is `[0, size)`
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn max_va(&self) -> usize {
        self.max_va
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn grants(&self) -> &BTreeMap<usize, GrantRecord> {
        &self.grants
    }

    pub(crate) fn grants_mut(&mut self) -> &mut BTreeMap<usize, GrantRecord> {
        &mut self.grants
    }

    /// Grow by `n` bytes with fresh zeroed pages; returns the old size
    pub fn grow(&mut self, phys: &PhysMemory, n: usize) -> Result<usize> {
        let old = self.size;
        let new = old
            .checked_add(n)
            .filter(|&end| end <= self.max_va)
            .ok_or(ShareError::InvalidRange { va: old, size: n })?;

        let mut installed = Vec::new();
        let mut va = page_round_up(old);
        while va < new {
            let pa = match phys.alloc_frame() {
                Ok(pa) => pa,
                Err(e) => {
                    self.rollback(phys, &installed);
                    return Err(e);
                }
            };
            let pte = Pte::Owned {
                pa,
                flags: PageFlags::USER_RW,
            };
            if self.page_table.map(va, pte).is_err() {
                phys.free_frame(pa);
                self.rollback(phys, &installed);
                return Err(ShareError::Overlap { va });
            }
            installed.push(va);
            va += PAGE_SIZE;
        }

        self.size = new;
        Ok(old)
    }

    /// Shrink by `n` bytes; returns the old size
    ///
    /// Owned frames above the new size are freed, shared aliases are only
    /// dropped from the table.
    pub fn shrink(&mut self, phys: &PhysMemory, n: usize) -> Result<usize> {
        let old = self.size;
        let new = old
            .checked_sub(n)
            .ok_or(ShareError::InvalidRange { va: old, size: n })?;

        let doomed: Vec<usize> = self
            .page_table
            .range(page_round_up(new), page_round_up(old))
            .map(|(va, _)| va)
            .collect();
        self.rollback(phys, &doomed);
        self.grants.retain(|&base, _| base < new);

        self.size = new;
        Ok(old)
    }

    /// Strip user access from the page holding `va`
    pub fn clear_user(&mut self, va: usize) -> Result<()> {
        let page = page_round_down(va);
        let flags = self
            .page_table
            .lookup(page)
            .map(|pte| pte.flags() - PageFlags::USER)
            .ok_or(ShareError::PermissionDenied { va })?;
        self.page_table
            .update_flags(page, flags)
            .map_err(|_| ShareError::PermissionDenied { va })
    }

    /// Physical address backing `va`, if mapped
    pub fn translate(&self, va: usize) -> Option<usize> {
        let pte = self.page_table.lookup(page_round_down(va))?;
        pte.is_present().then(|| pte.pa() + va % PAGE_SIZE)
    }

    /// Snapshot the translation of a user range
    ///
    /// Every page must be present and user-accessible.
    pub fn region(&self, phys: &Arc<PhysMemory>, va: usize, len: usize) -> Result<MappedRegion> {
        let end = va
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or(ShareError::InvalidRange { va, size: len })?;

        let mut frames = Vec::new();
        let mut page = page_round_down(va);
        while page < end {
            match self.page_table.lookup(page) {
                Some(pte) if pte.is_present() && pte.is_user() => frames.push(pte.pa()),
                _ => return Err(ShareError::PermissionDenied { va: page }),
            }
            page += PAGE_SIZE;
        }

        Ok(MappedRegion::new(phys.clone(), va, len, frames))
    }

    /// Drop every mapping, freeing owned frames
    pub fn release_all(&mut self, phys: &PhysMemory) {
        let all: Vec<usize> = self.page_table.iter().map(|(va, _)| va).collect();
        self.rollback(phys, &all);
        self.grants.clear();
        self.size = 0;
    }

    fn rollback(&mut self, phys: &PhysMemory, pages: &[usize]) {
        for &va in pages {
            if let Ok(Pte::Owned { pa, .. }) = self.page_table.unmap(va) {
                phys.free_frame(pa);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phys() -> Arc<PhysMemory> {
        Arc::new(PhysMemory::new(16).unwrap())
    }

    #[test]
    fn test_grow_allocates_whole_pages() {
        let phys = phys();
        let mut space = AddressSpace::new(MAX_VA);

        assert_eq!(space.grow(&phys, 5000).unwrap(), 0);
        assert_eq!(space.size(), 5000);
        assert_eq!(space.page_table().len(), 2);

        // Still inside the second page
        space.grow(&phys, 100).unwrap();
        assert_eq!(space.page_table().len(), 2);

        space.grow(&phys, 4096).unwrap();
        assert_eq!(space.page_table().len(), 3);
        assert_eq!(phys.free_frames(), 13);
    }

    #[test]
    fn test_grow_rolls_back_on_exhaustion() {
        let phys = Arc::new(PhysMemory::new(2).unwrap());
        let mut space = AddressSpace::new(MAX_VA);

        assert!(matches!(
            space.grow(&phys, 3 * PAGE_SIZE),
            Err(ShareError::OutOfMemory)
        ));
        assert_eq!(space.size(), 0);
        assert!(space.page_table().is_empty());
        assert_eq!(phys.free_frames(), 2);
    }

    #[test]
    fn test_grow_past_max_va() {
        let phys = phys();
        let mut space = AddressSpace::new(2 * PAGE_SIZE);
        assert!(space.grow(&phys, 3 * PAGE_SIZE).is_err());
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn test_shrink_frees_frames() {
        let phys = phys();
        let mut space = AddressSpace::new(MAX_VA);
        space.grow(&phys, 3 * PAGE_SIZE).unwrap();

        assert_eq!(space.shrink(&phys, PAGE_SIZE + 1).unwrap(), 3 * PAGE_SIZE);
        assert_eq!(space.size(), 2 * PAGE_SIZE - 1);
        assert_eq!(space.page_table().len(), 2);
        assert_eq!(phys.free_frames(), 14);
        assert!(space.shrink(&phys, 3 * PAGE_SIZE).is_err());
    }

    #[test]
    fn test_region_requires_user_pages() {
        let phys = phys();
        let mut space = AddressSpace::new(MAX_VA);
        space.grow(&phys, 2 * PAGE_SIZE).unwrap();

        assert!(space.region(&phys, 100, 5000).is_ok());
        space.clear_user(PAGE_SIZE + 10).unwrap();
        assert!(matches!(
            space.region(&phys, 100, 5000),
            Err(ShareError::PermissionDenied { va: PAGE_SIZE })
        ));
        assert!(space.region(&phys, 0, 2 * PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn test_translate() {
        let phys = phys();
        let mut space = AddressSpace::new(MAX_VA);
        space.grow(&phys, PAGE_SIZE).unwrap();

        let pa = space.translate(12).unwrap();
        assert_eq!(pa % PAGE_SIZE, 12);
        assert_eq!(space.translate(PAGE_SIZE), None);
    }

    #[test]
    fn test_release_all() {
        let phys = phys();
        let mut space = AddressSpace::new(MAX_VA);
        space.grow(&phys, 4 * PAGE_SIZE).unwrap();
        space.release_all(&phys);
        assert_eq!(phys.free_frames(), 16);
        assert_eq!(space.size(), 0);
    }
}
