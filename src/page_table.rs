//! Per-process page table with tagged owned/shared entries

use crate::phys::PAGE_SIZE;
use crate::process::Pid;
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Permission bits stored in a page-table entry
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
    }
}

impl PageFlags {
    /// Flags of an ordinary user data page
    pub const USER_RW: Self = Self::VALID
        .union(Self::READ)
        .union(Self::WRITE)
        .union(Self::USER);
}

/// A leaf page-table entry
///
/// Shared entries alias a frame owned by another address space and are
/// removed without freeing the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pte {
    /// Frame allocated for and owned by this address space
    Owned { pa: usize, flags: PageFlags },
    /// Alias of a frame owned by `owner`
    Shared {
        pa: usize,
        flags: PageFlags,
        owner: Pid,
    },
}

impl Pte {
    /// Physical address of the frame
    #[inline(always)]
    pub fn pa(&self) -> usize {
        match *self {
            Pte::Owned { pa, .. } | Pte::Shared { pa, .. } => pa,
        }
    }

    #[inline(always)]
    pub fn flags(&self) -> PageFlags {
        match *self {
            Pte::Owned { flags, .. } | Pte::Shared { flags, .. } => flags,
        }
    }

    #[inline(always)]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::VALID)
    }

    #[inline(always)]
    pub fn is_user(&self) -> bool {
        self.flags().contains(PageFlags::USER)
    }

    #[inline(always)]
    pub fn is_shared(&self) -> bool {
        matches!(self, Pte::Shared { .. })
    }

    fn with_flags(self, flags: PageFlags) -> Self {
        match self {
            Pte::Owned { pa, .. } => Pte::Owned { pa, flags },
            Pte::Shared { pa, owner, .. } => Pte::Shared { pa, flags, owner },
        }
    }
}

/// Error returned when manipulating page tables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned
    Unaligned,
    /// Slot already holds an entry
    Overlap,
    /// No entry at this address
    NotMapped,
}

/// Sparse single-level page table keyed by page-aligned virtual address
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the entry mapped at page-aligned `va`
    pub fn lookup(&self, va: usize) -> Option<&Pte> {
        if va % PAGE_SIZE != 0 {
            return None;
        }
        self.entries.get(&va)
    }

    /// Installs `pte` at `va`
    pub fn map(&mut self, va: usize, pte: Pte) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if self.entries.contains_key(&va) {
            return Err(MapError::Overlap);
        }
        self.entries.insert(va, pte);
        Ok(())
    }

    /// Removes and returns the entry at `va`
    pub fn unmap(&mut self, va: usize) -> Result<Pte, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        self.entries.remove(&va).ok_or(MapError::NotMapped)
    }

    /// Replaces the permission bits of the entry at `va`
    pub fn update_flags(&mut self, va: usize, flags: PageFlags) -> Result<(), MapError> {
        let pte = self.entries.get_mut(&va).ok_or(MapError::NotMapped)?;
        *pte = pte.with_flags(flags);
        Ok(())
    }

    /// Entries in ascending virtual-address order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Pte)> {
        self.entries.iter().map(|(va, pte)| (*va, pte))
    }

    /// Entries in `[start, end)`
    pub fn range(&self, start: usize, end: usize) -> impl Iterator<Item = (usize, &Pte)> {
        self.entries.range(start..end).map(|(va, pte)| (*va, pte))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
