//! Shared region mapper
//!
//! Aliases a page range of one address space into another. Mapping is
//! two-phase: every source page is validated and every destination slot is
//! checked before the first entry is installed, so a failed call leaves both
//! spaces untouched. Unmapping validates the whole range the same way.

use crate::address_space::{AddressSpace, GrantRecord};
use crate::error::{Result, ShareError};
use crate::page_table::{PageFlags, Pte};
use crate::phys::{page_round_down, page_round_up, PAGE_SIZE};
use crate::process::{lock_pair, Pid, Process, SpacePair};
use tracing::debug;

/// Source pages resolved for aliasing
#[derive(Debug)]
pub struct SourcePages {
    src_va: usize,
    size: usize,
    /// `(pa, flags, owner)` per page starting at `page_round_down(src_va)`
    pages: Vec<(usize, PageFlags, Pid)>,
}

impl SourcePages {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Resolve the frames behind `[src_va, src_va + size)` in `src`
pub fn collect_source(
    src: &AddressSpace,
    src_pid: Pid,
    src_va: usize,
    size: usize,
) -> Result<SourcePages> {
    let invalid = ShareError::InvalidRange { va: src_va, size };
    if size == 0 {
        return Err(invalid);
    }
    let end = match src_va.checked_add(size) {
        Some(end) if end <= src.size() => end,
        _ => return Err(invalid),
    };

    // Exact page span of the byte range, so an aligned range does not drag
    // in the page after it
    let first = page_round_down(src_va);
    let last = page_round_up(end);
    let mut pages = Vec::with_capacity((last - first) / PAGE_SIZE);

    let mut va = first;
    while va < last {
        let pte = match src.page_table().lookup(va) {
            Some(pte) if pte.is_present() && pte.is_user() => *pte,
            _ => return Err(ShareError::PermissionDenied { va }),
        };
        // Re-sharing an alias keeps pointing at the original owner
        let owner = match pte {
            Pte::Owned { .. } => src_pid,
            Pte::Shared { owner, .. } => owner,
        };
        pages.push((pte.pa(), pte.flags(), owner));
        va += PAGE_SIZE;
    }

    Ok(SourcePages {
        src_va,
        size,
        pages,
    })
}

/// Publish resolved source pages into `dst` above its current size
///
/// Returns the destination address of the first byte, which keeps the
/// source's offset within its page.
pub fn install(dst: &mut AddressSpace, source: &SourcePages) -> Result<usize> {
    let offset = source.src_va % PAGE_SIZE;
    let dst_va = page_round_up(dst.size()) + offset;
    let end = match dst_va.checked_add(source.size) {
        Some(end) if end <= dst.max_va() => end,
        _ => {
            return Err(ShareError::InvalidRange {
                va: dst_va,
                size: source.size,
            })
        }
    };

    let base = page_round_down(dst_va);
    for i in 0..source.pages.len() {
        let va = base + i * PAGE_SIZE;
        if dst.page_table().lookup(va).is_some() {
            return Err(ShareError::Overlap { va });
        }
    }

    for (i, &(pa, flags, owner)) in source.pages.iter().enumerate() {
        let va = base + i * PAGE_SIZE;
        // Slots were checked above under the same lock
        if dst
            .page_table_mut()
            .map(va, Pte::Shared { pa, flags, owner })
            .is_err()
        {
            for j in 0..i {
                let _ = dst.page_table_mut().unmap(base + j * PAGE_SIZE);
            }
            return Err(ShareError::Overlap { va });
        }
    }

    let prior_size = dst.size();
    dst.grants_mut().insert(
        dst_va,
        GrantRecord {
            size: source.size,
            prior_size,
        },
    );
    dst.set_size(end);
    Ok(dst_va)
}

/// Alias `[src_va, src_va + size)` of `src` into `dst`
///
/// Holds both address-space locks, taken in pid order, for the whole walk.
pub fn map_shared_pages(src: &Process, dst: &Process, src_va: usize, size: usize) -> Result<usize> {
    let dst_va = match lock_pair(src, dst) {
        SpacePair::Same(mut space) => {
            let pages = collect_source(&space, src.pid(), src_va, size)?;
            install(&mut space, &pages)?
        }
        SpacePair::Distinct { src: s, dst: mut d } => {
            let pages = collect_source(&s, src.pid(), src_va, size)?;
            install(&mut d, &pages)?
        }
    };

    debug!(
        src = %src.pid(),
        dst = %dst.pid(),
        src_va,
        dst_va,
        size,
        "mapped shared pages"
    );
    Ok(dst_va)
}

/// Remove the shared aliases covering `[va, va + size)` from `space`
///
/// Every page must be a present, user-accessible shared entry; otherwise
/// nothing is removed. Frames are never freed here.
pub fn unmap_shared_pages(space: &mut AddressSpace, va: usize, size: usize) -> Result<()> {
    let end = va
        .checked_add(size)
        .filter(|_| size > 0)
        .ok_or(ShareError::InvalidRange { va, size })?;

    let first = page_round_down(va);
    let last = page_round_up(end);

    let mut page = first;
    while page < last {
        match space.page_table().lookup(page) {
            Some(pte) if pte.is_present() && pte.is_user() && pte.is_shared() => {}
            _ => return Err(ShareError::UnmappedOrForeign { va: page }),
        }
        page += PAGE_SIZE;
    }

    let mut page = first;
    while page < last {
        let _ = space.page_table_mut().unmap(page);
        page += PAGE_SIZE;
    }

    // Give the address range back if this was the topmost region. The size
    // drops below `first` only when the grant under `va` has no pages left.
    if end >= space.size() {
        let covering = space
            .grants()
            .range(..last)
            .next_back()
            .map(|(&base, record)| (base, *record))
            .filter(|&(base, record)| page_round_up(base + record.size) > first);
        let restored = match covering {
            Some((base, record))
                if space
                    .page_table()
                    .range(page_round_down(base).min(first), first)
                    .next()
                    .is_none() =>
            {
                record.prior_size
            }
            _ => first,
        };
        space.set_size(restored.min(space.size()));
    }

    // Forget grants with every page gone
    let emptied: Vec<usize> = space
        .grants()
        .iter()
        .filter(|&(&base, record)| {
            space
                .page_table()
                .range(page_round_down(base), page_round_up(base + record.size))
                .next()
                .is_none()
        })
        .map(|(&base, _)| base)
        .collect();
    for base in emptied {
        space.grants_mut().remove(&base);
    }

    debug!(va, size, "unmapped shared pages");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::MAX_VA;
    use crate::phys::PhysMemory;
    use crate::process::ProcessTable;
    use proptest::prelude::*;
    use std::sync::Arc;

    struct Fixture {
        phys: Arc<PhysMemory>,
        table: ProcessTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                phys: Arc::new(PhysMemory::new(64).unwrap()),
                table: ProcessTable::new(MAX_VA),
            }
        }

        fn spawn(&self, size: usize) -> Arc<Process> {
            self.table.spawn(&self.phys, "test", size).unwrap()
        }
    }

    #[test]
    fn test_map_preserves_page_offset() {
        let fx = Fixture::new();
        let src = fx.spawn(3 * PAGE_SIZE);
        let dst = fx.spawn(5000);

        let dst_va = map_shared_pages(&src, &dst, 100, 5000).unwrap();
        assert_eq!(dst_va, 2 * PAGE_SIZE + 100);
        assert_eq!(dst.space().size(), dst_va + 5000);

        let src_space = src.space();
        let dst_space = dst.space();
        assert_eq!(src_space.translate(100), dst_space.translate(dst_va));
        assert_eq!(src_space.translate(5099), dst_space.translate(dst_va + 4999));
        assert!(dst_space.page_table().lookup(2 * PAGE_SIZE).unwrap().is_shared());
    }

    #[test]
    fn test_aligned_range_maps_exact_page_count() {
        let fx = Fixture::new();
        let src = fx.spawn(3 * PAGE_SIZE);
        let dst = fx.spawn(0);

        map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        assert_eq!(dst.space().page_table().len(), 2);
    }

    #[test]
    fn test_unaligned_range_spans_extra_page() {
        let fx = Fixture::new();
        let src = fx.spawn(3 * PAGE_SIZE);
        let dst = fx.spawn(0);

        // 5000 bytes starting late in a page touch three pages
        map_shared_pages(&src, &dst, 4000, 5000).unwrap();
        assert_eq!(dst.space().page_table().len(), 3);
    }

    #[test]
    fn test_alias_sees_both_directions() {
        let fx = Fixture::new();
        let src = fx.spawn(8180);
        let dst = fx.spawn(0);

        let dst_va = map_shared_pages(&src, &dst, 0, 8180).unwrap();
        let src_view = src.space().region(&fx.phys, 0, 8180).unwrap();
        let dst_view = dst.space().region(&fx.phys, dst_va, 8180).unwrap();

        src_view.write(4090, b"hello child").unwrap();
        assert_eq!(dst_view.read_vec(4090, 11).unwrap(), b"hello child");

        dst_view.write(0, b"hello daddy").unwrap();
        assert_eq!(src_view.read_vec(0, 11).unwrap(), b"hello daddy");
    }

    #[test]
    fn test_map_rejects_bad_ranges() {
        let fx = Fixture::new();
        let src = fx.spawn(PAGE_SIZE);
        let dst = fx.spawn(0);

        for (va, size) in [(0, 0), (0, PAGE_SIZE + 1), (PAGE_SIZE, 1), (usize::MAX, 2)] {
            assert!(matches!(
                map_shared_pages(&src, &dst, va, size),
                Err(ShareError::InvalidRange { .. })
            ));
        }
        assert_eq!(dst.space().size(), 0);
        assert!(dst.space().page_table().is_empty());
    }

    #[test]
    fn test_map_rejects_va_overflow() {
        let fx = Fixture::new();
        let src = fx.spawn(2 * PAGE_SIZE);
        let dst = fx.spawn(0);
        let mut space = dst.space();
        space.set_size(MAX_VA - PAGE_SIZE);
        drop(space);

        assert!(matches!(
            map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE),
            Err(ShareError::InvalidRange { .. })
        ));
        assert!(dst.space().page_table().is_empty());
        assert_eq!(dst.space().size(), MAX_VA - PAGE_SIZE);
    }

    #[test]
    fn test_map_is_atomic_on_permission_failure() {
        let fx = Fixture::new();
        let src = fx.spawn(3 * PAGE_SIZE);
        let dst = fx.spawn(100);
        src.space().clear_user(2 * PAGE_SIZE).unwrap();

        assert!(matches!(
            map_shared_pages(&src, &dst, 0, 3 * PAGE_SIZE),
            Err(ShareError::PermissionDenied { va }) if va == 2 * PAGE_SIZE
        ));
        let space = dst.space();
        assert_eq!(space.page_table().len(), 1);
        assert_eq!(space.size(), 100);
    }

    fn set_flags(proc: &Process, va: usize, flags: PageFlags) {
        proc.space().page_table_mut().update_flags(va, flags).unwrap();
    }

    /// `(size, entries)` of both spaces
    fn snapshot(a: &Process, b: &Process) -> [(usize, usize); 2] {
        [a, b].map(|proc| {
            let space = proc.space();
            (space.size(), space.page_table().len())
        })
    }

    #[test]
    fn test_map_rejects_invalid_source_page() {
        let fx = Fixture::new();
        let src = fx.spawn(3 * PAGE_SIZE);
        let dst = fx.spawn(100);
        set_flags(&src, PAGE_SIZE, PageFlags::USER_RW - PageFlags::VALID);
        let before = snapshot(&src, &dst);

        assert!(matches!(
            map_shared_pages(&src, &dst, 0, 3 * PAGE_SIZE),
            Err(ShareError::PermissionDenied { va }) if va == PAGE_SIZE
        ));
        assert_eq!(snapshot(&src, &dst), before);
    }

    #[test]
    fn test_map_rejects_missing_source_page() {
        let fx = Fixture::new();
        let src = fx.spawn(3 * PAGE_SIZE);
        let dst = fx.spawn(100);
        src.space().page_table_mut().unmap(PAGE_SIZE).unwrap();
        let before = snapshot(&src, &dst);

        assert!(matches!(
            map_shared_pages(&src, &dst, 10, 2 * PAGE_SIZE),
            Err(ShareError::PermissionDenied { va }) if va == PAGE_SIZE
        ));
        assert_eq!(snapshot(&src, &dst), before);
    }

    #[test]
    fn test_unmap_rejects_alias_without_user_access() {
        let fx = Fixture::new();
        let src = fx.spawn(2 * PAGE_SIZE);
        let dst = fx.spawn(0);
        let va = map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        dst.space().clear_user(va + PAGE_SIZE).unwrap();
        let before = snapshot(&src, &dst);

        assert!(matches!(
            unmap_shared_pages(&mut dst.space(), va, 2 * PAGE_SIZE),
            Err(ShareError::UnmappedOrForeign { va: bad }) if bad == va + PAGE_SIZE
        ));
        assert_eq!(snapshot(&src, &dst), before);
    }

    #[test]
    fn test_unmap_rejects_invalid_alias() {
        let fx = Fixture::new();
        let src = fx.spawn(2 * PAGE_SIZE);
        let dst = fx.spawn(0);
        let va = map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        set_flags(&dst, va, PageFlags::USER_RW - PageFlags::VALID);
        let before = snapshot(&src, &dst);

        assert!(matches!(
            unmap_shared_pages(&mut dst.space(), va, 2 * PAGE_SIZE),
            Err(ShareError::UnmappedOrForeign { va: bad }) if bad == va
        ));
        assert_eq!(snapshot(&src, &dst), before);
    }

    #[test]
    fn test_piecewise_unmap_restores_size() {
        let fx = Fixture::new();
        let src = fx.spawn(2 * PAGE_SIZE);
        let dst = fx.spawn(100);

        // Lower page first, then the top page
        let va = map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        let mut space = dst.space();
        unmap_shared_pages(&mut space, va, PAGE_SIZE).unwrap();
        assert_eq!(space.size(), va + 2 * PAGE_SIZE);
        unmap_shared_pages(&mut space, va + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(space.size(), 100);
        assert!(space.grants().is_empty());
        drop(space);

        // Top page first leaves the lower page inside the size
        let va = map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        let mut space = dst.space();
        unmap_shared_pages(&mut space, va + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(space.size(), va + PAGE_SIZE);
        assert!(space.region(&fx.phys, va, PAGE_SIZE).is_ok());
        unmap_shared_pages(&mut space, va, PAGE_SIZE).unwrap();
        assert_eq!(space.size(), 100);
        assert!(space.grants().is_empty());
    }

    #[test]
    fn test_map_into_self() {
        let fx = Fixture::new();
        let p = fx.spawn(PAGE_SIZE);

        let va = map_shared_pages(&p, &p, 16, 32).unwrap();
        assert_eq!(va, PAGE_SIZE + 16);
        let space = p.space();
        assert_eq!(space.translate(16), space.translate(va));
    }

    #[test]
    fn test_reshare_keeps_original_owner() {
        let fx = Fixture::new();
        let a = fx.spawn(PAGE_SIZE);
        let b = fx.spawn(0);
        let c = fx.spawn(0);

        let b_va = map_shared_pages(&a, &b, 0, PAGE_SIZE).unwrap();
        let c_va = map_shared_pages(&b, &c, b_va, PAGE_SIZE).unwrap();
        match c.space().page_table().lookup(c_va).copied() {
            Some(Pte::Shared { owner, .. }) => assert_eq!(owner, a.pid()),
            other => panic!("unexpected entry {other:?}"),
        };
    }

    #[test]
    fn test_unmap_rejects_owned_page_without_partial_removal() {
        let fx = Fixture::new();
        let src = fx.spawn(2 * PAGE_SIZE);
        let dst = fx.spawn(PAGE_SIZE);

        let dst_va = map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        let mut space = dst.space();
        let before = space.page_table().len();

        // Range starts on the destination's own page
        assert!(matches!(
            unmap_shared_pages(&mut space, 0, dst_va + 2 * PAGE_SIZE),
            Err(ShareError::UnmappedOrForeign { va: 0 })
        ));
        assert_eq!(space.page_table().len(), before);
        assert_eq!(space.size(), dst_va + 2 * PAGE_SIZE);
    }

    #[test]
    fn test_double_unmap_fails() {
        let fx = Fixture::new();
        let src = fx.spawn(PAGE_SIZE);
        let dst = fx.spawn(0);

        let va = map_shared_pages(&src, &dst, 0, 10).unwrap();
        let mut space = dst.space();
        unmap_shared_pages(&mut space, va, 10).unwrap();
        assert!(matches!(
            unmap_shared_pages(&mut space, va, 10),
            Err(ShareError::UnmappedOrForeign { .. })
        ));
        assert!(unmap_shared_pages(&mut space, va, 0).is_err());
    }

    #[test]
    fn test_unmap_keeps_source_frames() {
        let fx = Fixture::new();
        let src = fx.spawn(2 * PAGE_SIZE);
        let dst = fx.spawn(0);
        let free = fx.phys.free_frames();

        let va = map_shared_pages(&src, &dst, 0, 2 * PAGE_SIZE).unwrap();
        unmap_shared_pages(&mut dst.space(), va, 2 * PAGE_SIZE).unwrap();

        assert_eq!(fx.phys.free_frames(), free);
        let view = src.space().region(&fx.phys, 0, 2 * PAGE_SIZE).unwrap();
        view.write(0, b"still here").unwrap();
    }

    proptest! {
        #[test]
        fn prop_map_then_unmap_restores(
            src_size in 1usize..(6 * PAGE_SIZE),
            dst_size in 0usize..(3 * PAGE_SIZE),
            start_frac in 0.0f64..1.0,
            len_frac in 0.0f64..1.0,
        ) {
            let fx = Fixture::new();
            let src = fx.spawn(src_size);
            let dst = fx.spawn(dst_size);

            let va = ((src_size - 1) as f64 * start_frac) as usize;
            let size = 1 + ((src_size - va - 1) as f64 * len_frac) as usize;

            let entries_before = dst.space().page_table().len();
            let dst_va = map_shared_pages(&src, &dst, va, size).unwrap();
            prop_assert_eq!(dst_va % PAGE_SIZE, va % PAGE_SIZE);

            {
                let src_space = src.space();
                let dst_space = dst.space();
                prop_assert_eq!(src_space.translate(va), dst_space.translate(dst_va));
                prop_assert_eq!(
                    src_space.translate(va + size - 1),
                    dst_space.translate(dst_va + size - 1)
                );
            }

            let mut space = dst.space();
            unmap_shared_pages(&mut space, dst_va, size).unwrap();
            prop_assert_eq!(space.size(), dst_size);
            prop_assert_eq!(space.page_table().len(), entries_before);
            prop_assert!(space.page_table().iter().all(|(_, pte)| !pte.is_shared()));
        }

        #[test]
        fn prop_out_of_bounds_map_mutates_nothing(
            src_size in 1usize..(4 * PAGE_SIZE),
            extra in 1usize..PAGE_SIZE,
        ) {
            let fx = Fixture::new();
            let src = fx.spawn(src_size);
            let dst = fx.spawn(PAGE_SIZE);

            prop_assert!(map_shared_pages(&src, &dst, 0, src_size + extra).is_err());
            prop_assert!(map_shared_pages(&src, &dst, src_size, extra).is_err());
            prop_assert_eq!(dst.space().size(), PAGE_SIZE);
            prop_assert_eq!(dst.space().page_table().len(), 1);
            prop_assert_eq!(src.space().size(), src_size);
        }
    }
}
