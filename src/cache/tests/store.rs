//! CacheStore / StoreRegistry 测试

use std::sync::Arc;

use super::{nth_key, operator_store, target_for, Oracle};
use crate::cache::{
    CachePolicy, CacheStore, CacheTarget, ContextId, StoreRegistry, OVERFLOW_SLOTS, SLOT_BYTES,
};
use crate::vm::errors::{CacheError, VMError};
use crate::vm::instructions::Instruction;
use crate::vm::opcode::{InfixOp, Opcode};
use crate::vm::segment::{CodeSegment, SegmentBuilder, SegmentId, SiteIndex};

/// Segment whose single chunk holds `sites` infix instructions
fn segment_with_sites(
    id: u32,
    sites: usize,
) -> CodeSegment {
    let mut b = SegmentBuilder::new(SegmentId(id));
    let mut code: Vec<Instruction> = (0..sites)
        .map(|_| Instruction::new(Opcode::Infix, [2, 0, 1, InfixOp::Add as u32]))
        .collect();
    code.push(Instruction::op1(Opcode::Exit, 2));
    b.chunk("main", code);
    b.build().unwrap()
}

fn fill_site(
    store: &CacheStore,
    site: SiteIndex,
    keys: u32,
) {
    let oracle = Oracle::default();
    for n in 0..keys {
        store.dispatch(site, nth_key(n), |k| oracle.resolve(k)).unwrap();
    }
}

#[cfg(test)]
mod allocation_tests {
    use super::*;

    #[test]
    fn test_regions_come_from_the_rear() {
        let store = operator_store(0, 2, CachePolicy::default());
        assert_eq!(store.capacity(), 2 * OVERFLOW_SLOTS * SLOT_BYTES);

        let first = store.allocate(OVERFLOW_SLOTS).unwrap();
        assert_eq!(first.start(), OVERFLOW_SLOTS);
        assert_eq!(first.len(), OVERFLOW_SLOTS);
        let second = store.allocate(OVERFLOW_SLOTS).unwrap();
        assert_eq!(second.start(), 0);
        assert!(!first.overlaps(&second));
        assert_eq!(store.usable(), 0);
    }

    #[test]
    fn test_usable_is_in_bytes() {
        let store = operator_store(0, 3, CachePolicy::default());
        let before = store.usable();
        store.allocate(2).unwrap();
        assert_eq!(before - store.usable(), 2 * SLOT_BYTES);
    }

    #[test]
    fn test_exhausted_arena_reports_out_of_space() {
        let store = operator_store(0, 1, CachePolicy::default());
        store.allocate(2).unwrap();
        let err = store.allocate(OVERFLOW_SLOTS).unwrap_err();
        assert_eq!(
            err,
            CacheError::OutOfCacheSpace {
                requested: OVERFLOW_SLOTS * SLOT_BYTES,
                usable: SLOT_BYTES,
            }
        );
        assert_eq!(store.usable(), SLOT_BYTES);
        assert!(store.allocate(1).is_ok());
    }

    #[test]
    fn test_arena_sized_for_n_plus_one_sites() {
        let segment = segment_with_sites(0, 4);
        let store = CacheStore::new(&segment, 3 * OVERFLOW_SLOTS, CachePolicy::default());
        assert_eq!(store.n_mics(), 4);

        for site in 0..3 {
            fill_site(&store, SiteIndex(site), 2);
            assert!(store.snapshot(SiteIndex(site)).unwrap().overflow_region().is_some());
        }
        fill_site(&store, SiteIndex(3), 2);
        let last = store.snapshot(SiteIndex(3)).unwrap();
        assert!(last.is_megamorphic());
        assert!(last.overflow_region().is_none());

        let regions: Vec<_> = (0..3)
            .filter_map(|s| store.snapshot(SiteIndex(s)).unwrap().overflow_region())
            .collect();
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn test_out_of_range_site_runs_uncached() {
        let store = operator_store(1, 1, CachePolicy::default());
        let oracle = Oracle::default();
        let result = store.dispatch(SiteIndex(7), nth_key(0), |k| oracle.resolve(k)).unwrap();
        assert!(result.resolved());
        assert!(store.with_site(SiteIndex(7), |_| ()).is_none());
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_arena_slots_follow_ratio() {
        let segment = segment_with_sites(0, 5);
        let full = StoreRegistry::new(CachePolicy::default(), 1.0);
        assert_eq!(full.arena_slots_for(&segment), 5 * OVERFLOW_SLOTS);
        let half = StoreRegistry::new(CachePolicy::default(), 0.5);
        assert_eq!(half.arena_slots_for(&segment), 3 * OVERFLOW_SLOTS);
        let none = StoreRegistry::new(CachePolicy::default(), 0.0);
        assert_eq!(none.arena_slots_for(&segment), 0);
    }

    #[test]
    fn test_reload_chains_previous_store() {
        let mut registry = StoreRegistry::default();
        let first = registry.on_segment_load(&segment_with_sites(0, 1));
        let second = registry.on_segment_load(&segment_with_sites(1, 2));

        assert_eq!(first.generation(), 0);
        assert_eq!(second.generation(), 1);
        assert!(Arc::ptr_eq(second.prev().unwrap(), &first));
        assert_eq!(second.chain_len(), 2);
        assert_eq!(registry.loaded(), 2);
        assert_eq!(second.segment(), SegmentId(1));
    }

    #[test]
    fn test_contexts_chain_independently() {
        let mut registry = StoreRegistry::default();
        let main = registry.attach_to_segment(ContextId::MAIN, &segment_with_sites(0, 1));
        let other = registry.attach_to_segment(ContextId(1), &segment_with_sites(1, 1));
        assert!(main.prev().is_none());
        assert!(other.prev().is_none());

        let next = registry.attach_to_segment(ContextId(1), &segment_with_sites(2, 1));
        assert!(Arc::ptr_eq(next.prev().unwrap(), &other));
    }

    #[test]
    fn test_release_fails_while_referenced() {
        let mut registry = StoreRegistry::default();
        let first = registry.on_segment_load(&segment_with_sites(0, 1));
        let second = registry.on_segment_load(&segment_with_sites(1, 1));
        drop(first);

        let unloaded = registry.on_segment_unload(SegmentId(0)).unwrap();
        match CacheStore::release(unloaded) {
            Err(VMError::UnreachableStoreRelease { generation, refs }) => {
                assert_eq!(generation, 0);
                assert_eq!(refs, 1);
            }
            other => panic!("expected release failure, got {:?}", other),
        }

        // the failed release consumed one handle; the chain still holds the other
        assert_eq!(second.chain_len(), 2);
        drop(second);
        let last = registry.on_segment_unload(SegmentId(1)).unwrap();
        assert!(CacheStore::release(last).is_ok());
        assert_eq!(registry.loaded(), 0);
    }

    #[test]
    fn test_release_of_sole_handle() {
        let mut registry = StoreRegistry::default();
        let store = registry.on_segment_load(&segment_with_sites(0, 2));
        drop(store);
        let store = registry.on_segment_unload(SegmentId(0)).unwrap();
        assert!(CacheStore::release(store).is_ok());
        assert!(registry.store(SegmentId(0)).is_none());
    }
}

#[cfg(test)]
mod trace_tests {
    use super::*;

    fn collect(store: &CacheStore) -> Vec<CacheTarget> {
        let mut seen = Vec::new();
        store.trace_roots(&mut |t| seen.push(t.clone()));
        seen
    }

    #[test]
    fn test_trace_visits_fast_and_overflow_slots() {
        let store = operator_store(1, 1, CachePolicy::default());
        fill_site(&store, SiteIndex(0), 3);
        let seen = collect(&store);
        assert_eq!(seen.len(), 3);
        for n in 0..3 {
            assert!(seen.contains(&target_for(&nth_key(n))));
        }
    }

    #[test]
    fn test_trace_walks_the_chain() {
        let mut registry = StoreRegistry::default();
        let first = registry.on_segment_load(&segment_with_sites(0, 1));
        fill_site(&first, SiteIndex(0), 2);
        let second = registry.on_segment_load(&segment_with_sites(1, 1));
        fill_site(&second, SiteIndex(0), 1);

        assert_eq!(collect(&second).len(), 3);
        assert_eq!(collect(&first).len(), 2);

        let mut via_registry = 0;
        registry.trace_roots(&mut |_| via_registry += 1);
        // first is reachable both on its own and through second
        assert_eq!(via_registry, 5);
    }

    /// Promotions racing with a trace never hide a target
    #[test]
    fn test_trace_during_promotions() {
        let store = operator_store(1, 1, CachePolicy::default());
        fill_site(&store, SiteIndex(0), 4);

        crossbeam::scope(|s| {
            let store = &store;
            s.spawn(move |_| {
                let oracle = Oracle::default();
                for n in 0..20_000u32 {
                    store
                        .dispatch(SiteIndex(0), nth_key(n % 4), |k| oracle.resolve(k))
                        .unwrap();
                }
            });
            for _ in 0..2_000 {
                let seen = collect(store);
                assert_eq!(seen.len(), 4);
                for n in 0..4 {
                    assert!(seen.contains(&target_for(&nth_key(n))));
                }
            }
        })
        .unwrap();
    }
}
