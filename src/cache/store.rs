//! Cache stores
//!
//! A [`CacheStore`] owns every cache slot of one code segment. The front
//! holds one [`InlineCache`] per call site, indexed by [`SiteIndex`]; the
//! rear is a fixed arena of overflow slots handed out by bump allocation
//! from the end, never compacted and never freed piecewise.
//!
//! Stores of segments that replaced each other in the same execution
//! context form a chain through `prev`. The chain is reference counted, so
//! an older store lives exactly as long as some younger store or some
//! running engine still holds it.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::inline_cache::{CachePolicy, InlineCache, Lookup, Probe, OVERFLOW_SLOTS};
use super::slot::{CacheKey, CacheSlot, CacheTarget, KeyKind, Selector};
use crate::vm::errors::{CacheError, ResolutionFailure, VMError, VMResult};
use crate::vm::segment::{CodeSegment, SegmentId, SiteIndex};

/// Bytes one overflow slot occupies in the arena
pub const SLOT_BYTES: usize = std::mem::size_of::<RwLock<CacheSlot>>();

/// A run of arena slots handed to one call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicRegion {
    start: u32,
    len: u32,
}

impl PicRegion {
    pub fn start(&self) -> usize {
        self.start as usize
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arena index of the slot at `position` within the region
    pub fn slot(
        &self,
        position: usize,
    ) -> usize {
        debug_assert!(position < self.len());
        self.start() + position
    }

    pub fn indices(&self) -> Range<usize> {
        self.start()..self.start() + self.len()
    }

    pub fn overlaps(
        &self,
        other: &PicRegion,
    ) -> bool {
        self.start() < other.start() + other.len() && other.start() < self.start() + self.len()
    }
}

/// Identifies an execution context that loads segments one after another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

impl ContextId {
    pub const MAIN: ContextId = ContextId(0);
}

/// All cache slots of one code segment
#[derive(Debug)]
pub struct CacheStore {
    segment: SegmentId,
    generation: u64,
    policy: CachePolicy,
    prev: Option<Arc<CacheStore>>,
    mics: Box<[Mutex<InlineCache>]>,
    arena: Box<[RwLock<CacheSlot>]>,
    /// Lowest allocated arena index; allocation moves it down
    top: AtomicUsize,
}

impl CacheStore {
    /// Store for a freshly loaded segment with no predecessor
    pub fn new(
        segment: &CodeSegment,
        arena_slots: usize,
        policy: CachePolicy,
    ) -> Self {
        Self::with_chain(segment, arena_slots, policy, 0, None)
    }

    pub(crate) fn with_chain(
        segment: &CodeSegment,
        arena_slots: usize,
        policy: CachePolicy,
        generation: u64,
        prev: Option<Arc<CacheStore>>,
    ) -> Self {
        let sites = segment
            .sites()
            .iter()
            .map(|site| (site.kind.selector(), site.kind.key_kind()));
        Self::build(segment.id(), sites, arena_slots, policy, generation, prev)
    }

    /// Store not tied to a loaded segment, one cache per selector
    pub fn detached(
        sites: impl IntoIterator<Item = (Selector, KeyKind)>,
        arena_slots: usize,
        policy: CachePolicy,
    ) -> Self {
        Self::build(SegmentId(u32::MAX), sites, arena_slots, policy, 0, None)
    }

    fn build(
        segment: SegmentId,
        sites: impl IntoIterator<Item = (Selector, KeyKind)>,
        arena_slots: usize,
        policy: CachePolicy,
        generation: u64,
        prev: Option<Arc<CacheStore>>,
    ) -> Self {
        let mics: Box<[Mutex<InlineCache>]> = sites
            .into_iter()
            .map(|(selector, kind)| Mutex::new(InlineCache::new(selector, kind)))
            .collect();
        let arena: Box<[RwLock<CacheSlot>]> =
            (0..arena_slots).map(|_| RwLock::new(CacheSlot::Empty)).collect();
        debug!(
            "cache store generation {} for segment {}: {} sites, {} arena slots",
            generation,
            segment.0,
            mics.len(),
            arena_slots
        );
        Self {
            segment,
            generation,
            policy,
            prev,
            mics,
            top: AtomicUsize::new(arena.len()),
            arena,
        }
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn prev(&self) -> Option<&Arc<CacheStore>> {
        self.prev.as_ref()
    }

    /// Number of stores reachable from this one, itself included
    pub fn chain_len(&self) -> usize {
        1 + self.prev.as_ref().map_or(0, |p| p.chain_len())
    }

    /// Number of call-site caches (range check for site indices)
    pub fn n_mics(&self) -> usize {
        self.mics.len()
    }

    /// Remaining bump-allocatable bytes
    pub fn usable(&self) -> usize {
        self.top.load(Ordering::Acquire) * SLOT_BYTES
    }

    pub fn capacity(&self) -> usize {
        self.arena.len() * SLOT_BYTES
    }

    /// Bump-allocate `n_slots` overflow slots from the rear of the arena
    pub fn allocate(
        &self,
        n_slots: usize,
    ) -> Result<PicRegion, CacheError> {
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| top.checked_sub(n_slots))
            .map(|old| PicRegion {
                start: (old - n_slots) as u32,
                len: n_slots as u32,
            })
            .map_err(|top| CacheError::OutOfCacheSpace {
                requested: n_slots * SLOT_BYTES,
                usable: top * SLOT_BYTES,
            })
    }

    pub(crate) fn overflow_slot(
        &self,
        index: usize,
    ) -> &RwLock<CacheSlot> {
        &self.arena[index]
    }

    /// Run `f` with exclusive access to one site's cache
    pub fn with_site<R>(
        &self,
        site: SiteIndex,
        f: impl FnOnce(&mut InlineCache) -> R,
    ) -> Option<R> {
        self.mics.get(site.0 as usize).map(|cell| f(&mut cell.lock()))
    }

    /// Copy of one site's cache for inspection
    pub fn snapshot(
        &self,
        site: SiteIndex,
    ) -> Option<InlineCache> {
        self.with_site(site, |ic| ic.clone())
    }

    /// Cached dispatch for one site
    ///
    /// The site lock is not held while `resolve` runs. Two contexts missing
    /// on the same site may both resolve; the second write-back finds the
    /// key present and is dropped.
    pub fn dispatch<F>(
        &self,
        site: SiteIndex,
        key: CacheKey,
        resolve: F,
    ) -> Result<Lookup, ResolutionFailure>
    where
        F: FnOnce(&CacheKey) -> Result<CacheTarget, ResolutionFailure>,
    {
        let Some(cell) = self.mics.get(site.0 as usize) else {
            warn!("{} outside store of segment {}, running uncached", site, self.segment.0);
            return resolve(&key).map(Lookup::Uncached);
        };

        let probe = cell.lock().probe(self, &key);
        match probe {
            Probe::Hit(target) => Ok(Lookup::Hit(target)),
            Probe::Promoted(target) => Ok(Lookup::Promoted(target)),
            Probe::Bypass => resolve(&key).map(Lookup::Uncached),
            Probe::Miss => {
                let target = resolve(&key)?;
                cell.lock().insert(self, key, target.clone());
                Ok(Lookup::Resolved(target))
            }
        }
    }

    /// Visit every cached target in this store and its predecessors
    ///
    /// The collector calls this during its trace phase so that cached
    /// subroutines and natives stay alive while the segment is loaded.
    pub fn trace_roots(
        &self,
        visit: &mut dyn FnMut(&CacheTarget),
    ) {
        // promotion moves targets between a site's fast slot and its
        // region under the site lock, so both are read under it too
        for cell in self.mics.iter() {
            let ic = cell.lock();
            if let Some(target) = ic.fast_slot().target() {
                visit(target);
            }
            if let Some(region) = ic.overflow_region() {
                for idx in region.indices() {
                    if let Some(target) = self.arena[idx].read().target() {
                        visit(target);
                    }
                }
            }
        }
        if let Some(prev) = &self.prev {
            prev.trace_roots(visit);
        }
    }

    /// Free a store's arena in one step
    ///
    /// Fails when anything else still holds the store: a younger store
    /// through its `prev` link, a registry entry, or a running engine.
    pub fn release(store: Arc<CacheStore>) -> VMResult<()> {
        match Arc::try_unwrap(store) {
            Ok(store) => {
                drop(store);
                Ok(())
            }
            Err(shared) => Err(VMError::UnreachableStoreRelease {
                generation: shared.generation,
                refs: Arc::strong_count(&shared) - 1,
            }),
        }
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        debug!(
            "releasing cache store generation {} (segment {})",
            self.generation, self.segment.0
        );
    }
}

/// Creates and tracks the stores of loaded segments
#[derive(Debug)]
pub struct StoreRegistry {
    policy: CachePolicy,
    regions_per_site: f64,
    next_generation: u64,
    /// Segment most recently loaded into each context
    contexts: HashMap<ContextId, SegmentId>,
    stores: HashMap<SegmentId, Arc<CacheStore>>,
}

impl StoreRegistry {
    pub fn new(
        policy: CachePolicy,
        regions_per_site: f64,
    ) -> Self {
        Self {
            policy,
            regions_per_site: regions_per_site.max(0.0),
            next_generation: 0,
            contexts: HashMap::new(),
            stores: HashMap::new(),
        }
    }

    /// Arena size for a segment, in overflow slots
    pub fn arena_slots_for(
        &self,
        segment: &CodeSegment,
    ) -> usize {
        let regions = (segment.site_count() as f64 * self.regions_per_site).ceil() as usize;
        regions * OVERFLOW_SLOTS
    }

    /// Segment load in the main context
    pub fn on_segment_load(
        &mut self,
        segment: &CodeSegment,
    ) -> Arc<CacheStore> {
        self.attach_to_segment(ContextId::MAIN, segment)
    }

    /// Create the store for `segment`, chained to the store of whatever
    /// segment previously ran in `context`
    pub fn attach_to_segment(
        &mut self,
        context: ContextId,
        segment: &CodeSegment,
    ) -> Arc<CacheStore> {
        let prev = self
            .contexts
            .get(&context)
            .and_then(|id| self.stores.get(id))
            .cloned();
        let generation = self.next_generation;
        self.next_generation += 1;

        let store = Arc::new(CacheStore::with_chain(
            segment,
            self.arena_slots_for(segment),
            self.policy,
            generation,
            prev,
        ));
        if let Some(old) = self.stores.insert(segment.id(), store.clone()) {
            warn!(
                "segment {} reloaded; generation {} stays reachable only through its users",
                segment.id().0,
                old.generation()
            );
        }
        self.contexts.insert(context, segment.id());
        store
    }

    /// Drop the registry's hold on a segment's store
    ///
    /// The returned handle can be passed to [`CacheStore::release`] once the
    /// caller knows no call site references it any more.
    pub fn on_segment_unload(
        &mut self,
        segment: SegmentId,
    ) -> Option<Arc<CacheStore>> {
        self.contexts.retain(|_, id| *id != segment);
        self.stores.remove(&segment)
    }

    pub fn store(
        &self,
        segment: SegmentId,
    ) -> Option<Arc<CacheStore>> {
        self.stores.get(&segment).cloned()
    }

    pub fn loaded(&self) -> usize {
        self.stores.len()
    }

    /// Root every target cached by a loaded segment
    pub fn trace_roots(
        &self,
        visit: &mut dyn FnMut(&CacheTarget),
    ) {
        for store in self.stores.values() {
            store.trace_roots(visit);
        }
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new(CachePolicy::default(), 1.0)
    }
}
