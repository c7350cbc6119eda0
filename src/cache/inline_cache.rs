//! 内联缓存实现
//!
//! 每个调用点一个 [`InlineCache`]：一个快速槽（MIC）加上从
//! [`CacheStore`] 尾部分配的 3 个溢出槽（PIC）。
//!
//! 核心机制：
//! 1. 快速槽命中直接返回目标
//! 2. 溢出槽命中时与快速槽交换（提升）
//! 3. 未命中时调用完整解析，写回缓存；未命中次数超过阈值后
//!    调用点永久退化为 megamorphic，不再缓存

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::slot::{CacheEntry, CacheKey, CacheSlot, CacheTarget, KeyKind, Selector};
use super::store::{CacheStore, PicRegion};
use crate::vm::errors::ResolutionFailure;

/// Overflow entries per call site
pub const OVERFLOW_SLOTS: usize = 3;

/// Which misses count towards the megamorphic threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissCounting {
    /// Every miss on a populated site
    #[default]
    All,
    /// Only misses that find the overflow set already full
    Saturated,
}

/// Store-wide caching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    /// A site degrades once `miss_count` exceeds this value
    pub megamorphic_threshold: u32,
    pub miss_counting: MissCounting,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            megamorphic_threshold: OVERFLOW_SLOTS as u32,
            miss_counting: MissCounting::All,
        }
    }
}

/// Observable state of a call site's cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Empty,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// Why a site stopped caching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    MissThreshold,
    OutOfCacheSpace,
    /// Operands produced a key of the other form, e.g. tags too wide to pack
    KeyKindMismatch,
}

/// Per-site counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub promotions: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Lookups that skipped the cache entirely
    pub bypassed: u64,
}

/// Result of probing the cache without resolving
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Hit(CacheTarget),
    Promoted(CacheTarget),
    Miss,
    /// Caching is off for this site or key
    Bypass,
}

/// How a lookup obtained its target
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheTarget),
    Promoted(CacheTarget),
    /// Miss, resolved and written back
    Resolved(CacheTarget),
    /// Resolved without touching the cache
    Uncached(CacheTarget),
}

impl Lookup {
    pub fn target(&self) -> &CacheTarget {
        match self {
            Lookup::Hit(t) | Lookup::Promoted(t) | Lookup::Resolved(t) | Lookup::Uncached(t) => t,
        }
    }

    pub fn into_target(self) -> CacheTarget {
        match self {
            Lookup::Hit(t) | Lookup::Promoted(t) | Lookup::Resolved(t) | Lookup::Uncached(t) => t,
        }
    }

    /// Whether full resolution ran for this lookup
    pub fn resolved(&self) -> bool {
        matches!(self, Lookup::Resolved(_) | Lookup::Uncached(_))
    }
}

/// What an insertion did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Fast slot was empty and is now populated
    Filled,
    Inserted { position: usize },
    Evicted { position: usize },
    Degraded(DegradeReason),
    /// Nothing written: caching off, or the key is already present
    Skipped,
}

/// Per-call-site cache
#[derive(Debug, Clone)]
pub struct InlineCache {
    selector: Selector,
    kind: KeyKind,
    fast: CacheSlot,
    overflow: Option<PicRegion>,
    overflow_len: u8,
    evict_cursor: u8,
    miss_count: u32,
    degraded: Option<DegradeReason>,
    stats: CacheStats,
}

impl InlineCache {
    pub fn new(
        selector: Selector,
        kind: KeyKind,
    ) -> Self {
        Self {
            selector,
            kind,
            fast: CacheSlot::Empty,
            overflow: None,
            overflow_len: 0,
            evict_cursor: 0,
            miss_count: 0,
            degraded: None,
            stats: CacheStats::default(),
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn key_kind(&self) -> KeyKind {
        self.kind
    }

    pub fn state(&self) -> CacheState {
        if self.degraded.is_some() {
            CacheState::Megamorphic
        } else if self.fast.is_empty() {
            CacheState::Empty
        } else if self.overflow_len > 0 {
            CacheState::Polymorphic
        } else {
            CacheState::Monomorphic
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn degrade_reason(&self) -> Option<DegradeReason> {
        self.degraded
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn fast_slot(&self) -> &CacheSlot {
        &self.fast
    }

    pub fn overflow_region(&self) -> Option<PicRegion> {
        self.overflow
    }

    /// Overflow slots in position order, empty ones included
    pub fn overflow_slots(
        &self,
        store: &CacheStore,
    ) -> Vec<CacheSlot> {
        match self.overflow {
            Some(region) => region
                .indices()
                .map(|idx| store.overflow_slot(idx).read().clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All populated entries, fast slot first
    pub fn entries(
        &self,
        store: &CacheStore,
    ) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.fast.entry().cloned().into_iter().collect();
        entries.extend(
            self.overflow_slots(store)
                .into_iter()
                .filter_map(|slot| slot.entry().cloned()),
        );
        entries
    }

    pub fn contains_key(
        &self,
        store: &CacheStore,
        key: &CacheKey,
    ) -> bool {
        self.entries(store).iter().any(|e| e.key == *key)
    }

    pub fn contains_target(
        &self,
        store: &CacheStore,
        target: &CacheTarget,
    ) -> bool {
        self.entries(store).iter().any(|e| e.target == *target)
    }

    fn bypasses(
        &self,
        store: &CacheStore,
        key: &CacheKey,
    ) -> bool {
        !store.policy().enabled || self.degraded.is_some() || key.kind() != self.kind
    }

    /// Fast slot, then overflow scan with promotion
    pub fn probe(
        &mut self,
        store: &CacheStore,
        key: &CacheKey,
    ) -> Probe {
        if key.kind() != self.kind && store.policy().enabled {
            self.degrade(DegradeReason::KeyKindMismatch);
        }
        if self.bypasses(store, key) {
            self.stats.bypassed += 1;
            return Probe::Bypass;
        }

        if let Some(target) = self.fast.matches(key) {
            self.stats.hits += 1;
            return Probe::Hit(target.clone());
        }

        if let Some(region) = self.overflow {
            for (position, idx) in region.indices().take(self.overflow_len as usize).enumerate() {
                let cell = store.overflow_slot(idx);
                let matched = cell.read().matches(key).cloned();
                if let Some(target) = matched {
                    std::mem::swap(&mut self.fast, &mut *cell.write());
                    self.stats.promotions += 1;
                    trace!("{}: promoted key {} from overflow {}", self.selector, key, position);
                    return Probe::Promoted(target);
                }
            }
        }

        self.stats.misses += 1;
        Probe::Miss
    }

    /// Write a freshly resolved pair back into the cache
    pub fn insert(
        &mut self,
        store: &CacheStore,
        key: CacheKey,
        target: CacheTarget,
    ) -> Insert {
        if self.bypasses(store, &key) {
            return Insert::Skipped;
        }
        // two contexts missed on the same key; the first write already landed
        if self.contains_key(store, &key) {
            return Insert::Skipped;
        }

        if self.fast.is_empty() {
            trace!("{}: monomorphic on {}", self.selector, key);
            self.fast = CacheSlot::filled(key, target);
            return Insert::Filled;
        }

        let policy = store.policy();
        let saturated = self.overflow_len as usize == OVERFLOW_SLOTS;
        if policy.miss_counting == MissCounting::All || saturated {
            self.miss_count += 1;
        }
        if self.miss_count > policy.megamorphic_threshold {
            self.degrade(DegradeReason::MissThreshold);
            return Insert::Degraded(DegradeReason::MissThreshold);
        }

        let region = match self.overflow {
            Some(region) => region,
            None => match store.allocate(OVERFLOW_SLOTS) {
                Ok(region) => {
                    self.overflow = Some(region);
                    region
                }
                Err(err) => {
                    debug!("{}: {}, running uncached", self.selector, err);
                    self.degrade(DegradeReason::OutOfCacheSpace);
                    return Insert::Degraded(DegradeReason::OutOfCacheSpace);
                }
            },
        };

        if !saturated {
            let position = self.overflow_len as usize;
            *store.overflow_slot(region.slot(position)).write() = CacheSlot::filled(key, target);
            self.overflow_len += 1;
            trace!("{}: polymorphic, overflow {} filled", self.selector, position);
            Insert::Inserted { position }
        } else {
            let position = self.evict_cursor as usize;
            *store.overflow_slot(region.slot(position)).write() = CacheSlot::filled(key, target);
            self.evict_cursor = ((position + 1) % OVERFLOW_SLOTS) as u8;
            self.stats.evictions += 1;
            trace!("{}: evicted overflow {}", self.selector, position);
            Insert::Evicted { position }
        }
    }

    /// The full protocol: probe, resolve on miss, write back
    pub fn lookup<F>(
        &mut self,
        store: &CacheStore,
        key: CacheKey,
        resolve: F,
    ) -> Result<Lookup, ResolutionFailure>
    where
        F: FnOnce(&CacheKey) -> Result<CacheTarget, ResolutionFailure>,
    {
        match self.probe(store, &key) {
            Probe::Hit(target) => Ok(Lookup::Hit(target)),
            Probe::Promoted(target) => Ok(Lookup::Promoted(target)),
            Probe::Bypass => resolve(&key).map(Lookup::Uncached),
            Probe::Miss => {
                let target = resolve(&key)?;
                self.insert(store, key, target.clone());
                Ok(Lookup::Resolved(target))
            }
        }
    }

    fn degrade(
        &mut self,
        reason: DegradeReason,
    ) {
        if self.degraded.is_none() {
            debug!(
                "{}: megamorphic after {} misses ({:?})",
                self.selector, self.miss_count, reason
            );
            self.degraded = Some(reason);
        }
    }
}
