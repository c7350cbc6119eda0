//! Polymorphic inline caching
//!
//! Memoizes call-site resolution (method lookup, multi-dispatch operators,
//! attribute offsets) per bytecode site. See [`InlineCache`] for the
//! lookup/promote/evict protocol and [`CacheStore`] for slot ownership.

pub mod inline_cache;
pub mod slot;
pub mod store;

#[cfg(test)]
mod tests;

pub use inline_cache::{
    CachePolicy, CacheState, CacheStats, DegradeReason, InlineCache, Insert, Lookup,
    MissCounting, Probe, OVERFLOW_SLOTS,
};
pub use slot::{
    shape_of, AttrLocation, CacheEntry, CacheKey, CacheSlot, CacheTarget, KeyKind, NativeFn,
    NativeFunction, NativeSignature, PackedTypes, Selector, Signature, SignatureShape, TypeTag,
};
pub use store::{CacheStore, ContextId, PicRegion, StoreRegistry, SLOT_BYTES};
