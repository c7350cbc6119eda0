//! 缓存模块测试

pub mod store;

use std::cell::Cell;

use crate::cache::{
    CacheKey, CachePolicy, CacheStore, CacheTarget, KeyKind, PackedTypes, Selector, TypeTag,
    OVERFLOW_SLOTS,
};
use crate::vm::errors::ResolutionFailure;
use crate::vm::opcode::InfixOp;
use crate::vm::segment::SubHandle;

/// Binary operator key
pub(crate) fn types(
    left: TypeTag,
    right: TypeTag,
) -> CacheKey {
    CacheKey::Types(PackedTypes::new(left, right).unwrap())
}

/// Distinct key number `n`
pub(crate) fn nth_key(n: u32) -> CacheKey {
    types(TypeTag(n + 1), TypeTag::INT)
}

/// Deterministic oracle target for a key
pub(crate) fn target_for(key: &CacheKey) -> CacheTarget {
    match key {
        CacheKey::Types(pair) => CacheTarget::Sub(SubHandle(pair.raw())),
        CacheKey::Signature(sig) => CacheTarget::Sub(SubHandle(sig.len() as u32)),
    }
}

/// Store with `sites` operator sites and room for `regions` overflow regions
pub(crate) fn operator_store(
    sites: usize,
    regions: usize,
    policy: CachePolicy,
) -> CacheStore {
    CacheStore::detached(
        (0..sites).map(|_| (Selector::Operator(InfixOp::Add), KeyKind::Types)),
        regions * OVERFLOW_SLOTS,
        policy,
    )
}

/// Counts resolver invocations
#[derive(Default)]
pub(crate) struct Oracle {
    pub calls: Cell<u32>,
}

impl Oracle {
    pub fn resolve(
        &self,
        key: &CacheKey,
    ) -> Result<CacheTarget, ResolutionFailure> {
        self.calls.set(self.calls.get() + 1);
        Ok(target_for(key))
    }
}
