//! Several execution contexts sharing one cache store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use picvm::cache::{
    CacheKey, CachePolicy, CacheStore, CacheTarget, KeyKind, PackedTypes, Selector, TypeTag,
    OVERFLOW_SLOTS,
};
use picvm::util::config::EngineConfig;
use picvm::vm::{
    DispatchEngine, InfixOp, Instruction, Opcode, ResolutionFailure, SegmentBuilder, SegmentId,
    SiteIndex, SubHandle, TypeRegistry, Value,
};

use crate::common::{imm, infix, ENTRY};

const THREADS: usize = 8;

fn key(n: u32) -> CacheKey {
    CacheKey::Types(PackedTypes::new(TypeTag(n + 1), TypeTag::INT).unwrap())
}

fn resolve(key: &CacheKey) -> Result<CacheTarget, ResolutionFailure> {
    match key {
        CacheKey::Types(pair) => Ok(CacheTarget::Sub(SubHandle(pair.raw()))),
        CacheKey::Signature(sig) => Ok(CacheTarget::Sub(SubHandle(sig.len() as u32))),
    }
}

fn operator_store(
    sites: usize,
    regions: usize,
) -> CacheStore {
    CacheStore::detached(
        (0..sites).map(|_| (Selector::Operator(InfixOp::Add), KeyKind::Types)),
        regions * OVERFLOW_SLOTS,
        CachePolicy::default(),
    )
}

#[test]
fn test_concurrent_lookups_match_the_resolver() {
    const SITES: usize = 4;
    let store = Arc::new(operator_store(SITES, SITES));
    let resolutions = AtomicUsize::new(0);

    crossbeam::scope(|s| {
        for t in 0..THREADS {
            let store = &store;
            let resolutions = &resolutions;
            s.spawn(move |_| {
                for i in 0..2_000usize {
                    let site = SiteIndex(((i + t) % SITES) as u32);
                    let k = key(((i * 7 + t) % 4) as u32);
                    let expected = resolve(&k).unwrap();
                    let lookup = store
                        .dispatch(site, k, |k| {
                            resolutions.fetch_add(1, Ordering::Relaxed);
                            resolve(k)
                        })
                        .unwrap();
                    assert_eq!(lookup.target(), &expected);
                }
            });
        }
    })
    .unwrap();

    for site in 0..SITES {
        let ic = store.snapshot(SiteIndex(site as u32)).unwrap();
        let entries = ic.entries(&store);
        assert!(entries.len() <= 1 + OVERFLOW_SLOTS);
        for (i, a) in entries.iter().enumerate() {
            // no torn slot: every key still carries its own target
            assert_eq!(a.target, resolve(&a.key).unwrap());
            assert!(entries[i + 1..].iter().all(|b| b.key != a.key));
        }
    }
    // racing misses may resolve twice, but never once per lookup
    assert!(resolutions.load(Ordering::Relaxed) < THREADS * 2_000 / 10);
}

#[test]
fn test_concurrent_allocation_never_overlaps() {
    const REGIONS: usize = 16;
    let store = operator_store(0, REGIONS);

    let granted = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = &store;
                s.spawn(move |_| {
                    (0..REGIONS)
                        .filter_map(|_| store.allocate(OVERFLOW_SLOTS).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    assert_eq!(granted.len(), REGIONS);
    assert_eq!(store.usable(), 0);
    for (i, a) in granted.iter().enumerate() {
        for b in &granted[i + 1..] {
            assert!(!a.overlaps(b));
        }
    }
}

#[test]
fn test_engines_share_a_store() {
    let mut b = SegmentBuilder::new(SegmentId(0));
    let half = b.constant(Value::Num(0.5));
    b.chunk(
        "main",
        vec![
            imm(0, 0),
            imm(1, 1),
            imm(2, 100),
            infix(0, 0, 1, InfixOp::Add),
            infix(3, 0, 2, InfixOp::Lt),
            Instruction::op2(Opcode::GotoIf, 3, 3),
            Instruction::op2(Opcode::LoadConst, 4, half),
            infix(5, 0, 4, InfixOp::Mul),
            Instruction::op2(Opcode::ConvertNI, 6, 5),
            Instruction::op1(Opcode::Exit, 6),
        ],
    );
    let segment = Arc::new(b.build().unwrap());
    let store = Arc::new(CacheStore::new(
        &segment,
        segment.site_count() * OVERFLOW_SLOTS,
        CachePolicy::default(),
    ));
    let registry = Arc::new(TypeRegistry::with_builtins());

    let codes = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (segment, store, registry) = (segment.clone(), store.clone(), registry.clone());
                s.spawn(move |_| {
                    let mut engine =
                        DispatchEngine::new(segment, store, registry, EngineConfig::default());
                    engine.set_stdout(Arc::new(parking_lot::Mutex::new(std::io::sink())));
                    let code = engine.dispatch_run(ENTRY, &[]).unwrap();
                    (code, engine.resolutions())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    assert!(codes.iter().all(|(code, _)| *code == 50));
    // three sites; a context only resolves what it found missing
    let total: u64 = codes.iter().map(|(_, r)| r).sum();
    assert!(total >= 3);
    assert!(total <= 3 * THREADS as u64);
    for site in 0..3 {
        let ic = store.snapshot(SiteIndex(site)).unwrap();
        assert_eq!(ic.entries(&store).len(), 1);
    }
}
