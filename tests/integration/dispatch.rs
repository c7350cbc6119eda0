//! Cached dispatch seen from outside the crate

use std::sync::Arc;

use picvm::cache::{CachePolicy, CacheStore, StoreRegistry, TypeTag, OVERFLOW_SLOTS};
use picvm::jit::{JitSafetyAnalyzer, UnsafeReason};
use picvm::vm::{
    ClassInfo, CodeSegment, InfixOp, Instruction, MethodImpl, Opcode, ProgramCounter,
    SegmentBuilder, SegmentId, TypeRegistry, Value,
};
use quickcheck::{QuickCheck, TestResult};

use crate::common::{engine, engine_with_store, imm, infix, ENTRY};

const ACC: TypeTag = TypeTag(16);

/// Calls `Acc.add(l, r)` once per byte; the low two bits pick int or num
/// for each operand. Leaves the last sum in r3 and exits with the call count.
fn adder_program(
    id: u32,
    choices: &[u8],
) -> (CodeSegment, TypeRegistry) {
    let mut b = SegmentBuilder::new(SegmentId(id));
    let add = b.string("add");
    let quarter = b.constant(Value::Num(0.25));
    let mut main = vec![Instruction::op3(Opcode::GcAlloc, 0, ACC.0, 0)];
    for (i, choice) in choices.iter().enumerate() {
        let load = |dst: u32, num: bool| {
            if num {
                Instruction::op2(Opcode::LoadConst, dst, quarter)
            } else {
                imm(dst, i as i64)
            }
        };
        main.push(load(1, choice & 1 != 0));
        main.push(load(2, choice & 2 != 0));
        main.push(Instruction::new(Opcode::CallMethod, [3, 0, 2, add]));
    }
    main.push(imm(9, choices.len() as i64));
    main.push(Instruction::op1(Opcode::Exit, 9));
    b.chunk("main", main);

    let body = b.chunk(
        "Acc.add",
        vec![infix(3, 1, 2, InfixOp::Add), Instruction::op1(Opcode::Ret, 3)],
    );
    let handle = b.sub("Acc.add", body, vec![ACC, TypeTag::NULL, TypeTag::NULL], TypeTag::NULL);

    let mut registry = TypeRegistry::with_builtins();
    let mut acc = ClassInfo::new("Acc", ACC);
    acc.method("add", MethodImpl::Sub { handle, arity: 2 });
    registry.define_class(acc);
    (b.build().unwrap(), registry)
}

/// Exit code, final sum and the shared site's resolution count
fn observe(
    choices: &[u8],
    policy: CachePolicy,
) -> (i32, Option<Value>, u64) {
    let (segment, registry) = adder_program(0, choices);
    let segment = Arc::new(segment);
    let store = Arc::new(CacheStore::new(&segment, segment.site_count() * OVERFLOW_SLOTS, policy));
    let mut engine = engine_with_store(segment, store.clone(), registry);
    let code = engine.dispatch_run(ENTRY, &[]).unwrap();
    let site = engine.segment().site_at(ProgramCounter::new(1, 0)).unwrap().index;
    let misses = store.snapshot(site).map(|ic| ic.stats().misses).unwrap_or(0);
    (code, engine.register(3).cloned(), misses)
}

#[test]
fn test_dispatch_is_deterministic() {
    fn prop(choices: Vec<u8>) -> TestResult {
        if choices.len() > 48 {
            return TestResult::discard();
        }
        let policy = CachePolicy::default();
        TestResult::from_bool(observe(&choices, policy) == observe(&choices, policy))
    }
    QuickCheck::new()
        .tests(64)
        .quickcheck(prop as fn(Vec<u8>) -> TestResult);
}

#[test]
fn test_caching_is_transparent() {
    fn prop(choices: Vec<u8>) -> TestResult {
        if choices.len() > 48 {
            return TestResult::discard();
        }
        let cached = observe(&choices, CachePolicy::default());
        let uncached = observe(
            &choices,
            CachePolicy {
                enabled: false,
                ..CachePolicy::default()
            },
        );
        // same results; the cache only ever saves resolutions
        TestResult::from_bool(cached.0 == uncached.0 && cached.1 == uncached.1 && cached.2 <= 4)
    }
    QuickCheck::new()
        .tests(64)
        .quickcheck(prop as fn(Vec<u8>) -> TestResult);
}

#[test]
fn test_four_pairs_fit_without_degrading() {
    let choices: Vec<u8> = (0..40).map(|i| (i % 4) as u8).collect();
    let (code, sum, misses) = observe(&choices, CachePolicy::default());
    assert_eq!(code, 40);
    // the last call adds two nums
    assert_eq!(sum, Some(Value::Num(0.5)));
    assert_eq!(misses, 4);
}

#[test]
fn test_jit_verdicts_after_run() {
    let (segment, registry) = adder_program(0, &[0, 0, 0]);
    let mut engine = engine(segment, registry);
    engine.dispatch_run(ENTRY, &[]).unwrap();

    let analyzer = JitSafetyAnalyzer::new(engine.segment());
    let add = engine.segment().site_at(ProgramCounter::new(1, 0)).unwrap().index;
    let verdict = analyzer.query(engine.store(), add);
    assert!(verdict.safe, "{:?}", verdict.reasons);

    // the method target contains a cached infix and still compiles
    let call = engine.segment().site_at(ProgramCounter::new(0, 3)).unwrap().index;
    assert!(analyzer.query(engine.store(), call).safe);
    assert_eq!(engine.jit_query(call), analyzer.query(engine.store(), call));
}

#[test]
fn test_jit_rejects_unresolved_and_megamorphic_sites() {
    let choices = [0u8, 1, 2, 3];
    let (segment, registry) = adder_program(0, &choices);
    let segment = Arc::new(segment);
    let policy = CachePolicy {
        megamorphic_threshold: 1,
        ..CachePolicy::default()
    };
    let store = Arc::new(CacheStore::new(&segment, segment.site_count() * OVERFLOW_SLOTS, policy));
    let analyzer = JitSafetyAnalyzer::new(&segment);
    let add = segment.site_at(ProgramCounter::new(1, 0)).unwrap().index;

    let before = analyzer.query(&store, add);
    assert!(!before.safe);
    assert_eq!(before.reasons, vec![UnsafeReason::NoResolution]);

    let mut engine = engine_with_store(segment.clone(), store.clone(), registry);
    engine.dispatch_run(ENTRY, &[]).unwrap();
    let after = analyzer.query(&store, add);
    assert!(!after.safe);
    assert!(after.reasons.contains(&UnsafeReason::Megamorphic));
}

#[test]
fn test_reloaded_segment_gets_fresh_caches() {
    let mut registry = StoreRegistry::default();
    let (first_segment, types) = adder_program(0, &[0, 0]);
    let first_segment = Arc::new(first_segment);
    let first = registry.on_segment_load(&first_segment);
    let mut old = engine_with_store(first_segment, first.clone(), types);
    old.dispatch_run(ENTRY, &[]).unwrap();

    let (next_segment, types) = adder_program(1, &[1, 1]);
    let next_segment = Arc::new(next_segment);
    let second = registry.on_segment_load(&next_segment);
    assert!(Arc::ptr_eq(second.prev().unwrap(), &first));

    let mut new = engine_with_store(next_segment, second.clone(), types);
    new.dispatch_run(ENTRY, &[]).unwrap();
    // nothing carried over from the first store
    assert_eq!(new.resolutions(), 3);
    assert_eq!(new.register(3), Some(&Value::Num(1.25)));

    let mut targets = 0;
    second.trace_roots(&mut |_| targets += 1);
    // two method sites and one add site per store
    assert_eq!(targets, 6);
}
