//! End-to-end caching scenarios driven through the dispatch engine

use std::sync::Arc;

use picvm::cache::{CachePolicy, CacheState, CacheStore, DegradeReason, TypeTag, OVERFLOW_SLOTS};
use picvm::vm::{
    builtin, ClassInfo, CodeSegment, InfixOp, Instruction, MethodImpl, Opcode, ProgramCounter,
    SegmentBuilder, SegmentId, SiteIndex, StepOutcome, TypeRegistry, Value,
};

use crate::common::{engine, engine_with_store, imm, infix, ENTRY};

const MIXER: TypeTag = TypeTag(16);

/// Operand pair fed to the shared `add` site
#[derive(Clone, Copy)]
enum Pair {
    IntInt,
    IntNum,
    StrStr,
}

/// `Mixer.combine(l, r)` adds its two arguments at a single infix site;
/// main calls it once per entry of `calls`
fn mixer_program(calls: &[Pair]) -> (CodeSegment, TypeRegistry) {
    let mut b = SegmentBuilder::new(SegmentId(0));
    let combine = b.string("combine");
    let half = b.constant(Value::Num(0.5));
    let text = b.string("ab");

    let mut main = vec![Instruction::op3(Opcode::GcAlloc, 0, MIXER.0, 0)];
    for pair in calls {
        match pair {
            Pair::IntInt => {
                main.push(imm(1, 20));
                main.push(imm(2, 22));
            }
            Pair::IntNum => {
                main.push(imm(1, 1));
                main.push(Instruction::op2(Opcode::LoadConst, 2, half));
            }
            Pair::StrStr => {
                main.push(Instruction::op2(Opcode::LoadConst, 1, text));
                main.push(Instruction::op2(Opcode::LoadConst, 2, text));
            }
        }
        main.push(Instruction::new(Opcode::CallMethod, [3, 0, 2, combine]));
    }
    main.push(Instruction::op1(Opcode::Exit, 3));
    b.chunk("main", main);

    let body = b.chunk(
        "Mixer.combine",
        vec![infix(3, 1, 2, InfixOp::Add), Instruction::op1(Opcode::Ret, 3)],
    );
    let handle = b.sub("Mixer.combine", body, vec![MIXER, TypeTag::NULL, TypeTag::NULL], TypeTag::NULL);

    let mut registry = TypeRegistry::with_builtins();
    if let Some(concat) = builtin("str_concat") {
        registry.define_operator(InfixOp::Add, TypeTag::STR, TypeTag::STR, MethodImpl::Native(concat));
    }
    let mut mixer = ClassInfo::new("Mixer", MIXER);
    mixer.method("combine", MethodImpl::Sub { handle, arity: 2 });
    registry.define_class(mixer);
    (b.build().unwrap(), registry)
}

#[test]
fn test_mixed_operand_sequence_at_one_site() {
    let mut calls = vec![Pair::IntInt; 5];
    calls.push(Pair::IntNum);
    calls.push(Pair::StrStr);
    calls.extend([Pair::IntInt; 10]);
    let (segment, registry) = mixer_program(&calls);
    let mut engine = engine(segment, registry);

    assert_eq!(engine.dispatch_run(ENTRY, &[]).unwrap(), 42);

    let add = engine
        .segment()
        .site_at(ProgramCounter::new(1, 0))
        .unwrap()
        .index;
    let ic = engine.store().snapshot(add).unwrap();
    let stats = ic.stats();
    // one resolution per distinct operand pair
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hits, 14);
    assert_eq!(stats.promotions, 0);
    assert_eq!(ic.miss_count(), 2);
    assert_eq!(ic.state(), CacheState::Polymorphic);
    assert_eq!(ic.entries(engine.store()).len(), 3);
    assert!(!ic.is_megamorphic());
}

#[test]
fn test_call_results_follow_operand_types() {
    let (segment, registry) = mixer_program(&[Pair::StrStr, Pair::IntNum]);
    let mut engine = engine(segment, registry);
    engine.start(ENTRY, &[]).unwrap();
    let mut seen = Vec::new();
    while let StepOutcome::Continue = engine.step().unwrap() {
        if engine.frames().len() == 1 {
            if let Some(value) = engine.register(3) {
                if !seen.contains(value) {
                    seen.push(value.clone());
                }
            }
        }
    }
    assert_eq!(seen, vec![Value::Null, Value::str("abab"), Value::Num(1.5)]);
}

/// `sites` add sites run three times: once with `(int, int)`, then twice
/// with `(int, num)`; exits with the last site's result truncated
fn widening_loop(sites: u32) -> CodeSegment {
    let mut b = SegmentBuilder::new(SegmentId(0));
    let half = b.constant(Value::Num(0.5));
    let mut code = vec![imm(0, 2), imm(1, 1), imm(5, 3), imm(6, -1)];
    let top = code.len() as u32;
    for k in 0..sites {
        code.push(infix(10 + k, 0, 1, InfixOp::Add));
    }
    code.push(Instruction::op3(Opcode::AddI, 5, 5, 6));
    code.push(Instruction::op2(Opcode::LoadConst, 1, half));
    code.push(Instruction::op2(Opcode::GotoIf, top, 5));
    code.push(Instruction::op2(Opcode::ConvertNI, 7, 10 + sites - 1));
    code.push(Instruction::op1(Opcode::Exit, 7));
    b.chunk("main", code);
    b.build().unwrap()
}

#[test]
fn test_exhausted_arena_falls_back_to_uncached() {
    const REGIONS: u32 = 4;
    let segment = Arc::new(widening_loop(REGIONS + 1));
    let store = Arc::new(CacheStore::new(
        &segment,
        REGIONS as usize * OVERFLOW_SLOTS,
        CachePolicy::default(),
    ));
    let mut engine = engine_with_store(segment, store.clone(), TypeRegistry::with_builtins());

    // 2 + 0.5
    assert_eq!(engine.dispatch_run(ENTRY, &[]).unwrap(), 2);
    assert_eq!(store.usable(), 0);

    for k in 0..REGIONS {
        let ic = store.snapshot(SiteIndex(k)).unwrap();
        assert_eq!(ic.state(), CacheState::Polymorphic);
        assert!(ic.overflow_region().is_some());
    }

    let starved = store.snapshot(SiteIndex(REGIONS)).unwrap();
    assert_eq!(starved.degrade_reason(), Some(DegradeReason::OutOfCacheSpace));
    assert!(starved.overflow_region().is_none());
    // the third pass through the starved site skipped the cache
    assert_eq!(starved.stats().bypassed, 1);
    assert_eq!(engine.register(10 + REGIONS), Some(&Value::Num(2.5)));
}

#[test]
fn test_cache_disabled_gives_same_results() {
    let run = |enabled: bool| {
        let segment = Arc::new(widening_loop(3));
        let policy = CachePolicy {
            enabled,
            ..CachePolicy::default()
        };
        let store = Arc::new(CacheStore::new(&segment, 3 * OVERFLOW_SLOTS, policy));
        let mut engine = engine_with_store(segment, store, TypeRegistry::with_builtins());
        let code = engine.dispatch_run(ENTRY, &[]).unwrap();
        (code, engine.resolutions())
    };
    let (cached, cached_resolutions) = run(true);
    let (uncached, uncached_resolutions) = run(false);
    assert_eq!(cached, uncached);
    assert_eq!(cached_resolutions, 6);
    assert_eq!(uncached_resolutions, 9);
}
