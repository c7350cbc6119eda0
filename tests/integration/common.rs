//! Shared builders for the integration tests

use std::sync::Arc;

use parking_lot::Mutex;
use picvm::cache::{CacheStore, StoreRegistry};
use picvm::util::config::EngineConfig;
use picvm::vm::{
    CodeSegment, DispatchEngine, InfixOp, Instruction, Opcode, ProgramCounter, TypeRegistry,
};

pub const ENTRY: ProgramCounter = ProgramCounter { chunk: 0, offset: 0 };

pub fn imm(
    dst: u32,
    value: i64,
) -> Instruction {
    let bits = value as u64;
    Instruction::op3(Opcode::SetImm, dst, (bits >> 32) as u32, bits as u32)
}

pub fn infix(
    dst: u32,
    lhs: u32,
    rhs: u32,
    op: InfixOp,
) -> Instruction {
    Instruction::new(Opcode::Infix, [dst, lhs, rhs, op as u32])
}

/// Engine over `segment` with program output discarded
pub fn engine_with_store(
    segment: Arc<CodeSegment>,
    store: Arc<CacheStore>,
    registry: TypeRegistry,
) -> DispatchEngine {
    let mut engine = DispatchEngine::new(segment, store, Arc::new(registry), EngineConfig::default());
    engine.set_stdout(Arc::new(Mutex::new(std::io::sink())));
    engine
}

/// Same, with a freshly registered store
pub fn engine(
    segment: CodeSegment,
    registry: TypeRegistry,
) -> DispatchEngine {
    let store = StoreRegistry::default().on_segment_load(&segment);
    engine_with_store(Arc::new(segment), store, registry)
}
