//! Virtual Machine and bytecode execution
//!
//! This module contains the register-based dispatch loop and the pieces it
//! executes against: code segments, values, frames and the resolver that
//! backs the inline caches.

pub use debugger::{
    debugger_attach, BreakEvent, BreakReason, DebugCommand, DebuggerBridge, DebuggerState,
    LineDebugger, ScriptedDebugger,
};
pub use errors::{BridgeError, CacheError, ResolutionFailure, VMError, VMResult};
pub use executor::{DispatchEngine, OutputSink, StepOutcome, VMStatus};
pub use frames::{Frame, RegisterFile};
pub use instructions::Instruction;
pub use opcode::{InfixOp, Opcode};
pub use resolver::{builtin, builtin_names, ClassInfo, MethodImpl, Resolver, TypeRegistry};
pub use segment::{
    CallSite, CallSiteKind, Chunk, ChunkId, CodeSegment, ProgramCounter, SegmentBuilder,
    SegmentId, SiteIndex, SubHandle, Subroutine,
};
pub use value::{Heap, MemRef, Object, Value};

pub mod debugger;
pub mod errors;
pub mod executor;
pub mod frames;
pub mod instructions;
pub mod opcode;
pub mod resolver;
pub mod segment;
pub mod value;

#[cfg(test)]
mod tests;
