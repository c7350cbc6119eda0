//! VM errors

use thiserror::Error;

use crate::cache::TypeTag;
use crate::vm::opcode::InfixOp;
use crate::vm::segment::ProgramCounter;

/// VM result
pub type VMResult<T> = Result<T, VMError>;

/// Faults that end the current execution context
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VMError {
    #[error("Invalid opcode 0x{opcode:02X} at {pc}")]
    InvalidOpcode { pc: ProgramCounter, opcode: u8 },

    #[error("Malformed instruction at {pc}: {reason}")]
    MalformedInstruction { pc: ProgramCounter, reason: String },

    #[error("Program counter {pc} is outside the code segment")]
    PcOutOfRange { pc: ProgramCounter },

    #[error("No applicable target for {selector} with key {key} at {pc}: {failure}")]
    Resolution {
        pc: ProgramCounter,
        selector: String,
        key: String,
        failure: ResolutionFailure,
    },

    #[error("Type error at {pc}: {message}")]
    TypeError { pc: ProgramCounter, message: String },

    #[error("Division by zero at {pc}")]
    DivisionByZero { pc: ProgramCounter },

    #[error("Register r{index} out of range at {pc}")]
    RegisterOutOfRange { pc: ProgramCounter, index: u32 },

    #[error("Invalid memory access at {pc}: {message}")]
    InvalidMemory { pc: ProgramCounter, message: String },

    #[error("Native '{name}' failed at {pc}: {message}")]
    NativeFault {
        pc: ProgramCounter,
        name: String,
        message: String,
    },

    #[error("Call stack overflow (depth {depth}) at {pc}")]
    CallStackOverflow { pc: ProgramCounter, depth: usize },

    #[error("Output error at {pc}: {message}")]
    Output { pc: ProgramCounter, message: String },

    #[error("Cache store generation {generation} released while still referenced ({refs} references)")]
    UnreachableStoreRelease { generation: u64, refs: usize },

    #[error("Execution terminated by debugger at {pc}")]
    Terminated { pc: ProgramCounter },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl VMError {
    /// Instruction location the fault was raised at, if any
    pub fn pc(&self) -> Option<ProgramCounter> {
        match self {
            VMError::InvalidOpcode { pc, .. }
            | VMError::MalformedInstruction { pc, .. }
            | VMError::PcOutOfRange { pc }
            | VMError::Resolution { pc, .. }
            | VMError::TypeError { pc, .. }
            | VMError::DivisionByZero { pc }
            | VMError::RegisterOutOfRange { pc, .. }
            | VMError::InvalidMemory { pc, .. }
            | VMError::NativeFault { pc, .. }
            | VMError::CallStackOverflow { pc, .. }
            | VMError::Output { pc, .. }
            | VMError::Terminated { pc } => Some(*pc),
            VMError::UnreachableStoreRelease { .. } | VMError::InvalidState(_) => None,
        }
    }

    /// A user-visible program error, as opposed to a VM defect or malformed code
    pub fn is_program_error(&self) -> bool {
        matches!(
            self,
            VMError::Resolution { .. }
                | VMError::TypeError { .. }
                | VMError::DivisionByZero { .. }
                | VMError::NativeFault { .. }
                | VMError::InvalidMemory { .. }
                | VMError::CallStackOverflow { .. }
        )
    }
}

/// Cache store allocation errors; absorbed by the cache protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Out of cache space: requested {requested} bytes, {usable} usable")]
    OutOfCacheSpace { requested: usize, usable: usize },
}

/// Full resolution found no applicable target
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionFailure {
    #[error("no method '{name}' for {receiver}")]
    NoMethod { receiver: TypeTag, name: String },

    #[error("no operator '{op}' for ({left}, {right})")]
    NoOperator {
        op: InfixOp,
        left: TypeTag,
        right: TypeTag,
    },

    #[error("no attribute '{name}' on {receiver}")]
    NoAttribute { receiver: TypeTag, name: String },

    #[error("'{name}' expects {expected} arguments, got {given}")]
    ArityMismatch {
        name: String,
        expected: usize,
        given: usize,
    },

    #[error("key {key} does not fit this call site")]
    KeyMismatch { key: String },
}

/// Debugger bridge failures; the engine treats them as `continue`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("malformed debugger command: {0:?}")]
    MalformedCommand(String),

    #[error("debugger input closed")]
    InputClosed,

    #[error("debugger I/O error: {0}")]
    Io(String),
}
