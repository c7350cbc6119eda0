//! Call frames
//!
//! A frame carries the program counter and the register file of one
//! activation. Interpreted targets of cached dispatch get a fresh frame;
//! native targets run on the caller's frame.

use crate::vm::segment::{ProgramCounter, SubHandle};
use crate::vm::value::Value;

/// Default number of registers per frame
pub const GENERAL_PURPOSE_REGS: usize = 256;

/// Register file for one frame
///
/// Registers are indexed from 0 to N-1 and start out null.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterFile {
    registers: Vec<Value>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// Create a new register file with default size
    pub fn new() -> Self {
        Self::with_size(GENERAL_PURPOSE_REGS)
    }

    /// Create a register file with specified size
    pub fn with_size(size: usize) -> Self {
        Self {
            registers: vec![Value::Null; size],
        }
    }

    /// Get the number of registers
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Get a register value
    pub fn get(
        &self,
        index: usize,
    ) -> Option<&Value> {
        self.registers.get(index)
    }

    /// Set a register value; `false` when the index is out of range
    pub fn set(
        &mut self,
        index: usize,
        value: Value,
    ) -> bool {
        match self.registers.get_mut(index) {
            Some(reg) => {
                *reg = value;
                true
            }
            None => false,
        }
    }

    /// Get all registers as a slice
    pub fn as_slice(&self) -> &[Value] {
        &self.registers
    }
}

/// Call frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Subroutine this frame runs, `None` for the entry frame
    pub sub: Option<SubHandle>,
    /// Next instruction to execute
    pub pc: ProgramCounter,
    /// Register file for this frame
    pub registers: RegisterFile,
    /// Caller register that receives this frame's return value
    pub return_dst: Option<u32>,
}

impl Frame {
    /// Create a new frame starting at `pc`
    pub fn new(
        sub: Option<SubHandle>,
        pc: ProgramCounter,
        register_count: usize,
    ) -> Self {
        Self {
            sub,
            pc,
            registers: RegisterFile::with_size(register_count),
            return_dst: None,
        }
    }

    /// Create a new frame with arguments in registers 0..n
    pub fn with_args(
        sub: Option<SubHandle>,
        pc: ProgramCounter,
        register_count: usize,
        args: &[Value],
    ) -> Self {
        let mut frame = Self::new(sub, pc, register_count.max(args.len()));
        for (i, arg) in args.iter().enumerate() {
            frame.registers.set(i, arg.clone());
        }
        frame
    }

    pub fn register(
        &self,
        index: u32,
    ) -> Option<&Value> {
        self.registers.get(index as usize)
    }
}
