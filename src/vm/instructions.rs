//! VM instructions
//!
//! An instruction is a raw opcode byte plus four operand words. The opcode
//! stays raw until execution so that a malformed stream faults at the
//! instruction that carries it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::vm::opcode::Opcode;

/// VM instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Opcode
    pub opcode: u8,
    /// Operands
    pub operands: [u32; 4],
}

impl Instruction {
    /// Create a new instruction
    pub fn new(
        opcode: Opcode,
        operands: [u32; 4],
    ) -> Self {
        Self {
            opcode: opcode.into(),
            operands,
        }
    }

    /// Create an instruction from a raw opcode byte
    pub fn raw(
        opcode: u8,
        operands: [u32; 4],
    ) -> Self {
        Self { opcode, operands }
    }

    /// Instruction without operands
    pub fn op0(opcode: Opcode) -> Self {
        Self::new(opcode, [0; 4])
    }

    pub fn op1(
        opcode: Opcode,
        a: u32,
    ) -> Self {
        Self::new(opcode, [a, 0, 0, 0])
    }

    pub fn op2(
        opcode: Opcode,
        a: u32,
        b: u32,
    ) -> Self {
        Self::new(opcode, [a, b, 0, 0])
    }

    pub fn op3(
        opcode: Opcode,
        a: u32,
        b: u32,
        c: u32,
    ) -> Self {
        Self::new(opcode, [a, b, c, 0])
    }

    /// Decode the opcode byte, handing back the raw byte when it is unknown
    pub fn decode(&self) -> Result<Opcode, u8> {
        Opcode::try_from(self.opcode)
    }

    /// Get operand at index
    pub fn get_operand(
        &self,
        index: usize,
    ) -> Option<u32> {
        self.operands.get(index).copied()
    }

    #[inline]
    pub fn a(&self) -> u32 {
        self.operands[0]
    }

    #[inline]
    pub fn b(&self) -> u32 {
        self.operands[1]
    }

    #[inline]
    pub fn c(&self) -> u32 {
        self.operands[2]
    }

    #[inline]
    pub fn d(&self) -> u32 {
        self.operands[3]
    }
}

impl fmt::Display for Instruction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.decode() {
            Ok(op) => write!(f, "{}", op)?,
            Err(byte) => write!(f, "Unknown(0x{:02X})", byte)?,
        }
        let [a, b, c, d] = self.operands;
        write!(f, " {}, {}, {}, {}", a, b, c, d)
    }
}
