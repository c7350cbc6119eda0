//! Code segments
//!
//! A segment is an immutable unit of loaded code: chunks of instructions, a
//! constant pool and the subroutine table. Loading a segment classifies every
//! cache-carrying instruction into a [`CallSite`] with a stable index; the
//! segment's [`CacheStore`](crate::cache::CacheStore) holds one inline cache
//! per site index.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{KeyKind, Selector, TypeTag};
use crate::vm::errors::{VMError, VMResult};
use crate::vm::instructions::Instruction;
use crate::vm::opcode::{InfixOp, Opcode};
use crate::vm::value::Value;

/// Identifies a loaded segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

/// Index of a chunk inside its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

/// Index of a subroutine inside its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubHandle(pub u32);

/// Stable call-site number within a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SiteIndex(pub u32);

impl fmt::Display for SiteIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "site#{}", self.0)
    }
}

/// Instruction location: chunk plus offset into it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramCounter {
    pub chunk: u32,
    pub offset: u32,
}

impl ProgramCounter {
    pub fn new(
        chunk: u32,
        offset: u32,
    ) -> Self {
        Self { chunk, offset }
    }

    pub fn next(self) -> Self {
        Self {
            chunk: self.chunk,
            offset: self.offset + 1,
        }
    }
}

impl fmt::Display for ProgramCounter {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}", self.chunk, self.offset)
    }
}

impl FromStr for ProgramCounter {
    type Err = String;

    /// Accepts `chunk:offset`, or a bare offset into chunk 0
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid program counter: {:?}", s))
        };
        match s.split_once(':') {
            Some((chunk, offset)) => Ok(Self::new(parse(chunk)?, parse(offset)?)),
            None => Ok(Self::new(0, parse(s)?)),
        }
    }
}

/// A named run of instructions
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub code: Vec<Instruction>,
}

/// Interpreted subroutine
#[derive(Debug, Clone)]
pub struct Subroutine {
    pub name: String,
    /// Entry chunk; execution starts at offset 0
    pub chunk: ChunkId,
    /// Parameter types, receiver first for methods
    pub params: Vec<TypeTag>,
    pub result: TypeTag,
}

/// What a call site dispatches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSiteKind {
    Infix(InfixOp),
    Method { name: Arc<str>, argc: u32 },
    GetAttr { name: Arc<str> },
    SetAttr { name: Arc<str> },
}

impl CallSiteKind {
    /// Key interpretation fixed at classification time
    pub fn key_kind(&self) -> KeyKind {
        match self {
            CallSiteKind::Infix(_) => KeyKind::Types,
            _ => KeyKind::Signature,
        }
    }

    pub fn selector(&self) -> Selector {
        match self {
            CallSiteKind::Infix(op) => Selector::Operator(*op),
            CallSiteKind::Method { name, .. } => Selector::Method(name.clone()),
            CallSiteKind::GetAttr { name } | CallSiteKind::SetAttr { name } => {
                Selector::Attribute(name.clone())
            }
        }
    }
}

/// A classified cache-carrying instruction
#[derive(Debug, Clone)]
pub struct CallSite {
    pub index: SiteIndex,
    pub pc: ProgramCounter,
    pub kind: CallSiteKind,
}

/// Immutable loaded code
#[derive(Debug)]
pub struct CodeSegment {
    id: SegmentId,
    chunks: Vec<Chunk>,
    constants: Vec<Value>,
    subs: Vec<Subroutine>,
    sites: Vec<CallSite>,
    site_by_pc: HashMap<ProgramCounter, SiteIndex>,
}

impl CodeSegment {
    /// Load a segment and classify its call sites
    ///
    /// Unknown opcode bytes are left alone here; they fault when executed.
    pub fn new(
        id: SegmentId,
        chunks: Vec<Chunk>,
        constants: Vec<Value>,
        subs: Vec<Subroutine>,
    ) -> VMResult<Self> {
        for sub in &subs {
            if sub.chunk.0 as usize >= chunks.len() {
                return Err(VMError::InvalidState(format!(
                    "subroutine '{}' refers to missing chunk {}",
                    sub.name, sub.chunk.0
                )));
            }
        }

        let mut sites = Vec::new();
        let mut site_by_pc = HashMap::new();
        for (chunk_idx, chunk) in chunks.iter().enumerate() {
            for (offset, instr) in chunk.code.iter().enumerate() {
                let Ok(op) = instr.decode() else {
                    continue;
                };
                if !op.is_cached() {
                    continue;
                }
                let pc = ProgramCounter::new(chunk_idx as u32, offset as u32);
                let kind = classify(op, instr, &constants, pc)?;
                let index = SiteIndex(sites.len() as u32);
                site_by_pc.insert(pc, index);
                sites.push(CallSite { index, pc, kind });
            }
        }

        tracing::debug!(
            "loaded segment {} with {} chunks and {} call sites",
            id.0,
            chunks.len(),
            sites.len()
        );

        Ok(Self {
            id,
            chunks,
            constants,
            subs,
            sites,
            site_by_pc,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(
        &self,
        id: ChunkId,
    ) -> Option<&Chunk> {
        self.chunks.get(id.0 as usize)
    }

    pub fn instruction_at(
        &self,
        pc: ProgramCounter,
    ) -> Option<&Instruction> {
        self.chunks
            .get(pc.chunk as usize)
            .and_then(|c| c.code.get(pc.offset as usize))
    }

    pub fn constant(
        &self,
        index: u32,
    ) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn sub(
        &self,
        handle: SubHandle,
    ) -> Option<&Subroutine> {
        self.subs.get(handle.0 as usize)
    }

    pub fn subs(&self) -> &[Subroutine] {
        &self.subs
    }

    pub fn sites(&self) -> &[CallSite] {
        &self.sites
    }

    pub fn site(
        &self,
        index: SiteIndex,
    ) -> Option<&CallSite> {
        self.sites.get(index.0 as usize)
    }

    pub fn site_at(
        &self,
        pc: ProgramCounter,
    ) -> Option<&CallSite> {
        self.site_by_pc.get(&pc).and_then(|idx| self.site(*idx))
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }
}

fn classify(
    op: Opcode,
    instr: &Instruction,
    constants: &[Value],
    pc: ProgramCounter,
) -> VMResult<CallSiteKind> {
    let name_at = |index: u32| -> VMResult<Arc<str>> {
        match constants.get(index as usize) {
            Some(Value::Str(s)) => Ok(s.clone()),
            _ => Err(VMError::MalformedInstruction {
                pc,
                reason: format!("{} expects a string constant at index {}", op, index),
            }),
        }
    };

    match op {
        Opcode::Infix => InfixOp::try_from(instr.d())
            .map(CallSiteKind::Infix)
            .map_err(|raw| VMError::MalformedInstruction {
                pc,
                reason: format!("unknown infix operator {}", raw),
            }),
        Opcode::CallMethod => Ok(CallSiteKind::Method {
            name: name_at(instr.d())?,
            argc: instr.c(),
        }),
        Opcode::GetAttr => Ok(CallSiteKind::GetAttr {
            name: name_at(instr.c())?,
        }),
        Opcode::SetAttr => Ok(CallSiteKind::SetAttr {
            name: name_at(instr.b())?,
        }),
        other => Err(VMError::MalformedInstruction {
            pc,
            reason: format!("{} does not carry an inline cache", other),
        }),
    }
}

/// Incremental segment construction, used by front ends and tests
#[derive(Debug, Default)]
pub struct SegmentBuilder {
    id: u32,
    chunks: Vec<Chunk>,
    constants: Vec<Value>,
    subs: Vec<Subroutine>,
}

impl SegmentBuilder {
    pub fn new(id: SegmentId) -> Self {
        Self {
            id: id.0,
            ..Self::default()
        }
    }

    /// Add a constant, reusing an equal existing entry
    pub fn constant(
        &mut self,
        value: Value,
    ) -> u32 {
        if let Some(pos) = self.constants.iter().position(|c| *c == value) {
            return pos as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    /// Append a constant without folding duplicates
    pub fn push_constant(
        &mut self,
        value: Value,
    ) -> u32 {
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    pub fn string(
        &mut self,
        s: &str,
    ) -> u32 {
        self.constant(Value::str(s))
    }

    pub fn chunk(
        &mut self,
        name: &str,
        code: Vec<Instruction>,
    ) -> ChunkId {
        self.chunks.push(Chunk {
            name: name.to_string(),
            code,
        });
        ChunkId((self.chunks.len() - 1) as u32)
    }

    pub fn sub(
        &mut self,
        name: &str,
        chunk: ChunkId,
        params: Vec<TypeTag>,
        result: TypeTag,
    ) -> SubHandle {
        self.subs.push(Subroutine {
            name: name.to_string(),
            chunk,
            params,
            result,
        });
        SubHandle((self.subs.len() - 1) as u32)
    }

    pub fn build(self) -> VMResult<CodeSegment> {
        CodeSegment::new(SegmentId(self.id), self.chunks, self.constants, self.subs)
    }
}
