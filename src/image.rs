//! Program images
//!
//! A program image is a serialized code segment plus the class, method and
//! operator tables the resolver needs. The command-line driver reads images
//! written in RON (or JSON, chosen by file extension):
//!
//! ```ron
//! (
//!     constants: [Str("len")],
//!     chunks: [
//!         (name: "main", code: [
//!             (op: set_imm, args: [0, 0, 2]),
//!             (op: set_imm, args: [1, 0, 40]),
//!             (op: infix, args: [2, 0, 1, 0]),
//!             (op: exit, args: [2]),
//!         ]),
//!     ],
//! )
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::TypeTag;
use crate::vm::errors::VMError;
use crate::vm::instructions::Instruction;
use crate::vm::opcode::{InfixOp, Opcode};
use crate::vm::resolver::{builtin, ClassInfo, MethodImpl, TypeRegistry};
use crate::vm::segment::{ChunkId, CodeSegment, ProgramCounter, SegmentBuilder, SegmentId, SubHandle};
use crate::vm::value::Value;

/// Image loading errors
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image parse error: {0}")]
    Parse(String),

    #[error("Unknown chunk '{0}'")]
    UnknownChunk(String),

    #[error("Unknown subroutine '{0}'")]
    UnknownSub(String),

    #[error("Unknown builtin '{0}'")]
    UnknownBuiltin(String),

    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Method '{0}' needs exactly one of `sub` or `builtin`")]
    AmbiguousImpl(String),

    #[error("Instruction {index} of chunk '{chunk}' has {count} operands, at most 4 allowed")]
    TooManyOperands {
        chunk: String,
        index: usize,
        count: usize,
    },

    #[error("Class tag {tag} of '{name}' collides with a builtin type")]
    ReservedTag { name: String, tag: u32 },

    #[error("Invalid entry point: {0}")]
    Entry(String),

    #[error(transparent)]
    Segment(#[from] VMError),
}

/// A constant pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantImage {
    Null,
    Int(i64),
    Num(f64),
    Str(String),
}

impl From<&ConstantImage> for Value {
    fn from(constant: &ConstantImage) -> Self {
        match constant {
            ConstantImage::Null => Value::Null,
            ConstantImage::Int(i) => Value::Int(*i),
            ConstantImage::Num(n) => Value::Num(*n),
            ConstantImage::Str(s) => Value::str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrImage {
    pub op: Opcode,
    #[serde(default)]
    pub args: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkImage {
    pub name: String,
    pub code: Vec<InstrImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubImage {
    pub name: String,
    /// Entry chunk name
    pub chunk: String,
    /// Type names, receiver first for methods
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_result")]
    pub result: String,
}

fn default_result() -> String {
    "null".to_string()
}

/// A method implemented by an interpreted sub or a builtin native
///
/// Exactly one of `sub` and `builtin` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodImage {
    pub name: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub builtin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassImage {
    pub name: String,
    /// Type tag, at least 16
    pub tag: u32,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorImage {
    pub op: InfixOp,
    pub left: String,
    pub right: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub builtin: String,
}

/// Serialized program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramImage {
    #[serde(default)]
    pub segment: u32,
    #[serde(default)]
    pub constants: Vec<ConstantImage>,
    pub chunks: Vec<ChunkImage>,
    #[serde(default)]
    pub subs: Vec<SubImage>,
    #[serde(default)]
    pub classes: Vec<ClassImage>,
    #[serde(default)]
    pub operators: Vec<OperatorImage>,
    /// `chunk:offset`
    #[serde(default = "default_entry")]
    pub entry: String,
    /// Start from the builtin operator table
    #[serde(default = "default_builtins")]
    pub builtins: bool,
}

fn default_builtins() -> bool {
    true
}

fn default_entry() -> String {
    "0:0".to_string()
}

/// A program ready to run
#[derive(Debug)]
pub struct LoadedImage {
    pub segment: Arc<CodeSegment>,
    pub registry: TypeRegistry,
    pub entry: ProgramCounter,
}

impl ProgramImage {
    pub fn from_ron(text: &str) -> Result<Self, ImageError> {
        ron::from_str(text).map_err(|e| ImageError::Parse(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ImageError> {
        serde_json::from_str(text).map_err(|e| ImageError::Parse(e.to_string()))
    }

    /// Parse by file extension: `.json` is JSON, anything else RON
    pub fn from_path_text(
        path: &Path,
        text: &str,
    ) -> Result<Self, ImageError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(text),
            _ => Self::from_ron(text),
        }
    }

    /// Build the segment and the resolver tables
    pub fn load(&self) -> Result<LoadedImage, ImageError> {
        for class in &self.classes {
            if class.tag < TypeTag::FIRST_CLASS.0 {
                return Err(ImageError::ReservedTag {
                    name: class.name.clone(),
                    tag: class.tag,
                });
            }
        }

        let mut builder = SegmentBuilder::new(SegmentId(self.segment));
        for constant in &self.constants {
            // keep indices stable: duplicates are not folded here
            builder.push_constant(Value::from(constant));
        }

        let mut chunk_ids = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            let code = chunk
                .code
                .iter()
                .enumerate()
                .map(|(index, instr)| encode(chunk, index, instr))
                .collect::<Result<Vec<_>, _>>()?;
            chunk_ids.push((chunk.name.as_str(), builder.chunk(&chunk.name, code)));
        }
        let chunk_by_name = |name: &str| -> Result<ChunkId, ImageError> {
            chunk_ids
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, id)| *id)
                .ok_or_else(|| ImageError::UnknownChunk(name.to_string()))
        };

        let mut sub_handles: Vec<(&str, SubHandle, usize)> = Vec::new();
        for sub in &self.subs {
            let params = sub
                .params
                .iter()
                .map(|p| self.type_tag(p))
                .collect::<Result<Vec<_>, _>>()?;
            let result = self.type_tag(&sub.result)?;
            let arity = params.len();
            let handle = builder.sub(&sub.name, chunk_by_name(&sub.chunk)?, params, result);
            sub_handles.push((sub.name.as_str(), handle, arity));
        }
        let implementation =
            |name: &str, sub: &str, native: &str| -> Result<MethodImpl, ImageError> {
                match (sub.is_empty(), native.is_empty()) {
                    (false, true) => sub_handles
                        .iter()
                        .find(|(n, _, _)| *n == sub)
                        .map(|(_, handle, arity)| MethodImpl::Sub {
                            handle: *handle,
                            arity: arity.saturating_sub(1),
                        })
                        .ok_or_else(|| ImageError::UnknownSub(sub.to_string())),
                    (true, false) => builtin(native)
                        .map(MethodImpl::Native)
                        .ok_or_else(|| ImageError::UnknownBuiltin(native.to_string())),
                    _ => Err(ImageError::AmbiguousImpl(name.to_string())),
                }
            };

        let mut registry = if self.builtins {
            TypeRegistry::with_builtins()
        } else {
            TypeRegistry::new()
        };
        for class in &self.classes {
            let mut info = ClassInfo::new(&class.name, TypeTag(class.tag));
            for attribute in &class.attributes {
                info.attribute(attribute);
            }
            for method in &class.methods {
                info.method(
                    &method.name,
                    implementation(&method.name, &method.sub, &method.builtin)?,
                );
            }
            registry.define_class(info);
        }
        for operator in &self.operators {
            let name = operator.op.name();
            registry.define_operator(
                operator.op,
                self.type_tag(&operator.left)?,
                self.type_tag(&operator.right)?,
                implementation(name, &operator.sub, &operator.builtin)?,
            );
        }

        let entry = self
            .entry
            .parse::<ProgramCounter>()
            .map_err(ImageError::Entry)?;

        Ok(LoadedImage {
            segment: Arc::new(builder.build()?),
            registry,
            entry,
        })
    }

    /// Builtin type name or declared class name
    fn type_tag(
        &self,
        name: &str,
    ) -> Result<TypeTag, ImageError> {
        let builtin = [
            TypeTag::NULL,
            TypeTag::INT,
            TypeTag::NUM,
            TypeTag::STR,
            TypeTag::MEM,
        ]
        .into_iter()
        .find(|tag| tag.builtin_name() == Some(name));
        builtin
            .or_else(|| {
                self.classes
                    .iter()
                    .find(|c| c.name == name)
                    .map(|c| TypeTag(c.tag))
            })
            .ok_or_else(|| ImageError::UnknownType(name.to_string()))
    }
}

fn encode(
    chunk: &ChunkImage,
    index: usize,
    instr: &InstrImage,
) -> Result<Instruction, ImageError> {
    if instr.args.len() > 4 {
        return Err(ImageError::TooManyOperands {
            chunk: chunk.name.clone(),
            index,
            count: instr.args.len(),
        });
    }
    let mut operands = [0u32; 4];
    operands[..instr.args.len()].copy_from_slice(&instr.args);
    Ok(Instruction::new(instr.op, operands))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POINT: &str = r#"(
        constants: [Str("x"), Str("norm")],
        chunks: [
            (name: "main", code: [
                (op: gc_alloc, args: [0, 16, 1]),
                (op: set_imm, args: [1, 0, 3]),
                (op: set_attr, args: [0, 0, 1]),
                (op: call_method, args: [2, 0, 0, 1]),
                (op: exit, args: [2]),
            ]),
            (name: "norm", code: [
                (op: get_attr, args: [1, 0, 0]),
                (op: ret, args: [1]),
            ]),
        ],
        subs: [(name: "norm", chunk: "norm", params: ["Point"], result: "int")],
        classes: [(name: "Point", tag: 16, attributes: ["x"], methods: [(name: "norm", sub: "norm")])],
    )"#;

    #[test]
    fn test_load_ron_image() {
        let loaded = ProgramImage::from_ron(POINT).unwrap().load().unwrap();
        assert_eq!(loaded.segment.site_count(), 3);
        assert_eq!(loaded.entry, ProgramCounter::new(0, 0));
        let class = loaded.registry.class_by_name("Point").unwrap();
        assert_eq!(class.attribute_offset("x"), Some(0));
        assert!(matches!(
            class.find_method("norm"),
            Some(MethodImpl::Sub { arity: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_builtin() {
        let text = r#"(
            chunks: [(name: "main", code: [])],
            operators: [(op: add, left: "str", right: "int", builtin: "nope")],
        )"#;
        let err = ProgramImage::from_ron(text).unwrap().load().unwrap_err();
        assert!(matches!(err, ImageError::UnknownBuiltin(name) if name == "nope"));
    }

    #[test]
    fn test_reserved_class_tag() {
        let text = r#"(
            chunks: [(name: "main", code: [])],
            classes: [(name: "Bad", tag: 2)],
        )"#;
        let err = ProgramImage::from_ron(text).unwrap().load().unwrap_err();
        assert!(matches!(err, ImageError::ReservedTag { tag: 2, .. }));
    }

    #[test]
    fn test_json_image() {
        let text = r#"{
            "chunks": [{"name": "main", "code": [{"op": "exit", "args": [0]}]}],
            "entry": "0:0"
        }"#;
        let image = ProgramImage::from_path_text(Path::new("p.json"), text).unwrap();
        assert_eq!(image.chunks[0].code[0].op, Opcode::Exit);
        assert!(image.builtins);
    }

    #[test]
    fn test_too_many_operands() {
        let text = r#"(chunks: [(name: "main", code: [(op: noop, args: [1, 2, 3, 4, 5])])])"#;
        let err = ProgramImage::from_ron(text).unwrap().load().unwrap_err();
        assert!(matches!(err, ImageError::TooManyOperands { count: 5, .. }));
    }
}
