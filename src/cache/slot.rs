//! Cache slot model
//!
//! A slot is one resolved-dispatch record: the type part of a call-site key
//! plus the target full resolution produced for it. The constant part of the
//! dispatch (method name, operator, attribute name) lives in the owning
//! [`InlineCache`](super::InlineCache) as a [`Selector`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::vm::opcode::InfixOp;
use crate::vm::segment::SubHandle;
use crate::vm::value::Value;

/// Runtime type tag of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(pub u32);

impl TypeTag {
    pub const NULL: TypeTag = TypeTag(0);
    pub const INT: TypeTag = TypeTag(1);
    pub const NUM: TypeTag = TypeTag(2);
    pub const STR: TypeTag = TypeTag(3);
    pub const MEM: TypeTag = TypeTag(4);
    /// First tag available to user classes
    pub const FIRST_CLASS: TypeTag = TypeTag(16);

    /// Name of a builtin tag, `None` for class tags
    pub fn builtin_name(self) -> Option<&'static str> {
        match self {
            TypeTag::NULL => Some("null"),
            TypeTag::INT => Some("int"),
            TypeTag::NUM => Some("num"),
            TypeTag::STR => Some("str"),
            TypeTag::MEM => Some("mem"),
            _ => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.builtin_name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "class#{}", self.0),
        }
    }
}

/// Operand type pair for binary multi-dispatch, packed as `left << 16 | right`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedTypes(u32);

impl PackedTypes {
    /// Pack two tags. Returns `None` when either tag needs more than 16 bits.
    pub fn new(
        left: TypeTag,
        right: TypeTag,
    ) -> Option<Self> {
        if left.0 > 0xFFFF || right.0 > 0xFFFF {
            return None;
        }
        Some(Self((left.0 << 16) | right.0))
    }

    pub fn left(self) -> TypeTag {
        TypeTag(self.0 >> 16)
    }

    pub fn right(self) -> TypeTag {
        TypeTag(self.0 & 0xFFFF)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Overall shape of a signature's element types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureShape {
    Empty,
    AllInt,
    AllNum,
    /// Only ints and nums, both present
    Numeric,
    Mixed,
}

/// Call signature descriptor: receiver/argument types in order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(SmallVec<[TypeTag; 4]>);

impl Signature {
    pub fn new(types: impl IntoIterator<Item = TypeTag>) -> Self {
        Self(types.into_iter().collect())
    }

    pub fn types(&self) -> &[TypeTag] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Receiver type, i.e. the first element
    pub fn receiver(&self) -> Option<TypeTag> {
        self.0.first().copied()
    }

    pub fn shape(&self) -> SignatureShape {
        shape_of(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "(")?;
        for (i, ty) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, ")")
    }
}

/// Shape of an arbitrary tag list
pub fn shape_of(types: &[TypeTag]) -> SignatureShape {
    if types.is_empty() {
        return SignatureShape::Empty;
    }
    let ints = types.iter().filter(|t| **t == TypeTag::INT).count();
    let nums = types.iter().filter(|t| **t == TypeTag::NUM).count();
    if ints == types.len() {
        SignatureShape::AllInt
    } else if nums == types.len() {
        SignatureShape::AllNum
    } else if ints + nums == types.len() {
        SignatureShape::Numeric
    } else {
        SignatureShape::Mixed
    }
}

/// Which key interpretation a call site uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Types,
    Signature,
}

/// The varying part of a call-site key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Types(PackedTypes),
    Signature(Signature),
}

impl CacheKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            CacheKey::Types(_) => KeyKind::Types,
            CacheKey::Signature(_) => KeyKind::Signature,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            CacheKey::Types(pair) => write!(f, "({}, {})", pair.left(), pair.right()),
            CacheKey::Signature(sig) => write!(f, "{}", sig),
        }
    }
}

/// Constant part of a call site's dispatch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Operator(InfixOp),
    Method(Arc<str>),
    Attribute(Arc<str>),
}

impl fmt::Display for Selector {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Selector::Operator(op) => write!(f, "infix {}", op),
            Selector::Method(name) => write!(f, "method {}", name),
            Selector::Attribute(name) => write!(f, "attribute {}", name),
        }
    }
}

/// Native entry point calling convention
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

/// Argument-passing contract of a native entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSignature {
    pub params: SmallVec<[TypeTag; 4]>,
    pub result: TypeTag,
}

impl NativeSignature {
    pub fn new(
        params: impl IntoIterator<Item = TypeTag>,
        result: TypeTag,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            result,
        }
    }
}

/// A resolved native function
pub struct NativeFunction {
    pub name: String,
    pub func: NativeFn,
    /// `None` when the native has no declared marshaling contract
    pub marshal: Option<NativeSignature>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: NativeFn,
        marshal: Option<NativeSignature>,
    ) -> Self {
        Self {
            name: name.into(),
            func,
            marshal,
        }
    }

    pub fn call(
        &self,
        args: &[Value],
    ) -> Result<Value, String> {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("marshal", &self.marshal)
            .finish()
    }
}

/// Resolved attribute storage location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrLocation {
    pub class: TypeTag,
    pub offset: u16,
}

/// What a slot dispatches to
#[derive(Debug, Clone)]
pub enum CacheTarget {
    Native(Arc<NativeFunction>),
    Sub(SubHandle),
    Attribute(AttrLocation),
}

impl PartialEq for CacheTarget {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        match (self, other) {
            (CacheTarget::Native(a), CacheTarget::Native(b)) => Arc::ptr_eq(a, b),
            (CacheTarget::Sub(a), CacheTarget::Sub(b)) => a == b,
            (CacheTarget::Attribute(a), CacheTarget::Attribute(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CacheTarget {}

impl fmt::Display for CacheTarget {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            CacheTarget::Native(native) => write!(f, "native {}", native.name),
            CacheTarget::Sub(handle) => write!(f, "sub #{}", handle.0),
            CacheTarget::Attribute(loc) => write!(f, "{}+{}", loc.class, loc.offset),
        }
    }
}

/// A fully populated slot
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub target: CacheTarget,
}

/// One cache slot: empty, or key and target written together
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CacheSlot {
    #[default]
    Empty,
    Filled(CacheEntry),
}

impl CacheSlot {
    pub fn filled(
        key: CacheKey,
        target: CacheTarget,
    ) -> Self {
        CacheSlot::Filled(CacheEntry { key, target })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CacheSlot::Empty)
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            CacheSlot::Empty => None,
            CacheSlot::Filled(entry) => Some(entry),
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.entry().map(|e| &e.key)
    }

    pub fn target(&self) -> Option<&CacheTarget> {
        self.entry().map(|e| &e.target)
    }

    /// Target when this slot holds exactly `key`
    #[inline]
    pub fn matches(
        &self,
        key: &CacheKey,
    ) -> Option<&CacheTarget> {
        match self {
            CacheSlot::Filled(entry) if entry.key == *key => Some(&entry.target),
            _ => None,
        }
    }
}
