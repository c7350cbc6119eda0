//! Runtime values
//!
//! Objects are reference counted; their lifetime stands in for the managed
//! heap the VM is embedded in. Raw memory blocks from `sys_alloc` are owned
//! by the executing engine and addressed through [`MemRef`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::TypeTag;

/// Handle of a raw memory block owned by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef(pub u32);

/// Heap object: a class tag plus its attribute storage
pub struct Object {
    class: TypeTag,
    fields: Mutex<Vec<Value>>,
}

impl Object {
    /// `None` when the host cannot supply storage for the fields
    pub fn try_new(
        class: TypeTag,
        field_count: usize,
    ) -> Option<Self> {
        let mut fields = Vec::new();
        fields.try_reserve_exact(field_count).ok()?;
        fields.resize(field_count, Value::Null);
        Some(Self {
            class,
            fields: Mutex::new(fields),
        })
    }

    pub fn class(&self) -> TypeTag {
        self.class
    }

    pub fn field_count(&self) -> usize {
        self.fields.lock().len()
    }

    pub fn get_field(
        &self,
        offset: usize,
    ) -> Option<Value> {
        self.fields.lock().get(offset).cloned()
    }

    /// Returns `false` when `offset` is outside the object
    pub fn set_field(
        &self,
        offset: usize,
        value: Value,
    ) -> bool {
        match self.fields.lock().get_mut(offset) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

// fields are left out: an object may hold itself
impl fmt::Debug for Object {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.class)
            .field("fields", &self.field_count())
            .finish()
    }
}

/// A VM value held in a register
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Num(f64),
    Str(Arc<str>),
    Obj(Arc<Object>),
    Mem(MemRef),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn try_object(
        class: TypeTag,
        field_count: usize,
    ) -> Option<Self> {
        Object::try_new(class, field_count).map(|obj| Value::Obj(Arc::new(obj)))
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::NULL,
            Value::Int(_) => TypeTag::INT,
            Value::Num(_) => TypeTag::NUM,
            Value::Str(_) => TypeTag::STR,
            Value::Obj(obj) => obj.class(),
            Value::Mem(_) => TypeTag::MEM,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Obj(obj) => Some(obj),
            _ => None,
        }
    }

    /// Condition semantics for `goto_if`
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(i) => *i != 0,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Obj(_) | Value::Mem(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            // bitwise so that NaN results compare equal across runs
            (Value::Num(a), Value::Num(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            // identity; objects may reference themselves
            (Value::Obj(a), Value::Obj(b)) => Arc::ptr_eq(a, b),
            (Value::Mem(a), Value::Mem(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Num(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Obj(obj) => write!(f, "<{} object>", obj.class()),
            Value::Mem(m) => write!(f, "<mem #{}>", m.0),
        }
    }
}

/// Raw memory blocks handed out by `sys_alloc`
///
/// Handles are never reused; a freed handle faults on every later access.
#[derive(Debug, Default, Clone)]
pub struct Heap {
    blocks: Vec<Option<Vec<u8>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed block of `size` bytes
    ///
    /// `None` when the host allocator refuses the block or the handle
    /// space is exhausted.
    pub fn alloc(
        &mut self,
        size: usize,
    ) -> Option<MemRef> {
        let handle = u32::try_from(self.blocks.len()).ok()?;
        let mut block = Vec::new();
        block.try_reserve_exact(size).ok()?;
        block.resize(size, 0);
        self.blocks.push(Some(block));
        Some(MemRef(handle))
    }

    /// Returns `false` for an unknown or already freed handle
    pub fn free(
        &mut self,
        mem: MemRef,
    ) -> bool {
        match self.blocks.get_mut(mem.0 as usize) {
            Some(block @ Some(_)) => {
                *block = None;
                true
            }
            _ => false,
        }
    }

    pub fn block(
        &self,
        mem: MemRef,
    ) -> Option<&[u8]> {
        self.blocks.get(mem.0 as usize).and_then(|b| b.as_deref())
    }

    pub fn block_mut(
        &mut self,
        mem: MemRef,
    ) -> Option<&mut Vec<u8>> {
        self.blocks.get_mut(mem.0 as usize).and_then(|b| b.as_mut())
    }

    /// Number of blocks not yet freed
    pub fn live(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }
}
