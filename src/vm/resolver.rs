//! Full resolution
//!
//! The [`Resolver`] trait is the slow path the inline caches memoize: method
//! lookup, multi-dispatch operator selection and attribute offset lookup.
//! [`TypeRegistry`] is a table-driven implementation with builtin natives
//! for the primitive types.

use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::cache::{
    AttrLocation, CacheKey, CacheTarget, NativeFn, NativeFunction, NativeSignature, TypeTag,
};
use crate::vm::errors::ResolutionFailure;
use crate::vm::opcode::InfixOp;
use crate::vm::segment::{CallSite, CallSiteKind, SubHandle};
use crate::vm::value::Value;

/// The method/multi-dispatch subsystem, consulted on cache misses
pub trait Resolver: Send + Sync {
    /// Resolve `key` for `site`. `operands` are the live values the key was
    /// computed from, receiver or left operand first.
    fn resolve(
        &self,
        key: &CacheKey,
        site: &CallSite,
        operands: &[Value],
    ) -> Result<CacheTarget, ResolutionFailure>;
}

/// A method or operator implementation
#[derive(Debug, Clone)]
pub enum MethodImpl {
    /// Interpreted; `arity` excludes the receiver
    Sub { handle: SubHandle, arity: usize },
    Native(Arc<NativeFunction>),
}

impl MethodImpl {
    pub fn target(&self) -> CacheTarget {
        match self {
            MethodImpl::Sub { handle, .. } => CacheTarget::Sub(*handle),
            MethodImpl::Native(native) => CacheTarget::Native(native.clone()),
        }
    }

    /// Declared argument count excluding the receiver, if known
    fn arity(&self) -> Option<usize> {
        match self {
            MethodImpl::Sub { arity, .. } => Some(*arity),
            MethodImpl::Native(native) => native
                .marshal
                .as_ref()
                .map(|sig| sig.params.len().saturating_sub(1)),
        }
    }
}

/// Class layout and method table
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub tag: TypeTag,
    attributes: IndexMap<String, u16>,
    methods: IndexMap<String, MethodImpl>,
}

impl ClassInfo {
    pub fn new(
        name: &str,
        tag: TypeTag,
    ) -> Self {
        Self {
            name: name.to_string(),
            tag,
            attributes: IndexMap::new(),
            methods: IndexMap::new(),
        }
    }

    /// Add an attribute, returning its storage offset
    pub fn attribute(
        &mut self,
        name: &str,
    ) -> u16 {
        let next = self.attributes.len() as u16;
        *self.attributes.entry(name.to_string()).or_insert(next)
    }

    pub fn method(
        &mut self,
        name: &str,
        implementation: MethodImpl,
    ) -> &mut Self {
        self.methods.insert(name.to_string(), implementation);
        self
    }

    pub fn field_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn attribute_offset(
        &self,
        name: &str,
    ) -> Option<u16> {
        self.attributes.get(name).copied()
    }

    pub fn find_method(
        &self,
        name: &str,
    ) -> Option<&MethodImpl> {
        self.methods.get(name)
    }
}

/// Table-driven resolver
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    classes: IndexMap<TypeTag, ClassInfo>,
    operators: hashbrown::HashMap<(InfixOp, TypeTag, TypeTag), MethodImpl>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the primitive operator table installed
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let arith = [
            (InfixOp::Add, "add"),
            (InfixOp::Sub, "sub"),
            (InfixOp::Mul, "mul"),
            (InfixOp::Div, "div"),
            (InfixOp::Mod, "mod"),
        ];
        for (op, name) in arith {
            let int = &format!("int_{}", name);
            let num = &format!("num_{}", name);
            let mixed = &format!("mixed_{}", name);
            registry.define_builtin_operator(op, TypeTag::INT, TypeTag::INT, int);
            registry.define_builtin_operator(op, TypeTag::NUM, TypeTag::NUM, num);
            registry.define_builtin_operator(op, TypeTag::INT, TypeTag::NUM, mixed);
            registry.define_builtin_operator(op, TypeTag::NUM, TypeTag::INT, mixed);
        }
        registry.define_builtin_operator(InfixOp::Concat, TypeTag::STR, TypeTag::STR, "str_concat");
        registry.define_builtin_operator(InfixOp::Eq, TypeTag::INT, TypeTag::INT, "int_eq");
        registry.define_builtin_operator(InfixOp::Eq, TypeTag::NUM, TypeTag::NUM, "num_eq");
        registry.define_builtin_operator(InfixOp::Eq, TypeTag::STR, TypeTag::STR, "str_eq");
        registry.define_builtin_operator(InfixOp::Lt, TypeTag::INT, TypeTag::INT, "int_lt");
        registry.define_builtin_operator(InfixOp::Lt, TypeTag::NUM, TypeTag::NUM, "num_lt");

        let mut str_class = ClassInfo::new("str", TypeTag::STR);
        if let Some(len) = builtin("str_len") {
            str_class.method("len", MethodImpl::Native(len));
        }
        registry.define_class(str_class);
        registry
    }

    fn define_builtin_operator(
        &mut self,
        op: InfixOp,
        left: TypeTag,
        right: TypeTag,
        name: &str,
    ) {
        if let Some(native) = builtin(name) {
            self.define_operator(op, left, right, MethodImpl::Native(native));
        }
    }

    pub fn define_class(
        &mut self,
        class: ClassInfo,
    ) {
        self.classes.insert(class.tag, class);
    }

    pub fn define_operator(
        &mut self,
        op: InfixOp,
        left: TypeTag,
        right: TypeTag,
        implementation: MethodImpl,
    ) {
        self.operators.insert((op, left, right), implementation);
    }

    pub fn class(
        &self,
        tag: TypeTag,
    ) -> Option<&ClassInfo> {
        self.classes.get(&tag)
    }

    pub fn class_mut(
        &mut self,
        tag: TypeTag,
    ) -> Option<&mut ClassInfo> {
        self.classes.get_mut(&tag)
    }

    pub fn class_by_name(
        &self,
        name: &str,
    ) -> Option<&ClassInfo> {
        self.classes.values().find(|c| c.name == name)
    }

    pub fn lookup_operator(
        &self,
        op: InfixOp,
        left: TypeTag,
        right: TypeTag,
    ) -> Option<&MethodImpl> {
        self.operators.get(&(op, left, right))
    }
}

impl Resolver for TypeRegistry {
    fn resolve(
        &self,
        key: &CacheKey,
        site: &CallSite,
        _operands: &[Value],
    ) -> Result<CacheTarget, ResolutionFailure> {
        match (&site.kind, key) {
            (CallSiteKind::Infix(op), key) => {
                // tags too wide to pack arrive as a two-element signature
                let (left, right) = match key {
                    CacheKey::Types(pair) => (pair.left(), pair.right()),
                    CacheKey::Signature(sig) => match sig.types() {
                        [left, right] => (*left, *right),
                        _ => {
                            return Err(ResolutionFailure::KeyMismatch {
                                key: key.to_string(),
                            })
                        }
                    },
                };
                self.lookup_operator(*op, left, right)
                    .map(MethodImpl::target)
                    .ok_or(ResolutionFailure::NoOperator {
                        op: *op,
                        left,
                        right,
                    })
            }
            (CallSiteKind::Method { name, argc }, CacheKey::Signature(sig)) => {
                let receiver = sig.receiver().unwrap_or(TypeTag::NULL);
                let method = self
                    .class(receiver)
                    .and_then(|class| class.find_method(name))
                    .ok_or_else(|| ResolutionFailure::NoMethod {
                        receiver,
                        name: name.to_string(),
                    })?;
                if let Some(expected) = method.arity() {
                    if expected != *argc as usize {
                        return Err(ResolutionFailure::ArityMismatch {
                            name: name.to_string(),
                            expected,
                            given: *argc as usize,
                        });
                    }
                }
                Ok(method.target())
            }
            (
                CallSiteKind::GetAttr { name } | CallSiteKind::SetAttr { name },
                CacheKey::Signature(sig),
            ) => {
                let receiver = sig.receiver().unwrap_or(TypeTag::NULL);
                self.class(receiver)
                    .and_then(|class| class.attribute_offset(name))
                    .map(|offset| {
                        CacheTarget::Attribute(AttrLocation {
                            class: receiver,
                            offset,
                        })
                    })
                    .ok_or_else(|| ResolutionFailure::NoAttribute {
                        receiver,
                        name: name.to_string(),
                    })
            }
            (_, key) => Err(ResolutionFailure::KeyMismatch {
                key: key.to_string(),
            }),
        }
    }
}

/// Builtin native by name
pub fn builtin(name: &str) -> Option<Arc<NativeFunction>> {
    BUILTINS.get(name).cloned()
}

/// Names of all builtin natives
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.keys().copied()
}

static BUILTINS: Lazy<IndexMap<&'static str, Arc<NativeFunction>>> = Lazy::new(|| {
    let ii = || Some(NativeSignature::new([TypeTag::INT, TypeTag::INT], TypeTag::INT));
    let nn = || Some(NativeSignature::new([TypeTag::NUM, TypeTag::NUM], TypeTag::NUM));
    let nn_i = || Some(NativeSignature::new([TypeTag::NUM, TypeTag::NUM], TypeTag::INT));
    let ss = || Some(NativeSignature::new([TypeTag::STR, TypeTag::STR], TypeTag::STR));
    let ss_i = || Some(NativeSignature::new([TypeTag::STR, TypeTag::STR], TypeTag::INT));

    vec![
        native("int_add", int_add, ii()),
        native("int_sub", int_sub, ii()),
        native("int_mul", int_mul, ii()),
        native("int_div", int_div, ii()),
        native("int_mod", int_mod, ii()),
        native("num_add", num_add, nn()),
        native("num_sub", num_sub, nn()),
        native("num_mul", num_mul, nn()),
        native("num_div", num_div, nn()),
        native("num_mod", num_mod, nn()),
        // operand order varies, so no fixed contract
        native("mixed_add", num_add, None),
        native("mixed_sub", num_sub, None),
        native("mixed_mul", num_mul, None),
        native("mixed_div", num_div, None),
        native("mixed_mod", num_mod, None),
        native("str_concat", str_concat, ss()),
        native("int_eq", value_eq, ii()),
        native("num_eq", value_eq, nn_i()),
        native("str_eq", value_eq, ss_i()),
        native("int_lt", int_lt, ii()),
        native("num_lt", num_lt, nn_i()),
        native(
            "str_len",
            str_len,
            Some(NativeSignature::new([TypeTag::STR], TypeTag::INT)),
        ),
        native("debug_repr", debug_repr, None),
    ]
    .into_iter()
    .collect()
});

fn native(
    name: &'static str,
    func: NativeFn,
    marshal: Option<NativeSignature>,
) -> (&'static str, Arc<NativeFunction>) {
    (name, Arc::new(NativeFunction::new(name, func, marshal)))
}

fn ints(args: &[Value]) -> Result<(i64, i64), String> {
    match args {
        [Value::Int(a), Value::Int(b)] => Ok((*a, *b)),
        _ => Err(format!("expected (int, int), got {} arguments", args.len())),
    }
}

fn nums(args: &[Value]) -> Result<(f64, f64), String> {
    let as_f64 = |v: &Value| match v {
        Value::Int(i) => Some(*i as f64),
        Value::Num(n) => Some(*n),
        _ => None,
    };
    match args {
        [a, b] => match (as_f64(a), as_f64(b)) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err("expected numeric operands".to_string()),
        },
        _ => Err(format!("expected 2 arguments, got {}", args.len())),
    }
}

fn int_add(args: &[Value]) -> Result<Value, String> {
    let (a, b) = ints(args)?;
    a.checked_add(b)
        .map(Value::Int)
        .ok_or_else(|| "integer overflow".to_string())
}

fn int_sub(args: &[Value]) -> Result<Value, String> {
    let (a, b) = ints(args)?;
    a.checked_sub(b)
        .map(Value::Int)
        .ok_or_else(|| "integer overflow".to_string())
}

fn int_mul(args: &[Value]) -> Result<Value, String> {
    let (a, b) = ints(args)?;
    a.checked_mul(b)
        .map(Value::Int)
        .ok_or_else(|| "integer overflow".to_string())
}

fn int_div(args: &[Value]) -> Result<Value, String> {
    let (a, b) = ints(args)?;
    if b == 0 {
        return Err("division by zero".to_string());
    }
    a.checked_div(b)
        .map(Value::Int)
        .ok_or_else(|| "integer overflow".to_string())
}

fn int_mod(args: &[Value]) -> Result<Value, String> {
    let (a, b) = ints(args)?;
    if b == 0 {
        return Err("division by zero".to_string());
    }
    a.checked_rem(b)
        .map(Value::Int)
        .ok_or_else(|| "integer overflow".to_string())
}

fn num_add(args: &[Value]) -> Result<Value, String> {
    nums(args).map(|(a, b)| Value::Num(a + b))
}

fn num_sub(args: &[Value]) -> Result<Value, String> {
    nums(args).map(|(a, b)| Value::Num(a - b))
}

fn num_mul(args: &[Value]) -> Result<Value, String> {
    nums(args).map(|(a, b)| Value::Num(a * b))
}

fn num_div(args: &[Value]) -> Result<Value, String> {
    nums(args).map(|(a, b)| Value::Num(a / b))
}

fn num_mod(args: &[Value]) -> Result<Value, String> {
    nums(args).map(|(a, b)| Value::Num(a % b))
}

fn str_concat(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Str(a), Value::Str(b)] => Ok(Value::str(&format!("{}{}", a, b))),
        _ => Err("expected (str, str)".to_string()),
    }
}

fn value_eq(args: &[Value]) -> Result<Value, String> {
    match args {
        [a, b] => Ok(Value::Int((a == b) as i64)),
        _ => Err(format!("expected 2 arguments, got {}", args.len())),
    }
}

fn int_lt(args: &[Value]) -> Result<Value, String> {
    ints(args).map(|(a, b)| Value::Int((a < b) as i64))
}

fn num_lt(args: &[Value]) -> Result<Value, String> {
    nums(args).map(|(a, b)| Value::Int((a < b) as i64))
}

fn str_len(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
        _ => Err("expected (str)".to_string()),
    }
}

fn debug_repr(args: &[Value]) -> Result<Value, String> {
    Ok(Value::str(&format!("{:?}", args)))
}
