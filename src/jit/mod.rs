//! JIT 安全性分析
//!
//! 根据调用点内联缓存的历史（是否退化为 megamorphic、目标是否仍在缓存中）
//! 以及目标本身的性质（原生函数是否声明了参数传递约定、子程序是否只包含
//! 可提前编译的指令）判断能否提前编译该调用点的目标。
//!
//! 结论只是建议：解释执行始终可用，"不安全" 不是错误。

use std::fmt;
use std::ops::BitOr;

use serde::Serialize;

use crate::cache::{
    shape_of, CacheStore, CacheTarget, InlineCache, SignatureShape, TypeTag,
};
use crate::vm::opcode::Opcode;
use crate::vm::segment::{CodeSegment, ProgramCounter, SiteIndex, SubHandle};

/// 参数/返回值形状位掩码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
#[serde(transparent)]
pub struct JitFlags(u32);

impl JitFlags {
    pub const NONE: JitFlags = JitFlags(0);
    /// 所有参数都是 int
    pub const INT_ARGS: JitFlags = JitFlags(1 << 0);
    /// 所有参数都是 num
    pub const NUM_ARGS: JitFlags = JitFlags(1 << 1);
    pub const INT_RESULT: JitFlags = JitFlags(1 << 2);
    pub const NUM_RESULT: JitFlags = JitFlags(1 << 3);
    /// 目标内部没有再分派的调用点
    pub const LEAF: JitFlags = JitFlags(1 << 4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(
        self,
        other: JitFlags,
    ) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn for_signature(
        params: &[TypeTag],
        result: TypeTag,
    ) -> JitFlags {
        let mut flags = match shape_of(params) {
            SignatureShape::AllInt => JitFlags::INT_ARGS,
            SignatureShape::AllNum => JitFlags::NUM_ARGS,
            _ => JitFlags::NONE,
        };
        if result == TypeTag::INT {
            flags = flags | JitFlags::INT_RESULT;
        } else if result == TypeTag::NUM {
            flags = flags | JitFlags::NUM_RESULT;
        }
        flags
    }
}

impl BitOr for JitFlags {
    type Output = JitFlags;

    fn bitor(
        self,
        rhs: JitFlags,
    ) -> JitFlags {
        JitFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for JitFlags {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let names = [
            (JitFlags::INT_ARGS, "int_args"),
            (JitFlags::NUM_ARGS, "num_args"),
            (JitFlags::INT_RESULT, "int_result"),
            (JitFlags::NUM_RESULT, "num_result"),
            (JitFlags::LEAF, "leaf"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// 不能提前编译的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnsafeReason {
    /// 调用点已退化，类型不稳定
    Megamorphic,
    /// 调用点还没有解析过
    NoResolution,
    /// 查询的目标不在该调用点的缓存中
    TargetNotCached,
    /// 原生函数没有声明参数传递约定
    NativeWithoutMarshal { name: String },
    /// 属性位置不是可调用目标
    NotASubroutine,
    /// 子程序包含无法提前编译的指令
    UnsupportedOpcode { pc: ProgramCounter, opcode: u8 },
    MissingSub { handle: u32 },
    UnknownSite { site: u32 },
}

impl fmt::Display for UnsafeReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            UnsafeReason::Megamorphic => write!(f, "call site is megamorphic"),
            UnsafeReason::NoResolution => write!(f, "call site has not been resolved"),
            UnsafeReason::TargetNotCached => write!(f, "target is not cached at this site"),
            UnsafeReason::NativeWithoutMarshal { name } => {
                write!(f, "native '{}' has no marshaling contract", name)
            }
            UnsafeReason::NotASubroutine => write!(f, "target is an attribute location"),
            UnsafeReason::UnsupportedOpcode { pc, opcode } => match Opcode::try_from(*opcode) {
                Ok(op) => write!(f, "{} at {} cannot be compiled", op, pc),
                Err(raw) => write!(f, "unknown opcode 0x{:02X} at {}", raw, pc),
            },
            UnsafeReason::MissingSub { handle } => write!(f, "subroutine #{} does not exist", handle),
            UnsafeReason::UnknownSite { site } => write!(f, "site#{} does not exist", site),
        }
    }
}

/// 分析结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitVerdict {
    pub safe: bool,
    pub reasons: Vec<UnsafeReason>,
    pub flags: JitFlags,
}

impl JitVerdict {
    fn from_reasons(
        reasons: Vec<UnsafeReason>,
        flags: JitFlags,
    ) -> Self {
        Self {
            safe: reasons.is_empty(),
            reasons,
            flags,
        }
    }
}

/// JIT 安全性分析器
///
/// 只读取缓存状态和代码段，不修改任何东西。
pub struct JitSafetyAnalyzer<'a> {
    segment: &'a CodeSegment,
}

impl<'a> JitSafetyAnalyzer<'a> {
    pub fn new(segment: &'a CodeSegment) -> Self {
        Self { segment }
    }

    /// 分析调用点当前快速槽中的目标
    pub fn query(
        &self,
        store: &CacheStore,
        site: SiteIndex,
    ) -> JitVerdict {
        let Some(cache) = store.snapshot(site) else {
            return JitVerdict::from_reasons(
                vec![UnsafeReason::UnknownSite { site: site.0 }],
                JitFlags::NONE,
            );
        };
        match cache.fast_slot().target() {
            Some(target) => self.analyze(&cache, store, target),
            None => {
                let mut reasons = Vec::new();
                if cache.is_megamorphic() {
                    reasons.push(UnsafeReason::Megamorphic);
                }
                reasons.push(UnsafeReason::NoResolution);
                JitVerdict::from_reasons(reasons, JitFlags::NONE)
            }
        }
    }

    /// 分析某个调用点缓存与指定目标
    pub fn analyze(
        &self,
        cache: &InlineCache,
        store: &CacheStore,
        target: &CacheTarget,
    ) -> JitVerdict {
        let mut reasons = Vec::new();
        if cache.is_megamorphic() {
            reasons.push(UnsafeReason::Megamorphic);
        }
        if !cache.contains_target(store, target) {
            reasons.push(UnsafeReason::TargetNotCached);
        }

        let flags = match target {
            CacheTarget::Native(native) => match &native.marshal {
                Some(sig) => JitFlags::for_signature(&sig.params, sig.result) | JitFlags::LEAF,
                None => {
                    reasons.push(UnsafeReason::NativeWithoutMarshal {
                        name: native.name.clone(),
                    });
                    JitFlags::NONE
                }
            },
            CacheTarget::Sub(handle) => self.inspect_sub(*handle, &mut reasons),
            CacheTarget::Attribute(_) => {
                reasons.push(UnsafeReason::NotASubroutine);
                JitFlags::NONE
            }
        };

        JitVerdict::from_reasons(reasons, flags)
    }

    /// 静态检查子程序的入口块
    fn inspect_sub(
        &self,
        handle: SubHandle,
        reasons: &mut Vec<UnsafeReason>,
    ) -> JitFlags {
        let Some(sub) = self.segment.sub(handle) else {
            reasons.push(UnsafeReason::MissingSub { handle: handle.0 });
            return JitFlags::NONE;
        };
        let Some(chunk) = self.segment.chunk(sub.chunk) else {
            reasons.push(UnsafeReason::MissingSub { handle: handle.0 });
            return JitFlags::NONE;
        };

        let mut leaf = true;
        for (offset, instr) in chunk.code.iter().enumerate() {
            let pc = ProgramCounter::new(sub.chunk.0, offset as u32);
            match instr.decode() {
                Ok(op) if op.is_cached() => leaf = false,
                Ok(op) if is_lowerable(op) => {}
                _ => reasons.push(UnsafeReason::UnsupportedOpcode {
                    pc,
                    opcode: instr.opcode,
                }),
            }
        }

        let flags = JitFlags::for_signature(&sub.params, sub.result);
        if leaf {
            flags | JitFlags::LEAF
        } else {
            flags
        }
    }
}

/// 提前编译后端能直接降级的指令
fn is_lowerable(op: Opcode) -> bool {
    op.is_integer_op()
        || op.is_float_op()
        || matches!(
            op,
            Opcode::Noop
                | Opcode::Goto
                | Opcode::GotoIf
                | Opcode::Ret
                | Opcode::ConvertIN
                | Opcode::ConvertNI
                | Opcode::Set
                | Opcode::SetImm
                | Opcode::LoadConst
        )
}
