//! 字节码操作码定义
//!
//! 固定类型指令直接作用于寄存器文件；带内联缓存的指令（infix、
//! call_method、get_attr、set_attr）在执行前先查询调用点缓存。
//!
//! 指令编码空间规划：
//! - 0x00-0x0F：控制流
//! - 0x10-0x2F：整数/浮点运算、转换、位运算
//! - 0x30-0x3F：内存与分配
//! - 0x40-0x4F：寄存器赋值
//! - 0x50-0x5F：输出与退出
//! - 0x60-0x6F：带缓存的分派指令

use std::fmt;

use serde::{Deserialize, Serialize};

/// 字节码操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Opcode {
    // =====================
    // 控制流 (0x00-0x0F)
    // =====================
    /// 空操作
    Noop = 0x00,
    /// `goto target`
    Goto = 0x01,
    /// `goto_if target, cond`
    GotoIf = 0x02,
    /// `goto_chunk chunk, offset`
    GotoChunk = 0x03,
    /// `ret src`
    Ret = 0x04,

    // =====================
    // 运算 (0x10-0x2F)
    // =====================
    AddI = 0x10,
    AddN = 0x11,
    SubI = 0x12,
    SubN = 0x13,
    MulI = 0x14,
    MulN = 0x15,
    DivI = 0x16,
    DivN = 0x17,
    ModI = 0x18,
    ModN = 0x19,
    /// int -> num
    ConvertIN = 0x1A,
    /// num -> int (truncating)
    ConvertNI = 0x1B,
    Ashr = 0x20,
    Lshr = 0x21,
    Shl = 0x22,
    And = 0x23,
    Or = 0x24,
    Xor = 0x25,

    // =====================
    // 内存 (0x30-0x3F)
    // =====================
    /// `gc_alloc dst, class, fields`
    GcAlloc = 0x30,
    /// `sys_alloc dst, size_reg`
    SysAlloc = 0x31,
    /// `sys_free mem_reg`
    SysFree = 0x32,
    /// `copy_mem dst_mem, src_mem, len_reg`
    CopyMem = 0x33,
    /// `get_byte dst, mem, offset_reg`
    GetByte = 0x34,
    /// `set_byte mem, offset_reg, src`
    SetByte = 0x35,
    /// `get_word dst, mem, offset_reg`
    GetWord = 0x36,
    /// `set_word mem, offset_reg, src`
    SetWord = 0x37,
    /// `deref dst, mem, index_reg`：按字索引读取
    Deref = 0x38,
    /// `set_ref mem, index_reg, src`：按字索引写入
    SetRef = 0x39,

    // =====================
    // 寄存器赋值 (0x40-0x4F)
    // =====================
    /// `set dst, src`
    Set = 0x40,
    /// `set_imm dst, high, low`
    SetImm = 0x41,
    /// `load_const dst, index`
    LoadConst = 0x42,

    // =====================
    // 输出与退出 (0x50-0x5F)
    // =====================
    PrintS = 0x50,
    PrintI = 0x51,
    PrintN = 0x52,
    /// `exit code_reg`
    Exit = 0x53,

    // =====================
    // 带缓存的分派 (0x60-0x6F)
    // =====================
    /// `infix dst, lhs, rhs, op`
    Infix = 0x60,
    /// `call_method dst, recv, argc, name_const`
    CallMethod = 0x61,
    /// `get_attr dst, obj, name_const`
    GetAttr = 0x62,
    /// `set_attr obj, name_const, src`
    SetAttr = 0x63,
}

impl Opcode {
    /// 获取操作码名称
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Noop => "noop",
            Opcode::Goto => "goto",
            Opcode::GotoIf => "goto_if",
            Opcode::GotoChunk => "goto_chunk",
            Opcode::Ret => "ret",
            Opcode::AddI => "add_i",
            Opcode::AddN => "add_n",
            Opcode::SubI => "sub_i",
            Opcode::SubN => "sub_n",
            Opcode::MulI => "mul_i",
            Opcode::MulN => "mul_n",
            Opcode::DivI => "div_i",
            Opcode::DivN => "div_n",
            Opcode::ModI => "mod_i",
            Opcode::ModN => "mod_n",
            Opcode::ConvertIN => "convert_i_n",
            Opcode::ConvertNI => "convert_n_i",
            Opcode::Ashr => "ashr",
            Opcode::Lshr => "lshr",
            Opcode::Shl => "shl",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::GcAlloc => "gc_alloc",
            Opcode::SysAlloc => "sys_alloc",
            Opcode::SysFree => "sys_free",
            Opcode::CopyMem => "copy_mem",
            Opcode::GetByte => "get_byte",
            Opcode::SetByte => "set_byte",
            Opcode::GetWord => "get_word",
            Opcode::SetWord => "set_word",
            Opcode::Deref => "deref",
            Opcode::SetRef => "set_ref",
            Opcode::Set => "set",
            Opcode::SetImm => "set_imm",
            Opcode::LoadConst => "load_const",
            Opcode::PrintS => "print_s",
            Opcode::PrintI => "print_i",
            Opcode::PrintN => "print_n",
            Opcode::Exit => "exit",
            Opcode::Infix => "infix",
            Opcode::CallMethod => "call_method",
            Opcode::GetAttr => "get_attr",
            Opcode::SetAttr => "set_attr",
        }
    }

    /// 该指令是否携带内联缓存
    pub fn is_cached(&self) -> bool {
        matches!(
            self,
            Opcode::Infix | Opcode::CallMethod | Opcode::GetAttr | Opcode::SetAttr
        )
    }

    /// 该指令是否显式改写程序计数器
    pub fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Opcode::Goto | Opcode::GotoIf | Opcode::GotoChunk | Opcode::Ret | Opcode::Exit
        )
    }

    pub fn is_integer_op(&self) -> bool {
        matches!(
            self,
            Opcode::AddI
                | Opcode::SubI
                | Opcode::MulI
                | Opcode::DivI
                | Opcode::ModI
                | Opcode::Ashr
                | Opcode::Lshr
                | Opcode::Shl
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
        )
    }

    pub fn is_float_op(&self) -> bool {
        matches!(
            self,
            Opcode::AddN | Opcode::SubN | Opcode::MulN | Opcode::DivN | Opcode::ModN
        )
    }

    /// 触及原始内存或分配器的指令
    pub fn is_memory_op(&self) -> bool {
        matches!(
            self,
            Opcode::GcAlloc
                | Opcode::SysAlloc
                | Opcode::SysFree
                | Opcode::CopyMem
                | Opcode::GetByte
                | Opcode::SetByte
                | Opcode::GetWord
                | Opcode::SetWord
                | Opcode::Deref
                | Opcode::SetRef
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

/// 从字节值创建 Opcode，无效值返回原字节
impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::Noop),
            0x01 => Ok(Opcode::Goto),
            0x02 => Ok(Opcode::GotoIf),
            0x03 => Ok(Opcode::GotoChunk),
            0x04 => Ok(Opcode::Ret),
            0x10 => Ok(Opcode::AddI),
            0x11 => Ok(Opcode::AddN),
            0x12 => Ok(Opcode::SubI),
            0x13 => Ok(Opcode::SubN),
            0x14 => Ok(Opcode::MulI),
            0x15 => Ok(Opcode::MulN),
            0x16 => Ok(Opcode::DivI),
            0x17 => Ok(Opcode::DivN),
            0x18 => Ok(Opcode::ModI),
            0x19 => Ok(Opcode::ModN),
            0x1A => Ok(Opcode::ConvertIN),
            0x1B => Ok(Opcode::ConvertNI),
            0x20 => Ok(Opcode::Ashr),
            0x21 => Ok(Opcode::Lshr),
            0x22 => Ok(Opcode::Shl),
            0x23 => Ok(Opcode::And),
            0x24 => Ok(Opcode::Or),
            0x25 => Ok(Opcode::Xor),
            0x30 => Ok(Opcode::GcAlloc),
            0x31 => Ok(Opcode::SysAlloc),
            0x32 => Ok(Opcode::SysFree),
            0x33 => Ok(Opcode::CopyMem),
            0x34 => Ok(Opcode::GetByte),
            0x35 => Ok(Opcode::SetByte),
            0x36 => Ok(Opcode::GetWord),
            0x37 => Ok(Opcode::SetWord),
            0x38 => Ok(Opcode::Deref),
            0x39 => Ok(Opcode::SetRef),
            0x40 => Ok(Opcode::Set),
            0x41 => Ok(Opcode::SetImm),
            0x42 => Ok(Opcode::LoadConst),
            0x50 => Ok(Opcode::PrintS),
            0x51 => Ok(Opcode::PrintI),
            0x52 => Ok(Opcode::PrintN),
            0x53 => Ok(Opcode::Exit),
            0x60 => Ok(Opcode::Infix),
            0x61 => Ok(Opcode::CallMethod),
            0x62 => Ok(Opcode::GetAttr),
            0x63 => Ok(Opcode::SetAttr),
            other => Err(other),
        }
    }
}

/// 多分派二元运算符（`infix` 的第四个操作数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InfixOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Concat = 5,
    Eq = 6,
    Lt = 7,
}

impl InfixOp {
    pub fn name(&self) -> &'static str {
        match self {
            InfixOp::Add => "add",
            InfixOp::Sub => "sub",
            InfixOp::Mul => "mul",
            InfixOp::Div => "div",
            InfixOp::Mod => "mod",
            InfixOp::Concat => "concat",
            InfixOp::Eq => "eq",
            InfixOp::Lt => "lt",
        }
    }
}

impl fmt::Display for InfixOp {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<u32> for InfixOp {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InfixOp::Add),
            1 => Ok(InfixOp::Sub),
            2 => Ok(InfixOp::Mul),
            3 => Ok(InfixOp::Div),
            4 => Ok(InfixOp::Mod),
            5 => Ok(InfixOp::Concat),
            6 => Ok(InfixOp::Eq),
            7 => Ok(InfixOp::Lt),
            other => Err(other),
        }
    }
}
