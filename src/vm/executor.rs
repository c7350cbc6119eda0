//! 分派执行器
//!
//! [`DispatchEngine`] 逐条执行代码段中的指令。带内联缓存的指令
//! （infix、call_method、get_attr、set_attr）先查询调用点缓存，未命中时
//! 调用外部解析器并写回缓存；其余指令直接作用于当前帧的寄存器文件。
//!
//! 调试器断点是显式的挂起点：[`DispatchEngine::step`] 返回
//! [`StepOutcome::Break`]，由宿主循环向调试器询问命令后调用
//! [`DispatchEngine::resume`]。

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, CacheStore, CacheTarget, PackedTypes, Signature, TypeTag};
use crate::jit::{JitSafetyAnalyzer, JitVerdict};
use crate::util::config::EngineConfig;
use crate::vm::debugger::{BreakReason, DebugCommand, DebuggerBridge, DebuggerState};
use crate::vm::errors::{VMError, VMResult};
use crate::vm::frames::Frame;
use crate::vm::instructions::Instruction;
use crate::vm::opcode::Opcode;
use crate::vm::resolver::Resolver;
use crate::vm::segment::{CallSite, ChunkId, CodeSegment, ProgramCounter, SiteIndex};
use crate::vm::value::{Heap, MemRef, Value};

/// Shared output sink for the print opcodes
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// VM 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMStatus {
    /// 准备好执行
    Ready,
    /// 正在执行
    Running,
    /// 在断点处挂起，等待调试器命令
    Suspended,
    /// 执行完成
    Finished,
    /// 发生错误或被调试器终止
    Error,
}

/// Result of executing (or declining to execute) one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Suspended before the instruction at `pc`
    Break {
        pc: ProgramCounter,
        reason: BreakReason,
    },
    Exit(i32),
}

/// The interpreter dispatch loop
pub struct DispatchEngine {
    segment: Arc<CodeSegment>,
    store: Arc<CacheStore>,
    resolver: Arc<dyn Resolver>,
    config: EngineConfig,
    frames: Vec<Frame>,
    heap: Heap,
    status: VMStatus,
    bridge: Option<Box<dyn DebuggerBridge>>,
    debug_state: DebuggerState,
    /// Set on resume so the instruction the engine stopped at runs
    skip_break_once: bool,
    stdout: Option<OutputSink>,
    exit_code: Option<i32>,
    resolutions: u64,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("segment", &self.segment.id())
            .field("generation", &self.store.generation())
            .field("status", &self.status)
            .field("depth", &self.frames.len())
            .field("debug_state", &self.debug_state)
            .finish()
    }
}

impl DispatchEngine {
    pub fn new(
        segment: Arc<CodeSegment>,
        store: Arc<CacheStore>,
        resolver: Arc<dyn Resolver>,
        config: EngineConfig,
    ) -> Self {
        if store.segment() != segment.id() {
            warn!(
                "cache store of segment {} attached to segment {}",
                store.segment().0,
                segment.id().0
            );
        }
        Self {
            segment,
            store,
            resolver,
            config,
            frames: Vec::new(),
            heap: Heap::new(),
            status: VMStatus::Ready,
            bridge: None,
            debug_state: DebuggerState::Init,
            skip_break_once: false,
            stdout: None,
            exit_code: None,
            resolutions: 0,
        }
    }

    pub fn attach_debugger(
        &mut self,
        bridge: Box<dyn DebuggerBridge>,
    ) {
        self.bridge = Some(bridge);
    }

    pub fn detach_debugger(&mut self) -> Option<Box<dyn DebuggerBridge>> {
        self.bridge.take()
    }

    /// Redirect print output; stdout otherwise
    pub fn set_stdout(
        &mut self,
        sink: OutputSink,
    ) {
        self.stdout = Some(sink);
    }

    pub fn segment(&self) -> &Arc<CodeSegment> {
        &self.segment
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn status(&self) -> VMStatus {
        self.status
    }

    pub fn debugger_state(&self) -> DebuggerState {
        self.debug_state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Number of times full resolution ran
    pub fn resolutions(&self) -> u64 {
        self.resolutions
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Register of the innermost frame
    pub fn register(
        &self,
        index: u32,
    ) -> Option<&Value> {
        self.frame().and_then(|f| f.register(index))
    }

    pub fn pc(&self) -> Option<ProgramCounter> {
        self.frame().map(|f| f.pc)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// JIT safety of one call site's current resolution
    pub fn jit_query(
        &self,
        site: SiteIndex,
    ) -> JitVerdict {
        JitSafetyAnalyzer::new(&self.segment).query(&self.store, site)
    }

    /// Prepare to run from `entry` with `argv` in registers 0..n
    pub fn start(
        &mut self,
        entry: ProgramCounter,
        argv: &[Value],
    ) -> VMResult<()> {
        if self.segment.chunk(ChunkId(entry.chunk)).is_none() {
            return Err(VMError::PcOutOfRange { pc: entry });
        }
        debug!(
            "dispatch run of segment {} from {} with {} arguments",
            self.segment.id().0,
            entry,
            argv.len()
        );
        self.frames = vec![Frame::with_args(
            None,
            entry,
            self.config.register_count,
            argv,
        )];
        self.heap = Heap::new();
        self.status = VMStatus::Running;
        self.debug_state = DebuggerState::Init;
        self.skip_break_once = false;
        self.exit_code = None;
        Ok(())
    }

    /// Run from `entry` to an exit, driving the attached debugger
    pub fn dispatch_run(
        &mut self,
        entry: ProgramCounter,
        argv: &[Value],
    ) -> VMResult<i32> {
        self.start(entry, argv)?;
        self.run()
    }

    /// Run to completion, answering breaks from the attached bridge
    ///
    /// A failing bridge counts as `continue`.
    pub fn run(&mut self) -> VMResult<i32> {
        loop {
            match self.step()? {
                StepOutcome::Continue => {}
                StepOutcome::Exit(code) => return Ok(code),
                StepOutcome::Break { pc, reason } => {
                    let command = self.ask_bridge(pc, reason);
                    self.resume(command)?;
                }
            }
        }
    }

    /// Step until the engine suspends or exits
    pub fn run_until_break(&mut self) -> VMResult<StepOutcome> {
        loop {
            match self.step()? {
                StepOutcome::Continue => {}
                outcome => return Ok(outcome),
            }
        }
    }

    /// Leave a break
    pub fn resume(
        &mut self,
        command: DebugCommand,
    ) -> VMResult<()> {
        if self.status != VMStatus::Suspended {
            return Err(VMError::InvalidState(format!(
                "resume while {:?}",
                self.status
            )));
        }
        let pc = self.current_pc()?;
        match command {
            DebugCommand::Continue => {
                self.debug_state = DebuggerState::Run;
            }
            DebugCommand::Step => {
                self.debug_state = DebuggerState::Step;
            }
            DebugCommand::Terminate => {
                debug!("terminated by debugger at {}", pc);
                self.status = VMStatus::Error;
                return Err(VMError::Terminated { pc });
            }
        }
        self.status = VMStatus::Running;
        self.skip_break_once = true;
        Ok(())
    }

    /// Execute one instruction, or report a break before it
    pub fn step(&mut self) -> VMResult<StepOutcome> {
        match self.status {
            VMStatus::Running => {}
            VMStatus::Finished => return Ok(StepOutcome::Exit(self.exit_code.unwrap_or(0))),
            VMStatus::Suspended => {
                return Err(VMError::InvalidState(
                    "engine is suspended at a break".to_string(),
                ))
            }
            VMStatus::Ready | VMStatus::Error => {
                return Err(VMError::InvalidState(format!(
                    "step while {:?}",
                    self.status
                )))
            }
        }

        let pc = self.current_pc()?;
        if let Some(reason) = self.check_break(pc) {
            debug!("break at {} ({})", pc, reason);
            self.status = VMStatus::Suspended;
            self.debug_state = DebuggerState::Break;
            return Ok(StepOutcome::Break { pc, reason });
        }

        match self.execute(pc) {
            Ok(None) => Ok(StepOutcome::Continue),
            Ok(Some(code)) => {
                debug!("exit with code {} at {}", code, pc);
                self.status = VMStatus::Finished;
                self.exit_code = Some(code);
                Ok(StepOutcome::Exit(code))
            }
            Err(err) => {
                debug!("fault: {}", err);
                self.status = VMStatus::Error;
                Err(err)
            }
        }
    }

    fn check_break(
        &mut self,
        pc: ProgramCounter,
    ) -> Option<BreakReason> {
        if self.skip_break_once {
            self.skip_break_once = false;
            return None;
        }
        let bridge = self.bridge.as_ref()?;
        match self.debug_state {
            DebuggerState::Init => {
                self.debug_state = DebuggerState::Run;
                if bridge.break_on_start() {
                    return Some(BreakReason::Start);
                }
            }
            DebuggerState::Step => return Some(BreakReason::Step),
            DebuggerState::Run | DebuggerState::Break => {}
        }
        if bridge.has_breakpoints() && bridge.should_break(pc) {
            Some(BreakReason::Breakpoint)
        } else {
            None
        }
    }

    fn ask_bridge(
        &mut self,
        pc: ProgramCounter,
        reason: BreakReason,
    ) -> DebugCommand {
        let (Some(bridge), Some(frame)) = (self.bridge.as_mut(), self.frames.last()) else {
            return DebugCommand::Continue;
        };
        match bridge.on_break(pc, reason, frame) {
            Ok(command) => command,
            Err(err) => {
                warn!("debugger at {}: {}; continuing", pc, err);
                DebugCommand::Continue
            }
        }
    }

    fn current_pc(&self) -> VMResult<ProgramCounter> {
        self.frames
            .last()
            .map(|f| f.pc)
            .ok_or_else(|| VMError::InvalidState("no active frame".to_string()))
    }

    fn frame_mut(&mut self) -> VMResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| VMError::InvalidState("no active frame".to_string()))
    }

    fn jump(
        &mut self,
        target: ProgramCounter,
    ) -> VMResult<()> {
        self.frame_mut()?.pc = target;
        Ok(())
    }

    /// Execute the instruction at `pc`; `Some(code)` on exit
    fn execute(
        &mut self,
        pc: ProgramCounter,
    ) -> VMResult<Option<i32>> {
        let instr = *self
            .segment
            .instruction_at(pc)
            .ok_or(VMError::PcOutOfRange { pc })?;
        let op = instr
            .decode()
            .map_err(|opcode| VMError::InvalidOpcode { pc, opcode })?;
        if self.config.trace_execution {
            trace!("{} {}", pc, instr);
        }

        // jumps, calls and returns overwrite this
        self.frame_mut()?.pc = pc.next();

        let [a, b, c, _] = instr.operands;
        match op {
            Opcode::Noop => {}

            // 控制流
            Opcode::Goto => self.jump(ProgramCounter::new(pc.chunk, a))?,
            Opcode::GotoIf => {
                if self.reg(pc, b)?.is_truthy() {
                    self.jump(ProgramCounter::new(pc.chunk, a))?;
                }
            }
            Opcode::GotoChunk => {
                if self.segment.chunk(ChunkId(a)).is_none() {
                    return Err(VMError::MalformedInstruction {
                        pc,
                        reason: format!("goto_chunk to missing chunk {}", a),
                    });
                }
                self.jump(ProgramCounter::new(a, b))?;
            }
            Opcode::Ret => return self.ret(pc, a),

            // 整数运算
            Opcode::AddI => self.int_op(pc, instr, |x, y| Ok(x.wrapping_add(y)))?,
            Opcode::SubI => self.int_op(pc, instr, |x, y| Ok(x.wrapping_sub(y)))?,
            Opcode::MulI => self.int_op(pc, instr, |x, y| Ok(x.wrapping_mul(y)))?,
            Opcode::DivI => self.int_op(pc, instr, |x, y| {
                if y == 0 {
                    Err(VMError::DivisionByZero { pc })
                } else {
                    Ok(x.wrapping_div(y))
                }
            })?,
            Opcode::ModI => self.int_op(pc, instr, |x, y| {
                if y == 0 {
                    Err(VMError::DivisionByZero { pc })
                } else {
                    Ok(x.wrapping_rem(y))
                }
            })?,
            Opcode::Ashr => self.int_op(pc, instr, |x, y| Ok(x >> (y & 63)))?,
            Opcode::Lshr => self.int_op(pc, instr, |x, y| Ok(((x as u64) >> (y & 63)) as i64))?,
            Opcode::Shl => self.int_op(pc, instr, |x, y| Ok(x.wrapping_shl((y & 63) as u32)))?,
            Opcode::And => self.int_op(pc, instr, |x, y| Ok(x & y))?,
            Opcode::Or => self.int_op(pc, instr, |x, y| Ok(x | y))?,
            Opcode::Xor => self.int_op(pc, instr, |x, y| Ok(x ^ y))?,

            // 浮点运算
            Opcode::AddN => self.num_op(pc, instr, |x, y| x + y)?,
            Opcode::SubN => self.num_op(pc, instr, |x, y| x - y)?,
            Opcode::MulN => self.num_op(pc, instr, |x, y| x * y)?,
            Opcode::DivN => self.num_op(pc, instr, |x, y| x / y)?,
            Opcode::ModN => self.num_op(pc, instr, |x, y| x % y)?,

            Opcode::ConvertIN => {
                let value = self.int(pc, b)?;
                self.set_reg(pc, a, Value::Num(value as f64))?;
            }
            Opcode::ConvertNI => {
                let value = self.num(pc, b)?;
                self.set_reg(pc, a, Value::Int(value as i64))?;
            }

            // 内存
            Opcode::GcAlloc => {
                let fields = c as usize;
                self.check_alloc(pc, fields.saturating_mul(std::mem::size_of::<Value>()))?;
                let obj = Value::try_object(TypeTag(b), fields).ok_or_else(|| {
                    VMError::InvalidMemory {
                        pc,
                        message: format!("cannot allocate object with {} fields", fields),
                    }
                })?;
                self.set_reg(pc, a, obj)?;
            }
            Opcode::SysAlloc => {
                let size = self.size(pc, b)?;
                self.check_alloc(pc, size)?;
                let mem = self.heap.alloc(size).ok_or_else(|| VMError::InvalidMemory {
                    pc,
                    message: format!("cannot allocate block of {} bytes", size),
                })?;
                self.set_reg(pc, a, Value::Mem(mem))?;
            }
            Opcode::SysFree => {
                let mem = self.mem(pc, a)?;
                if !self.heap.free(mem) {
                    return Err(VMError::InvalidMemory {
                        pc,
                        message: format!("free of unknown or freed block #{}", mem.0),
                    });
                }
            }
            Opcode::CopyMem => {
                let (dst, src) = (self.mem(pc, a)?, self.mem(pc, b)?);
                let len = self.size(pc, c)?;
                let bytes = self.bytes(pc, src, 0, len)?.to_vec();
                self.bytes_mut(pc, dst, 0, len)?.copy_from_slice(&bytes);
            }
            Opcode::GetByte => {
                let mem = self.mem(pc, b)?;
                let offset = self.size(pc, c)?;
                let byte = self.bytes(pc, mem, offset, 1)?[0];
                self.set_reg(pc, a, Value::Int(byte as i64))?;
            }
            Opcode::SetByte => {
                let mem = self.mem(pc, a)?;
                let offset = self.size(pc, b)?;
                let byte = self.int(pc, c)? as u8;
                self.bytes_mut(pc, mem, offset, 1)?[0] = byte;
            }
            Opcode::GetWord => {
                let mem = self.mem(pc, b)?;
                let offset = self.size(pc, c)?;
                let word = self.word(pc, mem, offset)?;
                self.set_reg(pc, a, Value::Int(word))?;
            }
            Opcode::SetWord => {
                let mem = self.mem(pc, a)?;
                let offset = self.size(pc, b)?;
                let word = self.int(pc, c)?;
                self.set_word(pc, mem, offset, word)?;
            }
            Opcode::Deref => {
                let mem = self.mem(pc, b)?;
                let offset = self.word_offset(pc, c)?;
                let word = self.word(pc, mem, offset)?;
                self.set_reg(pc, a, Value::Int(word))?;
            }
            Opcode::SetRef => {
                let mem = self.mem(pc, a)?;
                let offset = self.word_offset(pc, b)?;
                let word = self.int(pc, c)?;
                self.set_word(pc, mem, offset, word)?;
            }

            // 寄存器赋值
            Opcode::Set => {
                let value = self.reg(pc, b)?.clone();
                self.set_reg(pc, a, value)?;
            }
            Opcode::SetImm => {
                let value = ((b as u64) << 32 | c as u64) as i64;
                self.set_reg(pc, a, Value::Int(value))?;
            }
            Opcode::LoadConst => {
                let value = self.segment.constant(b).cloned().ok_or_else(|| {
                    VMError::MalformedInstruction {
                        pc,
                        reason: format!("constant {} out of range", b),
                    }
                })?;
                self.set_reg(pc, a, value)?;
            }

            // 输出与退出
            Opcode::PrintS => {
                let text = match self.reg(pc, a)? {
                    Value::Str(s) => s.clone(),
                    other => return Err(self.type_error(pc, a, other, "str")),
                };
                self.print(pc, &text)?;
            }
            Opcode::PrintI => {
                let text = self.int(pc, a)?.to_string();
                self.print(pc, &text)?;
            }
            Opcode::PrintN => {
                let text = self.num(pc, a)?.to_string();
                self.print(pc, &text)?;
            }
            Opcode::Exit => {
                let code = self.int(pc, a)?;
                return self.checked_exit_code(pc, code).map(Some);
            }

            // 带缓存的分派
            Opcode::Infix => self.exec_infix(pc, instr)?,
            Opcode::CallMethod => self.exec_call_method(pc, instr)?,
            Opcode::GetAttr => self.exec_get_attr(pc, instr)?,
            Opcode::SetAttr => self.exec_set_attr(pc, instr)?,
        }
        Ok(None)
    }

    fn ret(
        &mut self,
        pc: ProgramCounter,
        src: u32,
    ) -> VMResult<Option<i32>> {
        let value = self.reg(pc, src)?.clone();
        if self.frames.len() == 1 {
            // top level: the returned int is the exit code
            return self.checked_exit_code(pc, value.as_int().unwrap_or(0)).map(Some);
        }
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VMError::InvalidState("return without a frame".to_string()))?;
        trace!("pop frame at depth {}", self.frames.len() + 1);
        if let Some(dst) = frame.return_dst {
            self.set_reg(pc, dst, value)?;
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // cached dispatch
    // ------------------------------------------------------------------

    fn site(
        &self,
        pc: ProgramCounter,
    ) -> VMResult<CallSite> {
        self.segment
            .site_at(pc)
            .cloned()
            .ok_or_else(|| VMError::MalformedInstruction {
                pc,
                reason: "cached instruction was not classified at load".to_string(),
            })
    }

    /// Run the inline cache protocol for `site`
    fn cached_target(
        &mut self,
        pc: ProgramCounter,
        site: &CallSite,
        key: CacheKey,
        operands: &[Value],
    ) -> VMResult<CacheTarget> {
        let resolver = &self.resolver;
        let resolutions = &mut self.resolutions;
        let key_text = key.to_string();
        self.store
            .dispatch(site.index, key, |key| {
                *resolutions += 1;
                resolver.resolve(key, site, operands)
            })
            .map(|lookup| lookup.into_target())
            .map_err(|failure| VMError::Resolution {
                pc,
                selector: site.kind.selector().to_string(),
                key: key_text,
                failure,
            })
    }

    fn exec_infix(
        &mut self,
        pc: ProgramCounter,
        instr: Instruction,
    ) -> VMResult<()> {
        let [dst, lhs, rhs, _] = instr.operands;
        let site = self.site(pc)?;
        let operands = [self.reg(pc, lhs)?.clone(), self.reg(pc, rhs)?.clone()];
        let (left, right) = (operands[0].type_tag(), operands[1].type_tag());
        let key = match PackedTypes::new(left, right) {
            Some(pair) => CacheKey::Types(pair),
            None => CacheKey::Signature(Signature::new([left, right])),
        };
        let target = self.cached_target(pc, &site, key, &operands)?;
        self.invoke(pc, &site, target, &operands, dst)
    }

    fn exec_call_method(
        &mut self,
        pc: ProgramCounter,
        instr: Instruction,
    ) -> VMResult<()> {
        let [dst, recv, argc, _] = instr.operands;
        let site = self.site(pc)?;
        let operands = (recv..=recv.saturating_add(argc))
            .map(|r| self.reg(pc, r).cloned())
            .collect::<VMResult<SmallVec<[Value; 4]>>>()?;
        let key = CacheKey::Signature(Signature::new(operands.iter().map(Value::type_tag)));
        let target = self.cached_target(pc, &site, key, &operands)?;
        self.invoke(pc, &site, target, &operands, dst)
    }

    fn exec_get_attr(
        &mut self,
        pc: ProgramCounter,
        instr: Instruction,
    ) -> VMResult<()> {
        let [dst, obj, _, _] = instr.operands;
        let site = self.site(pc)?;
        let receiver = self.reg(pc, obj)?.clone();
        let key = CacheKey::Signature(Signature::new([receiver.type_tag()]));
        let target = self.cached_target(pc, &site, key, std::slice::from_ref(&receiver))?;
        match target {
            CacheTarget::Attribute(loc) => {
                let value = self.field(pc, obj, &receiver, loc.offset)?;
                self.set_reg(pc, dst, value)
            }
            // computed attribute
            callable => self.invoke(pc, &site, callable, std::slice::from_ref(&receiver), dst),
        }
    }

    fn exec_set_attr(
        &mut self,
        pc: ProgramCounter,
        instr: Instruction,
    ) -> VMResult<()> {
        let [obj, _, src, _] = instr.operands;
        let site = self.site(pc)?;
        let receiver = self.reg(pc, obj)?.clone();
        let value = self.reg(pc, src)?.clone();
        let key = CacheKey::Signature(Signature::new([receiver.type_tag()]));
        let operands = [receiver, value];
        match self.cached_target(pc, &site, key, &operands)? {
            CacheTarget::Attribute(loc) => {
                let [receiver, value] = operands;
                let object = receiver
                    .as_object()
                    .ok_or_else(|| self.type_error(pc, obj, &receiver, "object"))?;
                if !object.set_field(loc.offset as usize, value) {
                    return Err(VMError::InvalidMemory {
                        pc,
                        message: format!(
                            "attribute offset {} outside {} object",
                            loc.offset,
                            object.class()
                        ),
                    });
                }
                Ok(())
            }
            other => Err(VMError::TypeError {
                pc,
                message: format!("{} resolved to {}, not a storage location", site.kind.selector(), other),
            }),
        }
    }

    fn field(
        &self,
        pc: ProgramCounter,
        reg: u32,
        receiver: &Value,
        offset: u16,
    ) -> VMResult<Value> {
        let object = receiver
            .as_object()
            .ok_or_else(|| self.type_error(pc, reg, receiver, "object"))?;
        object
            .get_field(offset as usize)
            .ok_or_else(|| VMError::InvalidMemory {
                pc,
                message: format!(
                    "attribute offset {} outside {} object",
                    offset,
                    object.class()
                ),
            })
    }

    /// Call a resolved target; natives run in place, subs get a frame
    fn invoke(
        &mut self,
        pc: ProgramCounter,
        site: &CallSite,
        target: CacheTarget,
        args: &[Value],
        dst: u32,
    ) -> VMResult<()> {
        match target {
            CacheTarget::Native(native) => {
                let result = native.call(args).map_err(|message| VMError::NativeFault {
                    pc,
                    name: native.name.clone(),
                    message,
                })?;
                self.set_reg(pc, dst, result)
            }
            CacheTarget::Sub(handle) => {
                let sub = self.segment.sub(handle).ok_or_else(|| {
                    VMError::InvalidState(format!("unknown subroutine #{}", handle.0))
                })?;
                if self.frames.len() >= self.config.max_call_depth {
                    return Err(VMError::CallStackOverflow {
                        pc,
                        depth: self.frames.len(),
                    });
                }
                trace!("push frame for '{}' at depth {}", sub.name, self.frames.len() + 1);
                let mut frame = Frame::with_args(
                    Some(handle),
                    ProgramCounter::new(sub.chunk.0, 0),
                    self.config.register_count,
                    args,
                );
                frame.return_dst = Some(dst);
                self.frames.push(frame);
                Ok(())
            }
            CacheTarget::Attribute(loc) => Err(VMError::TypeError {
                pc,
                message: format!(
                    "{} resolved to attribute offset {} of {}, which is not callable",
                    site.kind.selector(),
                    loc.offset,
                    loc.class
                ),
            }),
        }
    }

    // ------------------------------------------------------------------
    // registers and memory
    // ------------------------------------------------------------------

    fn reg(
        &self,
        pc: ProgramCounter,
        index: u32,
    ) -> VMResult<&Value> {
        self.frames
            .last()
            .and_then(|f| f.register(index))
            .ok_or(VMError::RegisterOutOfRange { pc, index })
    }

    fn set_reg(
        &mut self,
        pc: ProgramCounter,
        index: u32,
        value: Value,
    ) -> VMResult<()> {
        let frame = self.frame_mut()?;
        if frame.registers.set(index as usize, value) {
            Ok(())
        } else {
            Err(VMError::RegisterOutOfRange { pc, index })
        }
    }

    fn type_error(
        &self,
        pc: ProgramCounter,
        index: u32,
        found: &Value,
        expected: &str,
    ) -> VMError {
        VMError::TypeError {
            pc,
            message: format!("r{} holds {}, expected {}", index, found.type_tag(), expected),
        }
    }

    fn int(
        &self,
        pc: ProgramCounter,
        index: u32,
    ) -> VMResult<i64> {
        match self.reg(pc, index)? {
            Value::Int(i) => Ok(*i),
            other => Err(self.type_error(pc, index, other, "int")),
        }
    }

    fn num(
        &self,
        pc: ProgramCounter,
        index: u32,
    ) -> VMResult<f64> {
        match self.reg(pc, index)? {
            Value::Num(n) => Ok(*n),
            other => Err(self.type_error(pc, index, other, "num")),
        }
    }

    fn mem(
        &self,
        pc: ProgramCounter,
        index: u32,
    ) -> VMResult<MemRef> {
        match self.reg(pc, index)? {
            Value::Mem(m) => Ok(*m),
            other => Err(self.type_error(pc, index, other, "mem")),
        }
    }

    /// Non-negative int register used as a size or offset
    fn size(
        &self,
        pc: ProgramCounter,
        index: u32,
    ) -> VMResult<usize> {
        let value = self.int(pc, index)?;
        usize::try_from(value).map_err(|_| VMError::InvalidMemory {
            pc,
            message: format!("negative size or offset {} in r{}", value, index),
        })
    }

    /// Exit codes must fit the host's `i32`
    fn checked_exit_code(
        &self,
        pc: ProgramCounter,
        code: i64,
    ) -> VMResult<i32> {
        i32::try_from(code).map_err(|_| VMError::TypeError {
            pc,
            message: format!("exit code {} does not fit in i32", code),
        })
    }

    fn check_alloc(
        &self,
        pc: ProgramCounter,
        bytes: usize,
    ) -> VMResult<()> {
        if bytes > self.config.max_alloc_bytes {
            return Err(VMError::InvalidMemory {
                pc,
                message: format!(
                    "allocation of {} bytes exceeds the {} byte limit",
                    bytes, self.config.max_alloc_bytes
                ),
            });
        }
        Ok(())
    }

    /// Byte offset of the word at `index`
    fn word_offset(
        &self,
        pc: ProgramCounter,
        index: u32,
    ) -> VMResult<usize> {
        let slot = self.size(pc, index)?;
        slot.checked_mul(8).ok_or_else(|| VMError::InvalidMemory {
            pc,
            message: format!("word index {} out of range", slot),
        })
    }

    fn word(
        &self,
        pc: ProgramCounter,
        mem: MemRef,
        offset: usize,
    ) -> VMResult<i64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.bytes(pc, mem, offset, 8)?);
        Ok(i64::from_le_bytes(word))
    }

    fn set_word(
        &mut self,
        pc: ProgramCounter,
        mem: MemRef,
        offset: usize,
        word: i64,
    ) -> VMResult<()> {
        self.bytes_mut(pc, mem, offset, 8)?
            .copy_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn bytes(
        &self,
        pc: ProgramCounter,
        mem: MemRef,
        offset: usize,
        len: usize,
    ) -> VMResult<&[u8]> {
        let block = self.heap.block(mem).ok_or_else(|| VMError::InvalidMemory {
            pc,
            message: format!("block #{} is not allocated", mem.0),
        })?;
        let size = block.len();
        offset
            .checked_add(len)
            .and_then(|end| block.get(offset..end))
            .ok_or_else(|| VMError::InvalidMemory {
                pc,
                message: format!("{} bytes at {} outside block of {} bytes", len, offset, size),
            })
    }

    fn bytes_mut(
        &mut self,
        pc: ProgramCounter,
        mem: MemRef,
        offset: usize,
        len: usize,
    ) -> VMResult<&mut [u8]> {
        let block = self.heap.block_mut(mem).ok_or_else(|| VMError::InvalidMemory {
            pc,
            message: format!("block #{} is not allocated", mem.0),
        })?;
        let size = block.len();
        offset
            .checked_add(len)
            .and_then(|end| block.get_mut(offset..end))
            .ok_or_else(|| VMError::InvalidMemory {
                pc,
                message: format!("{} bytes at {} outside block of {} bytes", len, offset, size),
            })
    }

    fn int_op<F>(
        &mut self,
        pc: ProgramCounter,
        instr: Instruction,
        op: F,
    ) -> VMResult<()>
    where
        F: FnOnce(i64, i64) -> VMResult<i64>,
    {
        let [dst, lhs, rhs, _] = instr.operands;
        let result = op(self.int(pc, lhs)?, self.int(pc, rhs)?)?;
        self.set_reg(pc, dst, Value::Int(result))
    }

    fn num_op<F>(
        &mut self,
        pc: ProgramCounter,
        instr: Instruction,
        op: F,
    ) -> VMResult<()>
    where
        F: FnOnce(f64, f64) -> f64,
    {
        let [dst, lhs, rhs, _] = instr.operands;
        let result = op(self.num(pc, lhs)?, self.num(pc, rhs)?);
        self.set_reg(pc, dst, Value::Num(result))
    }

    fn print(
        &self,
        pc: ProgramCounter,
        text: &str,
    ) -> VMResult<()> {
        let result = match &self.stdout {
            Some(sink) => sink.lock().write_all(text.as_bytes()),
            None => std::io::stdout().lock().write_all(text.as_bytes()),
        };
        result.map_err(|e| VMError::Output {
            pc,
            message: e.to_string(),
        })
    }
}
