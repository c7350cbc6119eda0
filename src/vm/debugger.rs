//! Debugger bridge
//!
//! The dispatch engine checks [`DebuggerBridge::should_break`] before every
//! instruction while breakpoints are registered. A break suspends the engine:
//! [`DispatchEngine::step`](crate::vm::executor::DispatchEngine::step) returns
//! to the host loop, which asks the bridge for a command and resumes.

use std::collections::HashSet;
use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::vm::errors::BridgeError;
use crate::vm::frames::Frame;
use crate::vm::segment::ProgramCounter;

/// Command returned by the bridge at a break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    Continue,
    /// Break again after exactly one more instruction
    Step,
    Terminate,
}

impl FromStr for DebugCommand {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "c" | "continue" => Ok(DebugCommand::Continue),
            "s" | "step" => Ok(DebugCommand::Step),
            "q" | "terminate" => Ok(DebugCommand::Terminate),
            other => Err(BridgeError::MalformedCommand(other.to_string())),
        }
    }
}

/// Why the engine stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// Before the first instruction
    Start,
    Breakpoint,
    Step,
}

impl fmt::Display for BreakReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            BreakReason::Start => write!(f, "start"),
            BreakReason::Breakpoint => write!(f, "breakpoint"),
            BreakReason::Step => write!(f, "step"),
        }
    }
}

/// Engine-side debugger state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebuggerState {
    /// Nothing executed yet
    #[default]
    Init,
    Run,
    /// One instruction left before the next break
    Step,
    /// Suspended, waiting for a command
    Break,
}

/// Control-flow contract between the dispatch engine and a debugger
pub trait DebuggerBridge: Send {
    /// Whether a breakpoint is registered at `pc`
    fn should_break(
        &self,
        pc: ProgramCounter,
    ) -> bool;

    /// Lets the engine skip `should_break` when nothing is registered
    fn has_breakpoints(&self) -> bool {
        true
    }

    /// Break before the first instruction
    fn break_on_start(&self) -> bool {
        false
    }

    /// Called while the engine is suspended
    fn on_break(
        &mut self,
        pc: ProgramCounter,
        reason: BreakReason,
        frame: &Frame,
    ) -> Result<DebugCommand, BridgeError>;
}

/// One recorded break
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakEvent {
    pub pc: ProgramCounter,
    pub reason: BreakReason,
}

/// Bridge that replays a fixed command script and records every break
///
/// Once the script runs out it answers `continue`.
#[derive(Debug, Default)]
pub struct ScriptedDebugger {
    breakpoints: HashSet<ProgramCounter>,
    script: Vec<DebugCommand>,
    next: usize,
    break_on_start: bool,
    hits: Arc<Mutex<Vec<BreakEvent>>>,
}

impl ScriptedDebugger {
    pub fn new(breakpoints: impl IntoIterator<Item = ProgramCounter>) -> Self {
        Self {
            breakpoints: breakpoints.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_script(
        mut self,
        script: impl IntoIterator<Item = DebugCommand>,
    ) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    pub fn stop_at_start(mut self) -> Self {
        self.break_on_start = true;
        self
    }

    pub fn set_breakpoint(
        &mut self,
        pc: ProgramCounter,
    ) {
        self.breakpoints.insert(pc);
    }

    pub fn remove_breakpoint(
        &mut self,
        pc: ProgramCounter,
    ) {
        self.breakpoints.remove(&pc);
    }

    /// Shared log of breaks, readable after the bridge moved into an engine
    pub fn hits(&self) -> Arc<Mutex<Vec<BreakEvent>>> {
        self.hits.clone()
    }
}

impl DebuggerBridge for ScriptedDebugger {
    fn should_break(
        &self,
        pc: ProgramCounter,
    ) -> bool {
        self.breakpoints.contains(&pc)
    }

    fn has_breakpoints(&self) -> bool {
        !self.breakpoints.is_empty()
    }

    fn break_on_start(&self) -> bool {
        self.break_on_start
    }

    fn on_break(
        &mut self,
        pc: ProgramCounter,
        reason: BreakReason,
        _frame: &Frame,
    ) -> Result<DebugCommand, BridgeError> {
        self.hits.lock().push(BreakEvent { pc, reason });
        let command = self
            .script
            .get(self.next)
            .copied()
            .unwrap_or(DebugCommand::Continue);
        self.next += 1;
        Ok(command)
    }
}

/// Attach a debugger that stops at `breakpoints` and continues from each
pub fn debugger_attach(
    breakpoints: impl IntoIterator<Item = ProgramCounter>
) -> Box<dyn DebuggerBridge> {
    Box::new(ScriptedDebugger::new(breakpoints))
}

/// Line-oriented bridge for the command line
///
/// Prints the location and the non-null registers, then reads one command
/// per break.
pub struct LineDebugger<R, W> {
    breakpoints: HashSet<ProgramCounter>,
    break_on_start: bool,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LineDebugger<R, W> {
    pub fn new(
        breakpoints: impl IntoIterator<Item = ProgramCounter>,
        break_on_start: bool,
        input: R,
        output: W,
    ) -> Self {
        Self {
            breakpoints: breakpoints.into_iter().collect(),
            break_on_start,
            input,
            output,
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> DebuggerBridge for LineDebugger<R, W> {
    fn should_break(
        &self,
        pc: ProgramCounter,
    ) -> bool {
        self.breakpoints.contains(&pc)
    }

    fn has_breakpoints(&self) -> bool {
        !self.breakpoints.is_empty()
    }

    fn break_on_start(&self) -> bool {
        self.break_on_start
    }

    fn on_break(
        &mut self,
        pc: ProgramCounter,
        reason: BreakReason,
        frame: &Frame,
    ) -> Result<DebugCommand, BridgeError> {
        let io = |e: std::io::Error| BridgeError::Io(e.to_string());
        writeln!(self.output, "[{}] at {}", reason, pc).map_err(io)?;
        for (i, value) in frame.registers.as_slice().iter().enumerate() {
            if !matches!(value, crate::vm::value::Value::Null) {
                writeln!(self.output, "  r{} = {}", i, value).map_err(io)?;
            }
        }
        write!(self.output, "(c/s/q) > ").map_err(io)?;
        self.output.flush().map_err(io)?;

        let mut line = String::new();
        if self.input.read_line(&mut line).map_err(io)? == 0 {
            return Err(BridgeError::InputClosed);
        }
        line.parse()
    }
}
