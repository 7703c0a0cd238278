//! Per-task and per-frame evaluator state.

use std::sync::Arc;

use crate::ir::Function;
use crate::rt::Rt;
use crate::val::Value;

/// One entry of a task's call stack, visible to introspection primitives.
/// `line` tracks the instruction currently executing in that frame, so an
/// outer frame reports the call site of its callee.
#[derive(Debug, Clone)]
pub struct FrameMark {
    pub name: Arc<str>,
    pub file: Arc<str>,
    pub line: u32,
}

impl FrameMark {
    pub fn render(&self) -> String {
        format!("{} ({}:{})", self.name, self.file, self.line)
    }
}

/// An unrecovered panic in flight: the value handed to `panic` plus the
/// task stack captured where it was raised.
#[derive(Debug, Clone)]
pub struct PanicSig {
    pub value: Value,
    pub stack: Vec<FrameMark>,
}

impl PanicSig {
    pub fn report(&self) -> String {
        let mut out = format!("panic: {}\n", self.value);
        for mark in self.stack.iter().rev() {
            out.push('\n');
            out.push_str(&mark.render());
        }
        out
    }
}

/// How a call completed. Panics travel as data, never as host unwinding.
#[derive(Debug)]
pub enum ExecOutcome {
    Return(Value),
    Panic(PanicSig),
}

/// State one task carries across frames.
pub struct TaskCtx {
    pub rt: Arc<Rt>,
    pub task_id: u64,
    pub stack: Vec<FrameMark>,
    /// Panic value offered to the next frame entered while unwinding; a
    /// deferred function's `recover` consumes it.
    pub(crate) arm: Option<Value>,
    /// Set when an armed panic was consumed.
    pub(crate) recovered: bool,
}

impl TaskCtx {
    pub fn new(rt: Arc<Rt>, task_id: u64) -> Self {
        Self {
            rt,
            task_id,
            stack: Vec::new(),
            arm: None,
            recovered: false,
        }
    }
}

/// A deferred call, captured with its arguments already evaluated.
pub(crate) struct DeferEntry {
    pub callee: Value,
    pub args: Vec<Value>,
}

/// One activation record.
pub(crate) struct Frame {
    pub func: Arc<Function>,
    pub regs: Vec<Option<Value>>,
    /// Result slots, pre-filled with zero values on entry.
    pub results: Vec<Value>,
    pub defers: Vec<DeferEntry>,
    /// Panic value this frame may `recover`.
    pub armed: Option<Value>,
}

impl Frame {
    pub fn new(func: Arc<Function>, armed: Option<Value>) -> Self {
        let regs = vec![None; func.reg_count as usize];
        let results = func.results.iter().map(|r| r.zero.clone()).collect();
        Self {
            func,
            regs,
            results,
            defers: Vec::new(),
            armed,
        }
    }

    /// Pack the result slots into a single return value.
    pub fn packed_results(&self) -> Value {
        match self.results.len() {
            0 => Value::Nil,
            1 => self.results[0].clone(),
            _ => Value::tuple(self.results.clone()),
        }
    }
}
