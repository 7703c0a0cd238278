//! Task runtime: spawning, the process fault channel, and the top-level
//! run loop that turns an entry function's outcome into an exit status.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use anyhow::{Result, bail};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::ir::Program;
use crate::native::Registry;
use crate::val::{Heap, Value};
use crate::vm::{self, ExecOutcome, TaskCtx};

use super::chan::Sched;

/// Why the whole process stopped early. Recorded once; later faults lose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// An unrecovered panic, in any task.
    Panic,
    /// Every live task was blocked on channel operations.
    Deadlock,
    /// Normal teardown; parked tasks unwind quietly.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ProcessFault {
    pub kind: FaultKind,
    pub report: String,
}

impl fmt::Display for ProcessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report)
    }
}

impl std::error::Error for ProcessFault {}

/// Raised by the `os.Exit` primitive; unwinds to [`run`] as an exit code.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus(pub i32);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

impl std::error::Error for ExitStatus {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Finished,
    Panicked,
}

/// How a run ended. Panics and deadlocks map to exit code 2, matching the
/// dedicated failure code the embedding contract reserves for them.
#[derive(Debug)]
pub enum RunResult {
    /// Entry function returned; carries its return value.
    Normal(Value),
    Exited(i32),
    Panicked(String),
    Deadlock(String),
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunResult::Normal(_) => 0,
            RunResult::Exited(code) => *code,
            RunResult::Panicked(_) | RunResult::Deadlock(_) => 2,
        }
    }
}

/// Shared state of one interpreted process.
pub struct Rt {
    pub program: Program,
    pub heap: Heap,
    pub natives: Registry,
    pub(crate) sched: Sched,
    pub tasks: DashMap<u64, TaskStatus>,
    next_task: AtomicU64,
}

impl Rt {
    pub fn new(program: Program, natives: Registry) -> Self {
        Self {
            program,
            heap: Heap::new(),
            natives,
            sched: Sched::new(),
            tasks: DashMap::new(),
            next_task: AtomicU64::new(1),
        }
    }

    pub(crate) fn sched(&self) -> &Sched {
        &self.sched
    }

    pub(crate) fn record_fault(&self, kind: FaultKind, report: String) {
        self.sched.record_fault(kind, report);
    }

    /// Current process fault, if any. Checked by the evaluator at task
    /// boundaries and by [`run`] before reporting success.
    pub fn fault(&self) -> Option<ProcessFault> {
        self.sched.lock().fault.clone()
    }

    /// Launch `callee(args)` on its own thread as a new task. Task panics
    /// and faults are recorded process-wide rather than returned.
    pub fn spawn(self: &Arc<Self>, callee: Value, args: Vec<Value>) {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        {
            let mut g = self.sched.lock();
            g.live += 1;
        }
        self.tasks.insert(id, TaskStatus::Running);
        let rt = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                let mut ctx = TaskCtx::new(Arc::clone(&rt), id);
                let status = match vm::call_value(&mut ctx, &callee, args) {
                    Ok(ExecOutcome::Return(_)) => TaskStatus::Finished,
                    Ok(ExecOutcome::Panic(sig)) => {
                        rt.record_fault(FaultKind::Panic, sig.report());
                        TaskStatus::Panicked
                    }
                    Err(e) => {
                        match e.downcast_ref::<ProcessFault>() {
                            // Already recorded, or shutdown teardown.
                            Some(_) => {}
                            None => rt.record_fault(FaultKind::Panic, e.to_string()),
                        }
                        TaskStatus::Panicked
                    }
                };
                rt.tasks.insert(id, status);
                let mut g = rt.sched.lock();
                g.live -= 1;
                drop(g);
                rt.sched.notify_all();
                debug!(task = id, ?status, "task finished");
            });
        if let Err(e) = spawned {
            warn!(task = id, error = %e, "failed to spawn task thread");
            let mut g = self.sched.lock();
            g.live -= 1;
        }
    }

    fn shutdown(&self) {
        self.record_fault(FaultKind::Shutdown, "shutdown".to_string());
    }
}

/// Execute `program`'s entry function against `natives` and fold the
/// outcome, any recorded process fault, and fatal errors into a
/// [`RunResult`]. Fatal host faults (such as an unregistered primitive)
/// stay errors.
pub fn run(program: Program, natives: Registry) -> Result<RunResult> {
    let rt = Arc::new(Rt::new(program, natives));
    let entry = Arc::clone(rt.program.entry()?);
    if !entry.params.is_empty() {
        bail!("entry function {} takes parameters", entry.display_name());
    }
    debug!(entry = %entry.display_name(), "starting run");
    let mut ctx = TaskCtx::new(Arc::clone(&rt), 0);
    let outcome = vm::call_function(&mut ctx, &entry, Vec::new(), Vec::new());
    let result = fold_outcome(&rt, outcome)?;
    rt.shutdown();
    Ok(result)
}

fn fold_outcome(rt: &Rt, outcome: Result<ExecOutcome>) -> Result<RunResult> {
    let fault = rt.fault();
    match outcome {
        Ok(ExecOutcome::Panic(sig)) => Ok(RunResult::Panicked(sig.report())),
        Ok(ExecOutcome::Return(v)) => match fault {
            Some(f) if f.kind == FaultKind::Panic => Ok(RunResult::Panicked(f.report)),
            Some(f) if f.kind == FaultKind::Deadlock => Ok(RunResult::Deadlock(f.report)),
            _ => Ok(RunResult::Normal(v)),
        },
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<ExitStatus>() {
                return Ok(RunResult::Exited(exit.0));
            }
            match e.downcast_ref::<ProcessFault>() {
                Some(f) if f.kind == FaultKind::Deadlock => {
                    Ok(RunResult::Deadlock(f.report.clone()))
                }
                Some(f) if f.kind == FaultKind::Panic => {
                    Ok(RunResult::Panicked(f.report.clone()))
                }
                _ => Err(e),
            }
        }
    }
}
