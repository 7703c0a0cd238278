mod exec;
mod frame;

pub use exec::{call_function, call_value};
pub use frame::{ExecOutcome, FrameMark, PanicSig, TaskCtx};

#[cfg(test)]
mod vm_test;
