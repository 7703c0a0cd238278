mod chan;
mod runtime;

pub use chan::{RtCase, SelectOutcome};
pub use runtime::*;
