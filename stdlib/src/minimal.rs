//! Console-only profile for hosts without an OS surface.
//!
//! Declares the same names as the posix profile so programs resolve, but
//! everything beyond console output answers with a fatal
//! "not yet implemented" fault.

use ssair_core::native::{Registry, not_implemented};

use crate::SURFACE;

pub fn registry() -> Registry {
    let mut reg = Registry::new();
    for name in SURFACE {
        reg.register(name, not_implemented);
    }
    reg.register("syscall.Write", crate::posix::write);
    reg
}
