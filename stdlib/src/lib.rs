//! Platform primitive tables.
//!
//! Each platform profile builds a complete [`Registry`] before a run
//! starts. The `posix` profile backs primitives with the host OS; the
//! `minimal` profile supports console output only and answers everything
//! else with a uniform "not yet implemented" fault so missing
//! functionality is loud instead of silently wrong.

use anyhow::{Result, bail};
use ssair_core::native::Registry;

pub mod minimal;
pub mod posix;


/// Build the registry for a named platform profile.
pub fn platform_registry(name: &str) -> Result<Registry> {
    match name {
        "posix" => Ok(posix::registry()),
        "minimal" => Ok(minimal::registry()),
        other => bail!("unknown platform profile: {other}"),
    }
}

/// Every qualified name the platform tables agree to answer, one way or
/// another.
pub(crate) const SURFACE: &[&str] = &[
    "syscall.Write",
    "os.Getenv",
    "os.Args",
    "os.Exit",
    "os.ReadFile",
    "os.WriteFile",
    "runtime.Callers",
    "runtime.Breakpoint",
    "time.Now",
];
