//! External primitive registry.
//!
//! Primitives are host functions keyed by qualified name. A platform
//! profile populates one registry before execution starts; the registry is
//! read-only afterwards, so task threads share it without locking.
//! Referencing a name the registry does not know is a fatal fault, not a
//! recoverable panic.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::util::fast_map::FastHashMap;
use crate::val::{Heap, Value};
use crate::vm::FrameMark;


/// Context handed to a primitive: its own symbol name, the heap for
/// building aggregate results, and the calling task's frame stack for
/// introspection primitives.
pub struct NativeCtx<'a> {
    pub symbol: &'a str,
    pub heap: &'a Heap,
    pub stack: &'a [FrameMark],
}

pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value>;

#[derive(Default, Clone)]
pub struct Registry {
    entries: FastHashMap<Arc<str>, NativeFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, f: NativeFn) {
        self.entries.insert(Arc::from(name), f);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| &**k)
    }

    pub fn invoke(
        &self,
        name: &str,
        heap: &Heap,
        stack: &[FrameMark],
        args: &[Value],
    ) -> Result<Value> {
        let Some(f) = self.entries.get(name) else {
            bail!("external primitive not registered: {name}");
        };
        let mut ctx = NativeCtx { symbol: name, heap, stack };
        f(&mut ctx, args)
    }
}

/// Shared stub body for primitives a platform declares but does not
/// support. Registered under many names; reads its own from the context.
pub fn not_implemented(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value> {
    bail!("external primitive not yet implemented: {}", ctx.symbol)
}
