//! POSIX-backed primitives.
//!
//! I/O failures are data: fallible primitives return a `(result, error)`
//! tuple whose error slot is a string or nil, so interpreted code decides
//! what to do with them. Only malformed calls (wrong arity, wrong kinds)
//! are host faults.

use std::io::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use tracing::debug;

use ssair_core::native::{NativeCtx, Registry};
use ssair_core::rt::ExitStatus;
use ssair_core::val::{Heap, SliceVal, Value};

pub fn registry() -> Registry {
    let mut reg = Registry::new();
    reg.register("syscall.Write", write);
    reg.register("os.Getenv", getenv);
    reg.register("os.Args", args);
    reg.register("os.Exit", exit);
    reg.register("os.ReadFile", read_file);
    reg.register("os.WriteFile", write_file);
    reg.register("runtime.Callers", callers);
    reg.register("runtime.Breakpoint", breakpoint);
    reg.register("time.Now", now);
    reg
}

/// `(value, nil)` success shape shared by the fallible primitives.
fn ok_pair(v: Value) -> Value {
    Value::tuple(vec![v, Value::Nil])
}

fn err_pair(v: Value, msg: String) -> Value {
    Value::tuple(vec![v, Value::str(msg)])
}

fn want_str<'a>(ctx: &NativeCtx<'_>, args: &'a [Value], i: usize) -> Result<&'a str> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s),
        other => bail!(
            "{}: argument {} must be a string, got {}",
            ctx.symbol,
            i,
            other.map(|v| v.type_name()).unwrap_or("nothing")
        ),
    }
}

/// Collect a byte payload: a string literal or a byte slice.
fn want_bytes(ctx: &NativeCtx<'_>, args: &[Value], i: usize) -> Result<Vec<u8>> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s.as_bytes().to_vec()),
        Some(Value::Slice(s)) => {
            let mut out = Vec::with_capacity(s.len);
            for k in 0..s.len {
                let mut path = s.path.clone();
                path.push(ssair_core::val::PathSeg::Index(s.off + k));
                match ctx.heap.read(s.cell, &path)? {
                    Ok(Value::U8(b)) => out.push(b),
                    Ok(other) => bail!("{}: byte slice holds {}", ctx.symbol, other.type_name()),
                    Err(msg) => bail!("{}: {msg}", ctx.symbol),
                }
            }
            Ok(out)
        }
        other => bail!(
            "{}: argument {} must be a string or byte slice, got {}",
            ctx.symbol,
            i,
            other.map(|v| v.type_name()).unwrap_or("nothing")
        ),
    }
}

fn alloc_str_slice(heap: &Heap, items: Vec<Value>) -> Value {
    let len = items.len();
    let cell = heap.alloc(Value::Array(Arc::new(items)));
    Value::Slice(SliceVal { cell, path: Vec::new(), off: 0, len, cap: len })
}

/// `syscall.Write(fd, data) -> (written, err)`.
pub(crate) fn write(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value> {
    let fd = match args.first().and_then(|v| v.as_index()) {
        Some(fd) => fd,
        None => bail!("{}: missing file descriptor", ctx.symbol),
    };
    let data = want_bytes(ctx, args, 1)?;
    let res = match fd {
        1 => std::io::stdout().write_all(&data),
        2 => std::io::stderr().write_all(&data),
        _ => {
            return Ok(err_pair(
                Value::I64(0),
                format!("write: bad file descriptor {fd}"),
            ));
        }
    };
    Ok(match res {
        Ok(()) => ok_pair(Value::I64(data.len() as i64)),
        Err(e) => err_pair(Value::I64(0), format!("write: {e}")),
    })
}

fn getenv(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value> {
    let name = want_str(ctx, args, 0)?;
    Ok(Value::str(std::env::var(name).unwrap_or_default()))
}

fn args(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value> {
    let items = std::env::args().map(Value::str).collect();
    Ok(alloc_str_slice(ctx.heap, items))
}

fn exit(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value> {
    let code = args.first().and_then(|v| v.as_index()).unwrap_or(0);
    Err(anyhow::Error::new(ExitStatus(code as i32)))
}

fn read_file(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value> {
    let path = want_str(ctx, args, 0)?;
    Ok(match std::fs::read_to_string(path) {
        Ok(content) => ok_pair(Value::str(content)),
        Err(e) => err_pair(Value::str(""), format!("open {path}: {e}")),
    })
}

fn write_file(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value> {
    let path = want_str(ctx, args, 0)?.to_string();
    let data = want_bytes(ctx, args, 1)?;
    Ok(match std::fs::write(&path, data) {
        Ok(()) => Value::Nil,
        Err(e) => Value::str(format!("write {path}: {e}")),
    })
}

/// `runtime.Callers() -> [](name, location)`, innermost frame first.
fn callers(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value> {
    let items = ctx
        .stack
        .iter()
        .rev()
        .map(|mark| {
            Value::tuple(vec![
                Value::Str(mark.name.clone()),
                Value::str(format!("{}:{}", mark.file, mark.line)),
            ])
        })
        .collect();
    Ok(alloc_str_slice(ctx.heap, items))
}

fn breakpoint(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value> {
    debug!(stack = ?ctx.stack, "breakpoint");
    Ok(Value::Nil)
}

fn now(_ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(Value::I64(nanos))
}
