//! The frame evaluator.
//!
//! Executes one function activation over its basic blocks. Control effects
//! are explicit: a recoverable panic travels as [`Control::Panic`] data and
//! is folded into [`ExecOutcome`] at each call boundary; host faults stay
//! `anyhow` errors and abort the run. Host unwinding is never used for
//! interpreted panics.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::trace;

use crate::ir::{
    BlockId, BuiltinOp, Function, Instr, Op, Operand, Reg, SelectCase,
};
use crate::rt::RtCase;
use crate::typ::{MethodTarget, TypeId};
use crate::val::{
    ChanId, FuncVal, HeapId, PathSeg, SliceVal, StructVal, Value, ValueKey, ops,
};

use super::frame::{DeferEntry, ExecOutcome, Frame, FrameMark, PanicSig, TaskCtx};

/// Interpreted call depth limit; each interpreted call nests host frames,
/// so the host stack must be protected.
const MAX_CALL_DEPTH: usize = 1_000;

pub(crate) enum Control {
    Panic(PanicSig),
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Control {
    fn from(e: anyhow::Error) -> Self {
        Control::Fatal(e)
    }
}

type Ev<T> = std::result::Result<T, Control>;

enum Flow {
    Next,
    Jump(BlockId),
    Return,
}

fn panic_val(ctx: &TaskCtx, value: Value) -> Control {
    Control::Panic(PanicSig { value, stack: ctx.stack.clone() })
}

fn rt_panic(ctx: &TaskCtx, msg: impl Into<String>) -> Control {
    panic_val(ctx, Value::str(msg.into()))
}

/// Fold the two-layer heap result: outer errors are host faults, inner
/// errors are runtime panics.
fn heap_res<T>(ctx: &TaskCtx, r: Result<std::result::Result<T, String>>) -> Ev<T> {
    match r {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(msg)) => Err(rt_panic(ctx, msg)),
        Err(e) => Err(Control::Fatal(e)),
    }
}

fn fold(r: Ev<ExecOutcome>) -> Result<ExecOutcome> {
    match r {
        Ok(o) => Ok(o),
        Err(Control::Panic(p)) => Ok(ExecOutcome::Panic(p)),
        Err(Control::Fatal(e)) => Err(e),
    }
}

/// Call any callable value: IR functions, closures, external primitives,
/// and bound methods.
pub fn call_value(ctx: &mut TaskCtx, callee: &Value, args: Vec<Value>) -> Result<ExecOutcome> {
    fold(call_value_inner(ctx, callee, args))
}

/// Call an IR function directly.
pub fn call_function(
    ctx: &mut TaskCtx,
    func: &Arc<Function>,
    captures: Vec<Value>,
    args: Vec<Value>,
) -> Result<ExecOutcome> {
    fold(call_function_inner(ctx, func, captures, args))
}

fn call_value_inner(ctx: &mut TaskCtx, callee: &Value, args: Vec<Value>) -> Ev<ExecOutcome> {
    match callee {
        Value::Func(f) => match &**f {
            FuncVal::Ir(func) => call_function_inner(ctx, func, Vec::new(), args),
            FuncVal::Closure { func, captures } => {
                call_function_inner(ctx, func, captures.clone(), args)
            }
            FuncVal::Native(name) => {
                let v = ctx
                    .rt
                    .natives
                    .invoke(name, &ctx.rt.heap, &ctx.stack, &args)
                    .map_err(Control::Fatal)?;
                Ok(ExecOutcome::Return(v))
            }
            FuncVal::Bound { recv, method } => call_method(ctx, recv, method, args),
        },
        Value::Iface(Some(i)) => {
            let inner = i.value.clone();
            call_value_inner(ctx, &inner, args)
        }
        Value::Nil | Value::Iface(None) => {
            Err(rt_panic(ctx, "runtime error: call of nil function"))
        }
        other => Err(Control::Fatal(anyhow!(
            "call of non-function value ({})",
            other.type_name()
        ))),
    }
}

fn call_function_inner(
    ctx: &mut TaskCtx,
    func: &Arc<Function>,
    captures: Vec<Value>,
    args: Vec<Value>,
) -> Ev<ExecOutcome> {
    if let Some(fault) = ctx.rt.fault() {
        return Err(Control::Fatal(anyhow::Error::new(fault)));
    }
    if ctx.stack.len() >= MAX_CALL_DEPTH {
        return Err(Control::Fatal(anyhow!("stack overflow")));
    }
    if args.len() != func.params.len() {
        return Err(Control::Fatal(anyhow!(
            "{}: expected {} arguments, got {}",
            func.display_name(),
            func.params.len(),
            args.len()
        )));
    }
    if captures.len() != func.captures.len() {
        return Err(Control::Fatal(anyhow!(
            "{}: expected {} captures, got {}",
            func.display_name(),
            func.captures.len(),
            captures.len()
        )));
    }
    trace!(task = ctx.task_id, func = %func.display_name(), "enter");
    let armed = ctx.arm.take();
    let mut frame = Frame::new(Arc::clone(func), armed);
    for (reg, v) in func.captures.iter().zip(captures) {
        frame.regs[reg.0 as usize] = Some(v);
    }
    for (reg, v) in func.params.iter().zip(args) {
        frame.regs[reg.0 as usize] = Some(v);
    }
    let name: Arc<str> = if func.is_anonymous() {
        Arc::from("<closure>")
    } else {
        func.name.clone()
    };
    ctx.stack.push(FrameMark {
        name,
        file: func.loc.file.clone(),
        line: func.loc.line,
    });
    let res = exec_frame(ctx, &mut frame);
    ctx.stack.pop();
    res
}

fn exec_frame(ctx: &mut TaskCtx, frame: &mut Frame) -> Ev<ExecOutcome> {
    let pending = match run_blocks(ctx, frame) {
        Ok(()) => run_defers(ctx, frame, None)?,
        Err(Control::Panic(p)) => run_defers(ctx, frame, Some(p))?,
        Err(fatal) => return Err(fatal),
    };
    match pending {
        None => Ok(ExecOutcome::Return(frame.packed_results())),
        Some(p) => Ok(ExecOutcome::Panic(p)),
    }
}

/// Pop and run the frame's deferred calls in reverse registration order.
/// While a panic is pending the next deferred callee gets first claim on
/// it through `recover`; a deferred call that itself panics replaces the
/// pending panic.
fn run_defers(
    ctx: &mut TaskCtx,
    frame: &mut Frame,
    mut pending: Option<PanicSig>,
) -> std::result::Result<Option<PanicSig>, Control> {
    while let Some(d) = frame.defers.pop() {
        ctx.arm = pending.as_ref().map(|p| p.value.clone());
        ctx.recovered = false;
        let res = call_value_inner(ctx, &d.callee, d.args);
        ctx.arm = None;
        match res {
            Ok(ExecOutcome::Return(_)) => {
                if ctx.recovered {
                    pending = None;
                }
            }
            Ok(ExecOutcome::Panic(p2)) => pending = Some(p2),
            Err(Control::Panic(p2)) => pending = Some(p2),
            Err(fatal) => return Err(fatal),
        }
        ctx.recovered = false;
    }
    Ok(pending)
}

fn run_blocks(ctx: &mut TaskCtx, frame: &mut Frame) -> Ev<()> {
    let func = Arc::clone(&frame.func);
    let mut block: BlockId = 0;
    let mut prev: Option<BlockId> = None;
    loop {
        let bb = func
            .blocks
            .get(block)
            .ok_or_else(|| Control::Fatal(anyhow!("block {block} out of range")))?;

        // All phis at the head of a block read their inputs before any of
        // them writes, so phi cycles swap correctly.
        let mut idx = 0;
        let mut phi_writes: Vec<(Reg, Value)> = Vec::new();
        while let Some(instr) = bb.instrs.get(idx) {
            let Op::Phi { edges } = &instr.op else { break };
            let pred = prev
                .ok_or_else(|| Control::Fatal(anyhow!("phi in entry block")))?;
            let operand = edges
                .iter()
                .find(|(b, _)| *b == pred)
                .map(|(_, o)| o)
                .ok_or_else(|| {
                    Control::Fatal(anyhow!("phi in block {block} has no edge from {pred}"))
                })?;
            let dest = instr
                .dest
                .ok_or_else(|| Control::Fatal(anyhow!("phi without destination")))?;
            phi_writes.push((dest, eval(frame, operand)?));
            idx += 1;
        }
        for (r, v) in phi_writes {
            frame.regs[r.0 as usize] = Some(v);
        }

        let mut next: Option<BlockId> = None;
        while let Some(instr) = bb.instrs.get(idx) {
            if let Some(mark) = ctx.stack.last_mut() {
                mark.file = instr.loc.file.clone();
                mark.line = instr.loc.line;
            }
            match step(ctx, frame, instr)? {
                Flow::Next => idx += 1,
                Flow::Jump(b) => {
                    next = Some(b);
                    break;
                }
                Flow::Return => return Ok(()),
            }
        }
        match next {
            Some(b) => {
                prev = Some(block);
                block = b;
            }
            None => {
                return Err(Control::Fatal(anyhow!(
                    "block {block} falls off the end without a terminator"
                )));
            }
        }
    }
}

fn eval(frame: &Frame, o: &Operand) -> Ev<Value> {
    match o {
        Operand::Lit(v) => Ok(v.clone()),
        Operand::Reg(r) => frame
            .regs
            .get(r.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| {
                Control::Fatal(anyhow!("register r{} read before assignment", r.0))
            }),
    }
}

fn eval_all(frame: &Frame, os: &[Operand]) -> Ev<Vec<Value>> {
    os.iter().map(|o| eval(frame, o)).collect()
}

fn set(frame: &mut Frame, dest: Option<Reg>, v: Value) {
    if let Some(r) = dest {
        frame.regs[r.0 as usize] = Some(v);
    }
}

fn want_index(v: &Value) -> Ev<i64> {
    v.as_index()
        .ok_or_else(|| Control::Fatal(anyhow!("non-integer index ({})", v.type_name())))
}

fn check_bounds(ctx: &TaskCtx, i: i64, len: usize) -> Ev<usize> {
    if i < 0 || i as usize >= len {
        return Err(rt_panic(
            ctx,
            format!("runtime error: index out of range [{i}] with length {len}"),
        ));
    }
    Ok(i as usize)
}

fn want_chan(v: &Value) -> Ev<Option<ChanId>> {
    match v {
        Value::Chan(id) => Ok(Some(*id)),
        Value::Nil => Ok(None),
        other => Err(Control::Fatal(anyhow!(
            "channel operation on {}",
            other.type_name()
        ))),
    }
}

fn step(ctx: &mut TaskCtx, frame: &mut Frame, instr: &Instr) -> Ev<Flow> {
    match &instr.op {
        Op::BinOp { op, x, y } => {
            let (xv, yv) = (eval(frame, x)?, eval(frame, y)?);
            let v = ops::binop(*op, &xv, &yv).map_err(|msg| rt_panic(ctx, msg))?;
            set(frame, instr.dest, v);
        }
        Op::UnOp { op, x } => {
            let xv = eval(frame, x)?;
            let v = ops::unop(*op, &xv).map_err(|msg| rt_panic(ctx, msg))?;
            set(frame, instr.dest, v);
        }
        Op::Convert { x, to } => {
            let xv = eval(frame, x)?;
            let v = ops::convert(&xv, *to).map_err(|msg| rt_panic(ctx, msg))?;
            set(frame, instr.dest, v);
        }
        Op::Phi { .. } => {
            return Err(Control::Fatal(anyhow!("phi not at block head")));
        }

        Op::Call { callee, args } => {
            let cv = eval(frame, callee)?;
            let argv = eval_all(frame, args)?;
            match call_value_inner(ctx, &cv, argv)? {
                ExecOutcome::Return(v) => set(frame, instr.dest, v),
                ExecOutcome::Panic(p) => return Err(Control::Panic(p)),
            }
        }
        Op::Invoke { iface, method, args } => {
            let recv = eval(frame, iface)?;
            let argv = eval_all(frame, args)?;
            match call_method(ctx, &recv, method, argv)? {
                ExecOutcome::Return(v) => set(frame, instr.dest, v),
                ExecOutcome::Panic(p) => return Err(Control::Panic(p)),
            }
        }
        Op::MakeClosure { func, captures } => {
            let f = Arc::clone(ctx.rt.program.func(*func).map_err(Control::Fatal)?);
            let caps = eval_all(frame, captures)?;
            set(frame, instr.dest, Value::func(FuncVal::Closure { func: f, captures: caps }));
        }
        Op::BindMethod { recv, method } => {
            let rv = eval(frame, recv)?;
            set(
                frame,
                instr.dest,
                Value::func(FuncVal::Bound { recv: rv, method: method.clone() }),
            );
        }

        Op::MakeIface { ty, x } => {
            let v = eval(frame, x)?;
            set(frame, instr.dest, Value::iface(*ty, v));
        }
        Op::ChangeIface { x } => {
            let v = eval(frame, x)?;
            let v = match v {
                Value::Nil => Value::Iface(None),
                other => other,
            };
            set(frame, instr.dest, v);
        }
        Op::TypeAssert { x, ty, comma_ok } => {
            let v = eval(frame, x)?;
            let v = type_assert(ctx, v, *ty, *comma_ok)?;
            set(frame, instr.dest, v);
        }

        Op::Alloc { zero } => {
            let id = ctx.rt.heap.alloc(zero.clone());
            set(frame, instr.dest, Value::Pointer(crate::val::PtrVal::root(id)));
        }
        Op::Load { ptr } => {
            let p = want_ptr(ctx, eval(frame, ptr)?)?;
            let v = heap_res(ctx, ctx.rt.heap.read(p.cell, &p.path))?;
            set(frame, instr.dest, v);
        }
        Op::Store { ptr, value } => {
            let p = want_ptr(ctx, eval(frame, ptr)?)?;
            let v = eval(frame, value)?;
            heap_res(ctx, ctx.rt.heap.write(p.cell, &p.path, v))?;
        }
        Op::FieldAddr { ptr, field } => {
            let p = want_ptr(ctx, eval(frame, ptr)?)?;
            set(frame, instr.dest, Value::Pointer(p.child(PathSeg::Field(*field))));
        }
        Op::Field { x, field } => {
            let v = eval(frame, x)?;
            let v = match v {
                Value::Struct(s) => s
                    .fields
                    .get(*field)
                    .cloned()
                    .ok_or_else(|| Control::Fatal(anyhow!("field {field} out of range")))?,
                other => {
                    return Err(Control::Fatal(anyhow!(
                        "field read on {}",
                        other.type_name()
                    )));
                }
            };
            set(frame, instr.dest, v);
        }
        Op::IndexAddr { x, index } => {
            let base = eval(frame, x)?;
            let i = want_index(&eval(frame, index)?)?;
            let v = index_addr(ctx, base, i)?;
            set(frame, instr.dest, v);
        }
        Op::Index { x, index } => {
            let base = eval(frame, x)?;
            let i = want_index(&eval(frame, index)?)?;
            let v = index_read(ctx, base, i)?;
            set(frame, instr.dest, v);
        }
        Op::SliceOf { x, low, high } => {
            let base = eval(frame, x)?;
            let low = match low {
                Some(o) => Some(want_index(&eval(frame, o)?)?),
                None => None,
            };
            let high = match high {
                Some(o) => Some(want_index(&eval(frame, o)?)?),
                None => None,
            };
            let v = reslice(ctx, base, low, high)?;
            set(frame, instr.dest, v);
        }
        Op::MakeSlice { len, cap, zero } => {
            let len = want_index(&eval(frame, len)?)?;
            let cap = want_index(&eval(frame, cap)?)?;
            if len < 0 || cap < len {
                return Err(rt_panic(ctx, "runtime error: makeslice: invalid arguments"));
            }
            let backing = vec![zero.clone(); cap as usize];
            let cell = ctx.rt.heap.alloc(Value::Array(Arc::new(backing)));
            set(
                frame,
                instr.dest,
                Value::Slice(SliceVal {
                    cell,
                    path: Vec::new(),
                    off: 0,
                    len: len as usize,
                    cap: cap as usize,
                }),
            );
        }
        Op::MakeStruct { ty, fields } => {
            let fields = eval_all(frame, fields)?;
            set(
                frame,
                instr.dest,
                Value::Struct(Arc::new(StructVal { ty: *ty, fields })),
            );
        }
        Op::MakeMap { zero } => {
            let id = ctx.rt.heap.alloc_map(zero.clone());
            set(frame, instr.dest, Value::Map(id));
        }
        Op::Lookup { map, key, comma_ok } => {
            let m = eval(frame, map)?;
            let kv = eval(frame, key)?;
            let (v, found) = map_lookup(ctx, &m, &kv)?;
            let out = if *comma_ok {
                Value::tuple(vec![v, Value::Bool(found)])
            } else {
                v
            };
            set(frame, instr.dest, out);
        }
        Op::MapUpdate { map, key, value } => {
            let m = eval(frame, map)?;
            let kv = eval(frame, key)?;
            let vv = eval(frame, value)?;
            map_update(ctx, &m, kv, vv)?;
        }
        Op::Extract { tuple, index } => {
            let t = eval(frame, tuple)?;
            let v = match t {
                Value::Tuple(vals) => vals
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| Control::Fatal(anyhow!("tuple index {index} out of range")))?,
                other => {
                    return Err(Control::Fatal(anyhow!(
                        "extract from {}",
                        other.type_name()
                    )));
                }
            };
            set(frame, instr.dest, v);
        }

        Op::MakeChan { cap, zero } => {
            let cap = want_index(&eval(frame, cap)?)?;
            if cap < 0 {
                return Err(rt_panic(ctx, "runtime error: makechan: size out of range"));
            }
            let id = ctx.rt.sched().make_chan(cap as usize, zero.clone());
            set(frame, instr.dest, Value::Chan(id));
        }
        Op::Send { chan, value } => {
            let ch = want_chan(&eval(frame, chan)?)?;
            let v = eval(frame, value)?;
            match ch {
                Some(id) => heap_res(ctx, ctx.rt.sched().send(id, v))?,
                None => return Err(Control::Fatal(ctx.rt.sched().block_forever())),
            }
        }
        Op::Recv { chan, comma_ok } => {
            let ch = want_chan(&eval(frame, chan)?)?;
            let (v, ok) = match ch {
                Some(id) => heap_res(ctx, ctx.rt.sched().recv(id))?,
                None => return Err(Control::Fatal(ctx.rt.sched().block_forever())),
            };
            let out = if *comma_ok {
                Value::tuple(vec![v, Value::Bool(ok)])
            } else {
                v
            };
            set(frame, instr.dest, out);
        }
        Op::Select { cases, blocking } => {
            let mut rt_cases = Vec::with_capacity(cases.len());
            for case in cases {
                rt_cases.push(match case {
                    SelectCase::Send { chan, value } => RtCase::Send {
                        chan: want_chan(&eval(frame, chan)?)?,
                        value: eval(frame, value)?,
                    },
                    SelectCase::Recv { chan } => RtCase::Recv {
                        chan: want_chan(&eval(frame, chan)?)?,
                    },
                });
            }
            let outcome = heap_res(ctx, ctx.rt.sched().select(rt_cases, *blocking))?;
            let (v, ok) = outcome.recv.unwrap_or((Value::Nil, false));
            set(
                frame,
                instr.dest,
                Value::tuple(vec![Value::I64(outcome.index as i64), Value::Bool(ok), v]),
            );
        }

        Op::Go { callee, args } => {
            let cv = eval(frame, callee)?;
            let argv = eval_all(frame, args)?;
            ctx.rt.spawn(cv, argv);
        }
        Op::Defer { callee, args } => {
            let cv = eval(frame, callee)?;
            let argv = eval_all(frame, args)?;
            frame.defers.push(DeferEntry { callee: cv, args: argv });
        }
        Op::Panic { x } => {
            let v = eval(frame, x)?;
            return Err(panic_val(ctx, v));
        }
        Op::Recover => {
            let v = match frame.armed.take() {
                Some(v) => {
                    ctx.recovered = true;
                    v
                }
                None => Value::Nil,
            };
            set(frame, instr.dest, v);
        }
        Op::SetResult { index, x } => {
            let v = eval(frame, x)?;
            let slot = frame
                .results
                .get_mut(*index)
                .ok_or_else(|| Control::Fatal(anyhow!("result slot {index} out of range")))?;
            *slot = v;
        }
        Op::Builtin { op, args } => {
            let argv = eval_all(frame, args)?;
            let v = builtin(ctx, *op, argv)?;
            set(frame, instr.dest, v);
        }

        Op::Jump { target } => return Ok(Flow::Jump(*target)),
        Op::Branch { cond, then_b, else_b } => {
            let c = eval(frame, cond)?;
            let b = c.as_bool().ok_or_else(|| {
                Control::Fatal(anyhow!("branch on {}", c.type_name()))
            })?;
            return Ok(Flow::Jump(if b { *then_b } else { *else_b }));
        }
        Op::Return { values } => {
            let vals = eval_all(frame, values)?;
            store_results(frame, vals)?;
            return Ok(Flow::Return);
        }
    }
    Ok(Flow::Next)
}

/// Fill result slots from explicit return values. Functions without
/// declared slots return their values directly; a bare return keeps
/// whatever the slots currently hold.
fn store_results(frame: &mut Frame, vals: Vec<Value>) -> Ev<()> {
    if frame.results.is_empty() {
        frame.results = vals;
        return Ok(());
    }
    if vals.is_empty() {
        return Ok(());
    }
    if vals.len() != frame.results.len() {
        return Err(Control::Fatal(anyhow!(
            "return arity mismatch: {} values for {} results",
            vals.len(),
            frame.results.len()
        )));
    }
    frame.results = vals;
    Ok(())
}

fn want_ptr(ctx: &TaskCtx, v: Value) -> Ev<crate::val::PtrVal> {
    match v {
        Value::Pointer(p) => Ok(p),
        Value::Nil => Err(rt_panic(
            ctx,
            "runtime error: invalid memory address or nil pointer dereference",
        )),
        other => Err(Control::Fatal(anyhow!(
            "pointer operation on {}",
            other.type_name()
        ))),
    }
}

fn index_addr(ctx: &TaskCtx, base: Value, i: i64) -> Ev<Value> {
    match base {
        Value::Slice(s) => {
            let i = check_bounds(ctx, i, s.len)?;
            let mut path = s.path.clone();
            path.push(PathSeg::Index(s.off + i));
            Ok(Value::Pointer(crate::val::PtrVal { cell: s.cell, path }))
        }
        Value::Pointer(p) => {
            let len = array_len(ctx, p.cell, &p.path)?;
            let i = check_bounds(ctx, i, len)?;
            Ok(Value::Pointer(p.child(PathSeg::Index(i))))
        }
        Value::Nil => Err(rt_panic(
            ctx,
            "runtime error: invalid memory address or nil pointer dereference",
        )),
        other => Err(Control::Fatal(anyhow!(
            "index address on {}",
            other.type_name()
        ))),
    }
}

fn index_read(ctx: &TaskCtx, base: Value, i: i64) -> Ev<Value> {
    match base {
        Value::Array(vals) => {
            let i = check_bounds(ctx, i, vals.len())?;
            Ok(vals[i].clone())
        }
        Value::Str(s) => {
            let bytes = s.as_bytes();
            let i = check_bounds(ctx, i, bytes.len())?;
            Ok(Value::U8(bytes[i]))
        }
        Value::Slice(s) => {
            let i = check_bounds(ctx, i, s.len)?;
            let mut path = s.path.clone();
            path.push(PathSeg::Index(s.off + i));
            heap_res(ctx, ctx.rt.heap.read(s.cell, &path))
        }
        Value::Nil => Err(rt_panic(
            ctx,
            "runtime error: index out of range [0] with length 0",
        )),
        other => Err(Control::Fatal(anyhow!("index on {}", other.type_name()))),
    }
}

fn array_len(ctx: &TaskCtx, cell: HeapId, path: &[PathSeg]) -> Ev<usize> {
    heap_res(
        ctx,
        ctx.rt.heap.with(cell, path, |v| match v {
            Value::Array(vals) => Some(vals.len()),
            _ => None,
        }),
    )?
    .ok_or_else(|| Control::Fatal(anyhow!("index address into non-array cell")))
}

fn reslice(ctx: &TaskCtx, base: Value, low: Option<i64>, high: Option<i64>) -> Ev<Value> {
    let bounds = |ctx: &TaskCtx, low: i64, high: i64, max: usize| -> Ev<(usize, usize)> {
        if low < 0 || high < low || high as usize > max {
            return Err(rt_panic(
                ctx,
                format!("runtime error: slice bounds out of range [{low}:{high}]"),
            ));
        }
        Ok((low as usize, high as usize))
    };
    match base {
        Value::Slice(s) => {
            let (lo, hi) = bounds(ctx, low.unwrap_or(0), high.unwrap_or(s.len as i64), s.cap)?;
            Ok(Value::Slice(SliceVal {
                cell: s.cell,
                path: s.path.clone(),
                off: s.off + lo,
                len: hi - lo,
                cap: s.cap - lo,
            }))
        }
        Value::Str(s) => {
            let bytes = s.as_bytes();
            let (lo, hi) = bounds(ctx, low.unwrap_or(0), high.unwrap_or(bytes.len() as i64), bytes.len())?;
            // Byte-indexed, exact on code point boundaries. Strings here
            // are UTF-8, so a cut inside a code point substitutes the
            // replacement character for the severed bytes.
            Ok(match s.get(lo..hi) {
                Some(sub) => Value::str(sub),
                None => Value::str(String::from_utf8_lossy(&bytes[lo..hi])),
            })
        }
        Value::Pointer(p) => {
            let len = array_len(ctx, p.cell, &p.path)?;
            let (lo, hi) = bounds(ctx, low.unwrap_or(0), high.unwrap_or(len as i64), len)?;
            Ok(Value::Slice(SliceVal {
                cell: p.cell,
                path: p.path.clone(),
                off: lo,
                len: hi - lo,
                cap: len - lo,
            }))
        }
        Value::Nil => Err(rt_panic(
            ctx,
            "runtime error: slice bounds out of range on nil",
        )),
        other => Err(Control::Fatal(anyhow!("slice of {}", other.type_name()))),
    }
}

fn map_lookup(ctx: &TaskCtx, m: &Value, key: &Value) -> Ev<(Value, bool)> {
    match m {
        // Reading a nil map yields the miss result.
        Value::Nil => Ok((Value::Nil, false)),
        Value::Map(id) => {
            let k = ValueKey::project(key).map_err(|msg| rt_panic(ctx, msg))?;
            heap_res(
                ctx,
                ctx.rt.heap.with(*id, &[], |cell| match cell {
                    Value::MapStore(data) => match data.get(&k) {
                        Some(v) => Ok((v.clone(), true)),
                        None => Ok((data.zero().clone(), false)),
                    },
                    other => Err(anyhow!("map handle points at {}", other.type_name())),
                }),
            )?
            .map_err(Control::Fatal)
        }
        other => Err(Control::Fatal(anyhow!("lookup on {}", other.type_name()))),
    }
}

fn map_update(ctx: &TaskCtx, m: &Value, key: Value, value: Value) -> Ev<()> {
    match m {
        Value::Nil => Err(rt_panic(ctx, "assignment to entry in nil map")),
        Value::Map(id) => {
            let k = ValueKey::project(&key).map_err(|msg| rt_panic(ctx, msg))?;
            heap_res(
                ctx,
                ctx.rt.heap.with_mut(*id, &[], |cell| match cell {
                    Value::MapStore(data) => {
                        data.insert(k, key, value);
                        Ok(())
                    }
                    other => Err(anyhow!("map handle points at {}", other.type_name())),
                }),
            )?
            .map_err(Control::Fatal)
        }
        other => Err(Control::Fatal(anyhow!("map update on {}", other.type_name()))),
    }
}

fn type_assert(ctx: &TaskCtx, v: Value, target: TypeId, comma_ok: bool) -> Ev<Value> {
    let types = &ctx.rt.program.types;
    let target_is_iface = types.is_iface(target);
    let (result, ok, dyn_name) = match &v {
        // A nil interface satisfies no assertion, interface target or not.
        Value::Iface(None) => {
            let zero = if target_is_iface {
                Value::Iface(None)
            } else {
                types.zero(target).map_err(Control::Fatal)?
            };
            (zero, false, "nil".to_string())
        }
        Value::Iface(Some(i)) => {
            if target_is_iface {
                if types.satisfies(i.ty, target).map_err(Control::Fatal)? {
                    (v.clone(), true, String::new())
                } else {
                    (Value::Iface(None), false, types.name(i.ty).to_string())
                }
            } else if i.ty == target {
                (i.value.clone(), true, String::new())
            } else {
                (
                    types.zero(target).map_err(Control::Fatal)?,
                    false,
                    types.name(i.ty).to_string(),
                )
            }
        }
        other => {
            return Err(Control::Fatal(anyhow!(
                "type assertion on non-interface value ({})",
                other.type_name()
            )));
        }
    };
    if comma_ok {
        return Ok(Value::tuple(vec![result, Value::Bool(ok)]));
    }
    if !ok {
        return Err(rt_panic(
            ctx,
            format!(
                "interface conversion: interface is {}, not {}",
                dyn_name,
                types.name(target)
            ),
        ));
    }
    Ok(result)
}

/// Concrete type a method lookup starts from.
fn dynamic_type(ctx: &TaskCtx, v: &Value) -> Ev<Option<TypeId>> {
    Ok(match v {
        Value::Struct(s) => Some(s.ty),
        Value::Iface(Some(i)) => Some(i.ty),
        Value::Pointer(p) => heap_res(ctx, ctx.rt.heap.with(p.cell, &p.path, |t| match t {
            Value::Struct(s) => Some(s.ty),
            _ => None,
        }))?,
        _ => None,
    })
}

/// Dispatch `method` against the receiver's current dynamic type, walking
/// the promotion path recorded in the method set. A promotion that lands
/// on an interface-typed field re-dispatches through whatever that field
/// holds right now.
fn call_method(
    ctx: &mut TaskCtx,
    recv: &Value,
    method: &str,
    args: Vec<Value>,
) -> Ev<ExecOutcome> {
    let (ty, base) = match recv {
        Value::Iface(None) => {
            return Err(rt_panic(
                ctx,
                format!("runtime error: method call on nil interface ({method})"),
            ));
        }
        Value::Iface(Some(i)) => (i.ty, i.value.clone()),
        other => {
            let ty = dynamic_type(ctx, other)?.ok_or_else(|| {
                Control::Fatal(anyhow!(
                    "value of kind {} has no method set",
                    other.type_name()
                ))
            })?;
            (ty, other.clone())
        }
    };
    let types = &ctx.rt.program.types;
    let entry = types.method(ty, method).ok_or_else(|| {
        Control::Fatal(anyhow!(
            "undefined method {}.{}",
            types.name(ty),
            method
        ))
    })?;

    // Walk embedded fields toward the declaring value. Pointer receivers
    // stay addresses so methods observe and mutate the original.
    let mut cur = base;
    for idx in &entry.path {
        cur = match cur {
            Value::Pointer(p) => Value::Pointer(p.child(PathSeg::Field(*idx))),
            Value::Struct(s) => s
                .fields
                .get(*idx)
                .cloned()
                .ok_or_else(|| Control::Fatal(anyhow!("embedded field {idx} out of range")))?,
            other => {
                return Err(Control::Fatal(anyhow!(
                    "promotion through {}",
                    other.type_name()
                )));
            }
        };
    }

    match entry.target {
        MethodTarget::Func(fid) => {
            let func = Arc::clone(ctx.rt.program.func(fid).map_err(Control::Fatal)?);
            let mut all = Vec::with_capacity(args.len() + 1);
            all.push(cur);
            all.extend(args);
            call_function_inner(ctx, &func, Vec::new(), all)
        }
        MethodTarget::Dynamic => {
            // Read the field's current value; it must be interface-typed.
            let field_val = match cur {
                Value::Pointer(p) => heap_res(ctx, ctx.rt.heap.read(p.cell, &p.path))?,
                other => other,
            };
            call_method(ctx, &field_val, method, args)
        }
    }
}

fn builtin(ctx: &mut TaskCtx, op: BuiltinOp, mut args: Vec<Value>) -> Ev<Value> {
    match op {
        BuiltinOp::Len => {
            let v = args
                .first()
                .ok_or_else(|| Control::Fatal(anyhow!("len: missing argument")))?;
            let n = match v {
                Value::Str(s) => s.len(),
                Value::Slice(s) => s.len,
                Value::Array(vals) => vals.len(),
                Value::Map(id) => heap_res(
                    ctx,
                    ctx.rt.heap.with(*id, &[], |cell| match cell {
                        Value::MapStore(data) => data.len(),
                        _ => 0,
                    }),
                )?,
                Value::Chan(id) => ctx.rt.sched().chan_len(*id).map_err(Control::Fatal)?,
                Value::Nil => 0,
                other => {
                    return Err(Control::Fatal(anyhow!("len of {}", other.type_name())));
                }
            };
            Ok(Value::I64(n as i64))
        }
        BuiltinOp::Cap => {
            let v = args
                .first()
                .ok_or_else(|| Control::Fatal(anyhow!("cap: missing argument")))?;
            let n = match v {
                Value::Slice(s) => s.cap,
                Value::Array(vals) => vals.len(),
                Value::Chan(id) => ctx.rt.sched().chan_cap(*id).map_err(Control::Fatal)?,
                Value::Nil => 0,
                other => {
                    return Err(Control::Fatal(anyhow!("cap of {}", other.type_name())));
                }
            };
            Ok(Value::I64(n as i64))
        }
        BuiltinOp::Append => {
            if args.is_empty() {
                return Err(Control::Fatal(anyhow!("append: missing slice argument")));
            }
            let elems = args.split_off(1);
            let base = args.pop().unwrap_or(Value::Nil);
            append(ctx, base, elems)
        }
        BuiltinOp::Copy => {
            let (dst, src) = match (args.first(), args.get(1)) {
                (Some(d), Some(s)) => (d.clone(), s.clone()),
                _ => return Err(Control::Fatal(anyhow!("copy: expected two arguments"))),
            };
            copy_slice(ctx, dst, src)
        }
        BuiltinOp::Delete => {
            let (m, key) = match (args.first(), args.get(1)) {
                (Some(m), Some(k)) => (m.clone(), k.clone()),
                _ => return Err(Control::Fatal(anyhow!("delete: expected two arguments"))),
            };
            match m {
                // Deleting from a nil map is a no-op.
                Value::Nil => Ok(Value::Nil),
                Value::Map(id) => {
                    let k = ValueKey::project(&key).map_err(|msg| rt_panic(ctx, msg))?;
                    heap_res(
                        ctx,
                        ctx.rt.heap.with_mut(id, &[], |cell| {
                            if let Value::MapStore(data) = cell {
                                data.remove(&k);
                            }
                        }),
                    )?;
                    Ok(Value::Nil)
                }
                other => Err(Control::Fatal(anyhow!("delete on {}", other.type_name()))),
            }
        }
        BuiltinOp::Close => {
            let ch = args
                .first()
                .ok_or_else(|| Control::Fatal(anyhow!("close: missing argument")))?;
            match want_chan(ch)? {
                Some(id) => {
                    heap_res(ctx, ctx.rt.sched().close(id))?;
                    Ok(Value::Nil)
                }
                None => Err(rt_panic(ctx, "close of nil channel")),
            }
        }
        BuiltinOp::Println => {
            let mut line = String::new();
            for (i, v) in args.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                line.push_str(&ctx.rt.heap.render(v).map_err(Control::Fatal)?);
            }
            line.push('\n');
            ctx.rt
                .natives
                .invoke(
                    "syscall.Write",
                    &ctx.rt.heap,
                    &ctx.stack,
                    &[Value::I64(1), Value::str(line)],
                )
                .map_err(Control::Fatal)?;
            Ok(Value::Nil)
        }
    }
}

fn append(ctx: &TaskCtx, base: Value, elems: Vec<Value>) -> Ev<Value> {
    let n = elems.len();
    match base {
        Value::Nil => {
            if n == 0 {
                return Ok(Value::Nil);
            }
            let cell = ctx.rt.heap.alloc(Value::Array(Arc::new(elems)));
            Ok(Value::Slice(SliceVal { cell, path: Vec::new(), off: 0, len: n, cap: n }))
        }
        Value::Slice(s) => {
            if s.len + n <= s.cap {
                // Capacity suffices: write into the existing backing array.
                heap_res(
                    ctx,
                    ctx.rt.heap.with_mut(s.cell, &s.path, |arr| match arr {
                        Value::Array(vals) => {
                            let vals = Arc::make_mut(vals);
                            for (i, e) in elems.into_iter().enumerate() {
                                vals[s.off + s.len + i] = e;
                            }
                            Ok(())
                        }
                        other => Err(anyhow!("append into {}", other.type_name())),
                    }),
                )?
                .map_err(Control::Fatal)?;
                Ok(Value::Slice(SliceVal { len: s.len + n, ..s }))
            } else {
                let mut grown: Vec<Value> = heap_res(
                    ctx,
                    ctx.rt.heap.with(s.cell, &s.path, |arr| match arr {
                        Value::Array(vals) => Ok(vals[s.off..s.off + s.len].to_vec()),
                        other => Err(anyhow!("append from {}", other.type_name())),
                    }),
                )?
                .map_err(Control::Fatal)?;
                grown.extend(elems);
                let cap = grown.len().max(s.cap * 2);
                let len = grown.len();
                grown.resize(cap, Value::Nil);
                let cell = ctx.rt.heap.alloc(Value::Array(Arc::new(grown)));
                Ok(Value::Slice(SliceVal { cell, path: Vec::new(), off: 0, len, cap }))
            }
        }
        other => Err(Control::Fatal(anyhow!("append to {}", other.type_name()))),
    }
}

fn copy_slice(ctx: &TaskCtx, dst: Value, src: Value) -> Ev<Value> {
    let (Value::Slice(d), Value::Slice(s)) = (&dst, &src) else {
        // Copying to or from a nil slice moves nothing.
        if dst.is_nil() || src.is_nil() {
            return Ok(Value::I64(0));
        }
        return Err(Control::Fatal(anyhow!(
            "copy between {} and {}",
            dst.type_name(),
            src.type_name()
        )));
    };
    let n = d.len.min(s.len);
    for i in 0..n {
        let mut sp = s.path.clone();
        sp.push(PathSeg::Index(s.off + i));
        let v = heap_res(ctx, ctx.rt.heap.read(s.cell, &sp))?;
        let mut dp = d.path.clone();
        dp.push(PathSeg::Index(d.off + i));
        heap_res(ctx, ctx.rt.heap.write(d.cell, &dp, v))?;
    }
    Ok(Value::I64(n as i64))
}
