use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::ir::{
    BinKind, BuiltinOp, Loc, Op, Operand, ProgramBuilder,
};
use crate::native::{NativeCtx, Registry};
use crate::rt::{self, RunResult};
use crate::typ::{FieldDef, TypeDef, TypeId, TypeKind};
use crate::val::{FuncVal, StructVal, Value};

fn run(pb: ProgramBuilder) -> RunResult {
    run_with(pb, Registry::new())
}

fn run_with(pb: ProgramBuilder, natives: Registry) -> RunResult {
    rt::run(pb.build().unwrap(), natives).unwrap()
}

fn returned(res: RunResult) -> Value {
    match res {
        RunResult::Normal(v) => v,
        other => panic!("expected a normal return, got {other:?}"),
    }
}

fn panicked(res: RunResult) -> String {
    match res {
        RunResult::Panicked(report) => report,
        other => panic!("expected a panic, got {other:?}"),
    }
}

#[test]
fn arithmetic_runs_at_operand_width() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let a = fb.emit(Op::BinOp {
        op: BinKind::Add,
        x: Value::I8(127).into(),
        y: Value::I8(1).into(),
    });
    fb.ret(vec![a.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::I8(-128));
}

#[test]
fn loops_merge_values_through_phis() {
    // sum = 0; for i = 0; i < 5; i++ { sum += i }
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let head = fb.new_block();
    let body = fb.new_block();
    let done = fb.new_block();
    fb.jump(head);

    fb.switch_to(body);
    let i_next = fb.reserve();
    let s_next = fb.reserve();

    fb.switch_to(head);
    let i = fb.emit(Op::Phi {
        edges: vec![(0, Value::I64(0).into()), (body, i_next.into())],
    });
    let s = fb.emit(Op::Phi {
        edges: vec![(0, Value::I64(0).into()), (body, s_next.into())],
    });
    let cond = fb.emit(Op::BinOp { op: BinKind::Lt, x: i.into(), y: Value::I64(5).into() });
    fb.branch(cond, body, done);

    fb.switch_to(body);
    fb.emit_to(s_next, Op::BinOp { op: BinKind::Add, x: s.into(), y: i.into() });
    fb.emit_to(i_next, Op::BinOp { op: BinKind::Add, x: i.into(), y: Value::I64(1).into() });
    fb.jump(head);

    fb.switch_to(done);
    fb.ret(vec![s.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::I64(10));
}

#[test]
fn phis_at_a_block_head_read_simultaneously() {
    // Swap two values through a loop edge: (a, b) = (b, a) once.
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let head = fb.new_block();
    let done = fb.new_block();
    fb.jump(head);

    fb.switch_to(head);
    let a = fb.emit(Op::Phi { edges: vec![(0, Value::I64(1).into()), (head, Operand::Reg(crate::ir::Reg(1)))] });
    let b = fb.emit(Op::Phi { edges: vec![(0, Value::I64(2).into()), (head, a.into())] });
    let looped = fb.emit(Op::BinOp { op: BinKind::Eq, x: a.into(), y: Value::I64(2).into() });
    fb.branch(looped, done, head);

    fb.switch_to(done);
    let packed = fb.emit(Op::BinOp { op: BinKind::Mul, x: a.into(), y: Value::I64(10).into() });
    let packed = fb.emit(Op::BinOp { op: BinKind::Add, x: packed.into(), y: b.into() });
    fb.ret(vec![packed.into()]);
    pb.define(main, fb);
    // After one trip around: a = 2, b = 1.
    assert_eq!(returned(run(pb)), Value::I64(21));
}

#[test]
fn calls_pass_arguments_and_pack_multiple_results() {
    let mut pb = ProgramBuilder::new();
    let divmod = pb.declare("divmod");
    let main = pb.declare("main");

    let mut fb = pb.func(divmod, Loc::new("t.x", 10));
    let x = fb.param();
    let y = fb.param();
    let q = fb.emit(Op::BinOp { op: BinKind::Div, x: x.into(), y: y.into() });
    let r = fb.emit(Op::BinOp { op: BinKind::Rem, x: x.into(), y: y.into() });
    fb.ret(vec![q.into(), r.into()]);
    pb.define(divmod, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let f = fb.emit(Op::MakeClosure { func: divmod, captures: vec![] });
    let t = fb.emit(Op::Call { callee: f.into(), args: vec![Value::I64(17).into(), Value::I64(5).into()] });
    let q = fb.emit(Op::Extract { tuple: t.into(), index: 0 });
    let r = fb.emit(Op::Extract { tuple: t.into(), index: 1 });
    let packed = fb.emit(Op::BinOp { op: BinKind::Mul, x: q.into(), y: Value::I64(10).into() });
    let packed = fb.emit(Op::BinOp { op: BinKind::Add, x: packed.into(), y: r.into() });
    fb.ret(vec![packed.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::I64(32));
}

#[test]
fn closures_capture_their_environment() {
    let mut pb = ProgramBuilder::new();
    let adder = pb.declare("");
    let main = pb.declare("main");

    let mut fb = pb.func(adder, Loc::new("t.x", 20));
    let base = fb.capture();
    let n = fb.param();
    let sum = fb.emit(Op::BinOp { op: BinKind::Add, x: base.into(), y: n.into() });
    fb.ret(vec![sum.into()]);
    pb.define(adder, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let cl = fb.emit(Op::MakeClosure { func: adder, captures: vec![Value::I64(10).into()] });
    let v = fb.emit(Op::Call { callee: cl.into(), args: vec![Value::I64(5).into()] });
    fb.ret(vec![v.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::I64(15));
}

#[test]
fn defers_run_in_reverse_order_on_normal_return() {
    // Each deferred call folds its tag into the shared cell, so run order
    // is readable from the final number.
    let mut pb = ProgramBuilder::new();
    let tag = pb.declare("tag");
    let h = pb.declare("h");
    let main = pb.declare("main");

    let mut fb = pb.func(tag, Loc::new("t.x", 30));
    let p = fb.param();
    let t = fb.param();
    let v = fb.emit(Op::Load { ptr: p.into() });
    let v = fb.emit(Op::BinOp { op: BinKind::Mul, x: v.into(), y: Value::I64(10).into() });
    let v = fb.emit(Op::BinOp { op: BinKind::Add, x: v.into(), y: t.into() });
    fb.emit_void(Op::Store { ptr: p.into(), value: v.into() });
    fb.ret(vec![]);
    pb.define(tag, fb);

    let mut fb = pb.func(h, Loc::new("t.x", 40));
    let p = fb.param();
    let f = fb.emit(Op::MakeClosure { func: tag, captures: vec![] });
    fb.emit_void(Op::Defer { callee: f.into(), args: vec![p.into(), Value::I64(1).into()] });
    fb.emit_void(Op::Defer { callee: f.into(), args: vec![p.into(), Value::I64(2).into()] });
    fb.ret(vec![]);
    pb.define(h, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let cell = fb.emit(Op::Alloc { zero: Value::I64(0) });
    let hf = fb.emit(Op::MakeClosure { func: h, captures: vec![] });
    fb.emit(Op::Call { callee: hf.into(), args: vec![cell.into()] });
    let out = fb.emit(Op::Load { ptr: cell.into() });
    fb.ret(vec![out.into()]);
    pb.define(main, fb);
    // Registered 1 then 2; ran 2 then 1.
    assert_eq!(returned(run(pb)), Value::I64(21));
}

#[test]
fn recover_keeps_the_named_result_written_before_the_panic() {
    let mut pb = ProgramBuilder::new();
    let rescue = pb.declare("");
    let g = pb.declare("g");
    let main = pb.declare("main");

    let mut fb = pb.func(rescue, Loc::new("t.x", 50));
    fb.emit(Op::Recover);
    fb.ret(vec![]);
    pb.define(rescue, fb);

    let mut fb = pb.func(g, Loc::new("t.x", 60));
    fb.result("n", Value::I64(0));
    let r = fb.emit(Op::MakeClosure { func: rescue, captures: vec![] });
    fb.emit_void(Op::Defer { callee: r.into(), args: vec![] });
    fb.emit_void(Op::SetResult { index: 0, x: Value::I64(42).into() });
    fb.emit_void(Op::Panic { x: Value::Nil.into() });
    pb.define(g, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let gf = fb.emit(Op::MakeClosure { func: g, captures: vec![] });
    let v = fb.emit(Op::Call { callee: gf.into(), args: vec![] });
    fb.ret(vec![v.into()]);
    pb.define(main, fb);
    // panic(nil) is still a live panic; recover consumes it and the
    // function completes with its named result intact.
    assert_eq!(returned(run(pb)), Value::I64(42));
}

#[test]
fn recover_outside_a_panic_yields_nil() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let v = fb.emit(Op::Recover);
    fb.ret(vec![v.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::Nil);
}

#[test]
fn a_panicking_defer_turns_a_normal_return_into_a_panic() {
    let mut pb = ProgramBuilder::new();
    let boom = pb.declare("");
    let f = pb.declare("f");
    let main = pb.declare("main");

    let mut fb = pb.func(boom, Loc::new("t.x", 70));
    fb.emit_void(Op::Panic { x: Value::str("late failure").into() });
    pb.define(boom, fb);

    let mut fb = pb.func(f, Loc::new("t.x", 80));
    let b = fb.emit(Op::MakeClosure { func: boom, captures: vec![] });
    fb.emit_void(Op::Defer { callee: b.into(), args: vec![] });
    fb.ret(vec![Value::I64(1).into()]);
    pb.define(f, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let ff = fb.emit(Op::MakeClosure { func: f, captures: vec![] });
    fb.emit(Op::Call { callee: ff.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("panic: late failure"), "{report}");
}

#[test]
fn panic_reports_carry_the_frame_stack_with_call_sites() {
    let mut pb = ProgramBuilder::new();
    let g = pb.declare("g");
    let f = pb.declare("f");
    let main = pb.declare("main");

    let mut fb = pb.func(g, Loc::new("t.x", 90));
    fb.at_line(91);
    fb.emit_void(Op::Panic { x: Value::str("boom").into() });
    pb.define(g, fb);

    let mut fb = pb.func(f, Loc::new("t.x", 95));
    let gf = fb.emit(Op::MakeClosure { func: g, captures: vec![] });
    fb.at_line(96);
    fb.emit(Op::Call { callee: gf.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(f, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let ff = fb.emit(Op::MakeClosure { func: f, captures: vec![] });
    fb.at_line(2);
    fb.emit(Op::Call { callee: ff.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(main, fb);

    let report = panicked(run(pb));
    assert!(report.contains("panic: boom"), "{report}");
    assert!(report.contains("g (t.x:91)"), "{report}");
    assert!(report.contains("f (t.x:96)"), "{report}");
    assert!(report.contains("main (t.x:2)"), "{report}");
    // Innermost frame first.
    let g_at = report.find("g (t.x:91)").unwrap();
    let main_at = report.find("main (t.x:2)").unwrap();
    assert!(g_at < main_at);
}

#[test]
fn runtime_errors_are_recoverable_panics() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    fb.emit(Op::BinOp { op: BinKind::Div, x: Value::I64(1).into(), y: Value::I64(0).into() });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("integer divide by zero"), "{report}");
}

#[test]
fn calling_a_nil_function_panics() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    fb.emit(Op::Call { callee: Value::Nil.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("call of nil function"), "{report}");
}

#[test]
fn unregistered_primitives_abort_the_run() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let callee = Value::func(FuncVal::Native(Arc::from("bogus.Frobnicate")));
    fb.emit(Op::Call { callee: callee.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(main, fb);

    let err = rt::run(pb.build().unwrap(), Registry::new()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("external primitive not registered"), "{msg}");
    assert!(msg.contains("bogus.Frobnicate"), "{msg}");
}

#[test]
fn deep_recursion_is_a_fatal_fault_not_a_crash() {
    let mut pb = ProgramBuilder::new();
    let f = pb.declare("f");
    let mut fb = pb.func(f, Loc::new("t.x", 1));
    let this = fb.emit(Op::MakeClosure { func: f, captures: vec![] });
    fb.emit(Op::Call { callee: this.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(f, fb);
    pb.set_entry(f);
    let err = rt::run(pb.build().unwrap(), Registry::new()).unwrap_err();
    assert!(err.to_string().contains("stack overflow"));
}

// ---- interfaces and dispatch ----

struct Zoo {
    pb: ProgramBuilder,
    speaker: TypeId,
    walker: TypeId,
    dog: TypeId,
    cat: TypeId,
}

/// Interface fixtures: Speaker{Speak}, Walker{Speak,Walk}, Dog
/// implementing Speak, Cat implementing Speak and Walk.
fn zoo() -> Zoo {
    let mut pb = ProgramBuilder::new();
    let dog_speak = pb.declare("Dog.Speak");
    let cat_speak = pb.declare("Cat.Speak");
    let cat_walk = pb.declare("Cat.Walk");

    for (id, reply) in [(dog_speak, "woof"), (cat_speak, "meow"), (cat_walk, "pad")] {
        let mut fb = pb.func(id, Loc::new("zoo.x", 1));
        fb.param();
        fb.ret(vec![Value::str(reply).into()]);
        pb.define(id, fb);
    }

    let speaker = pb.types().register(TypeDef {
        name: Arc::from("Speaker"),
        kind: TypeKind::Iface { methods: vec![Arc::from("Speak")] },
        methods: vec![],
        zero: Value::Iface(None),
    });
    let walker = pb.types().register(TypeDef {
        name: Arc::from("Walker"),
        kind: TypeKind::Iface { methods: vec![Arc::from("Speak"), Arc::from("Walk")] },
        methods: vec![],
        zero: Value::Iface(None),
    });
    let dog = pb.types().register(TypeDef {
        name: Arc::from("Dog"),
        kind: TypeKind::Struct { fields: vec![] },
        methods: vec![(Arc::from("Speak"), dog_speak)],
        zero: Value::Struct(Arc::new(StructVal { ty: TypeId(2), fields: vec![] })),
    });
    let cat = pb.types().register(TypeDef {
        name: Arc::from("Cat"),
        kind: TypeKind::Struct { fields: vec![] },
        methods: vec![(Arc::from("Speak"), cat_speak), (Arc::from("Walk"), cat_walk)],
        zero: Value::Struct(Arc::new(StructVal { ty: TypeId(3), fields: vec![] })),
    });
    Zoo { pb, speaker, walker, dog, cat }
}

#[test]
fn invoke_dispatches_on_the_dynamic_type() {
    let Zoo { mut pb, dog, .. } = zoo();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let d = fb.emit(Op::MakeStruct { ty: dog, fields: vec![] });
    let boxed = fb.emit(Op::MakeIface { ty: dog, x: d.into() });
    let v = fb.emit(Op::Invoke { iface: boxed.into(), method: Arc::from("Speak"), args: vec![] });
    fb.ret(vec![v.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::str("woof"));
}

#[test]
fn assertion_to_an_interface_checks_the_method_set() {
    let Zoo { mut pb, speaker, walker, dog, cat } = zoo();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));

    let d = fb.emit(Op::MakeStruct { ty: dog, fields: vec![] });
    let d = fb.emit(Op::MakeIface { ty: dog, x: d.into() });
    let c = fb.emit(Op::MakeStruct { ty: cat, fields: vec![] });
    let c = fb.emit(Op::MakeIface { ty: cat, x: c.into() });

    let t1 = fb.emit(Op::TypeAssert { x: d.into(), ty: speaker, comma_ok: true });
    let ok1 = fb.emit(Op::Extract { tuple: t1.into(), index: 1 });
    let t2 = fb.emit(Op::TypeAssert { x: d.into(), ty: walker, comma_ok: true });
    let ok2 = fb.emit(Op::Extract { tuple: t2.into(), index: 1 });
    let t3 = fb.emit(Op::TypeAssert { x: c.into(), ty: walker, comma_ok: true });
    let ok3 = fb.emit(Op::Extract { tuple: t3.into(), index: 1 });
    fb.ret(vec![ok1.into(), ok2.into(), ok3.into()]);
    pb.define(main, fb);

    let v = returned(run(pb));
    assert_eq!(
        v,
        Value::tuple(vec![Value::Bool(true), Value::Bool(false), Value::Bool(true)])
    );
}

#[test]
fn assertion_to_a_concrete_type_unboxes() {
    let Zoo { mut pb, dog, cat, .. } = zoo();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let d = fb.emit(Op::MakeStruct { ty: dog, fields: vec![] });
    let boxed = fb.emit(Op::MakeIface { ty: dog, x: d.into() });
    let hit = fb.emit(Op::TypeAssert { x: boxed.into(), ty: dog, comma_ok: true });
    let ok_hit = fb.emit(Op::Extract { tuple: hit.into(), index: 1 });
    let miss = fb.emit(Op::TypeAssert { x: boxed.into(), ty: cat, comma_ok: true });
    let ok_miss = fb.emit(Op::Extract { tuple: miss.into(), index: 1 });
    fb.ret(vec![ok_hit.into(), ok_miss.into()]);
    pb.define(main, fb);
    let v = returned(run(pb));
    assert_eq!(v, Value::tuple(vec![Value::Bool(true), Value::Bool(false)]));
}

#[test]
fn nil_interface_fails_every_assertion_but_converts_freely() {
    let Zoo { mut pb, speaker, .. } = zoo();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let t = fb.emit(Op::TypeAssert {
        x: Value::Iface(None).into(),
        ty: speaker,
        comma_ok: true,
    });
    let ok = fb.emit(Op::Extract { tuple: t.into(), index: 1 });
    // Conversion of nil between interface types never fails.
    let conv = fb.emit(Op::ChangeIface { x: Value::Iface(None).into() });
    fb.ret(vec![ok.into(), conv.into()]);
    pb.define(main, fb);
    let v = returned(run(pb));
    assert_eq!(v, Value::tuple(vec![Value::Bool(false), Value::Iface(None)]));
}

#[test]
fn single_result_assertion_failure_panics_with_both_types() {
    let Zoo { mut pb, walker, dog, .. } = zoo();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let d = fb.emit(Op::MakeStruct { ty: dog, fields: vec![] });
    let boxed = fb.emit(Op::MakeIface { ty: dog, x: d.into() });
    fb.emit(Op::TypeAssert { x: boxed.into(), ty: walker, comma_ok: false });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("interface conversion"), "{report}");
    assert!(report.contains("Dog"), "{report}");
    assert!(report.contains("Walker"), "{report}");
}

#[test]
fn promoted_methods_dispatch_through_the_current_field_value() {
    let Zoo { mut pb, speaker, dog, cat, .. } = zoo();
    // Farm embeds a Speaker; its Speak goes through whatever the field
    // holds at each call.
    let farm = pb.types().register(TypeDef {
        name: Arc::from("Farm"),
        kind: TypeKind::Struct { fields: vec![FieldDef::embedded("Speaker", speaker)] },
        methods: vec![],
        zero: Value::Nil,
    });
    let farm_zero = Value::Struct(Arc::new(StructVal { ty: farm, fields: vec![Value::Iface(None)] }));

    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let p = fb.emit(Op::Alloc { zero: farm_zero });
    let fld = fb.emit(Op::FieldAddr { ptr: p.into(), field: 0 });

    let d = fb.emit(Op::MakeStruct { ty: dog, fields: vec![] });
    let d = fb.emit(Op::MakeIface { ty: dog, x: d.into() });
    fb.emit_void(Op::Store { ptr: fld.into(), value: d.into() });

    // A bound method value closes over the receiver, not the resolution.
    let speak = fb.emit(Op::BindMethod { recv: p.into(), method: Arc::from("Speak") });
    let first = fb.emit(Op::Call { callee: speak.into(), args: vec![] });

    let c = fb.emit(Op::MakeStruct { ty: cat, fields: vec![] });
    let c = fb.emit(Op::MakeIface { ty: cat, x: c.into() });
    fb.emit_void(Op::Store { ptr: fld.into(), value: c.into() });
    let second = fb.emit(Op::Call { callee: speak.into(), args: vec![] });

    let joined = fb.emit(Op::BinOp { op: BinKind::Add, x: first.into(), y: second.into() });
    fb.ret(vec![joined.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::str("woofmeow"));
}

#[test]
fn promoted_dispatch_through_a_nil_embedded_interface_panics() {
    let Zoo { mut pb, speaker, .. } = zoo();
    let farm = pb.types().register(TypeDef {
        name: Arc::from("Farm"),
        kind: TypeKind::Struct { fields: vec![FieldDef::embedded("Speaker", speaker)] },
        methods: vec![],
        zero: Value::Nil,
    });
    let farm_zero = Value::Struct(Arc::new(StructVal { ty: farm, fields: vec![Value::Iface(None)] }));

    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let p = fb.emit(Op::Alloc { zero: farm_zero });
    let speak = fb.emit(Op::BindMethod { recv: p.into(), method: Arc::from("Speak") });
    fb.emit(Op::Call { callee: speak.into(), args: vec![] });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("nil interface"), "{report}");
}

// ---- aggregates ----

#[test]
fn pointers_into_structs_alias_the_same_cell() {
    let mut pb = ProgramBuilder::new();
    let pair = pb.types().register(TypeDef {
        name: Arc::from("Pair"),
        kind: TypeKind::Struct { fields: vec![FieldDef::plain("a"), FieldDef::plain("b")] },
        methods: vec![],
        zero: Value::Nil,
    });
    let zero = Value::Struct(Arc::new(StructVal {
        ty: pair,
        fields: vec![Value::I64(0), Value::I64(0)],
    }));
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let p = fb.emit(Op::Alloc { zero });
    let fa = fb.emit(Op::FieldAddr { ptr: p.into(), field: 0 });
    fb.emit_void(Op::Store { ptr: fa.into(), value: Value::I64(7).into() });
    let whole = fb.emit(Op::Load { ptr: p.into() });
    let a = fb.emit(Op::Field { x: whole.into(), field: 0 });
    fb.ret(vec![a.into()]);
    pb.define(main, fb);
    assert_eq!(returned(run(pb)), Value::I64(7));
}

#[test]
fn slices_share_backing_until_append_outgrows_capacity() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let s = fb.emit(Op::MakeSlice {
        len: Value::I64(2).into(),
        cap: Value::I64(4).into(),
        zero: Value::I64(0),
    });
    // In-capacity append writes the shared backing array.
    let grown = fb.emit(Op::Builtin { op: BuiltinOp::Append, args: vec![s.into(), Value::I64(9).into()] });
    let e0 = fb.emit(Op::IndexAddr { x: grown.into(), index: Value::I64(0).into() });
    fb.emit_void(Op::Store { ptr: e0.into(), value: Value::I64(5).into() });
    let seen_via_original = fb.emit(Op::Index { x: s.into(), index: Value::I64(0).into() });

    // Past capacity the backing is copied; the original stops aliasing.
    let big = fb.emit(Op::Builtin {
        op: BuiltinOp::Append,
        args: vec![
            grown.into(),
            Value::I64(1).into(),
            Value::I64(2).into(),
            Value::I64(3).into(),
        ],
    });
    let b0 = fb.emit(Op::IndexAddr { x: big.into(), index: Value::I64(0).into() });
    fb.emit_void(Op::Store { ptr: b0.into(), value: Value::I64(8).into() });
    let still_five = fb.emit(Op::Index { x: s.into(), index: Value::I64(0).into() });

    let len_grown = fb.emit(Op::Builtin { op: BuiltinOp::Len, args: vec![grown.into()] });
    let len_big = fb.emit(Op::Builtin { op: BuiltinOp::Len, args: vec![big.into()] });
    fb.ret(vec![seen_via_original.into(), still_five.into(), len_grown.into(), len_big.into()]);
    pb.define(main, fb);

    let v = returned(run(pb));
    assert_eq!(
        v,
        Value::tuple(vec![Value::I64(5), Value::I64(5), Value::I64(3), Value::I64(6)])
    );
}

#[test]
fn reslicing_keeps_the_backing_array() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let s = fb.emit(Op::MakeSlice {
        len: Value::I64(4).into(),
        cap: Value::I64(4).into(),
        zero: Value::I64(0),
    });
    let e2 = fb.emit(Op::IndexAddr { x: s.into(), index: Value::I64(2).into() });
    fb.emit_void(Op::Store { ptr: e2.into(), value: Value::I64(9).into() });
    let tail = fb.emit(Op::SliceOf {
        x: s.into(),
        low: Some(Value::I64(2).into()),
        high: None,
    });
    let head = fb.emit(Op::Index { x: tail.into(), index: Value::I64(0).into() });
    let len = fb.emit(Op::Builtin { op: BuiltinOp::Len, args: vec![tail.into()] });
    let cap = fb.emit(Op::Builtin { op: BuiltinOp::Cap, args: vec![tail.into()] });
    fb.ret(vec![head.into(), len.into(), cap.into()]);
    pb.define(main, fb);
    let v = returned(run(pb));
    assert_eq!(v, Value::tuple(vec![Value::I64(9), Value::I64(2), Value::I64(2)]));
}

#[test]
fn string_slicing_counts_bytes_not_code_points() {
    // "hé!" is four bytes: h, the two-byte é, and !. A boundary-aligned
    // cut is exact; cutting inside é substitutes the replacement
    // character.
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let exact = fb.emit(Op::SliceOf {
        x: Value::str("hé!").into(),
        low: Some(Value::I64(1).into()),
        high: Some(Value::I64(3).into()),
    });
    let split = fb.emit(Op::SliceOf {
        x: Value::str("hé!").into(),
        low: Some(Value::I64(0).into()),
        high: Some(Value::I64(2).into()),
    });
    fb.ret(vec![exact.into(), split.into()]);
    pb.define(main, fb);
    let v = returned(run(pb));
    assert_eq!(v, Value::tuple(vec![Value::str("é"), Value::str("h\u{fffd}")]));
}

#[test]
fn out_of_range_indexing_panics_with_the_index_and_length() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let s = fb.emit(Op::MakeSlice {
        len: Value::I64(2).into(),
        cap: Value::I64(2).into(),
        zero: Value::I64(0),
    });
    fb.emit(Op::Index { x: s.into(), index: Value::I64(5).into() });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("index out of range [5] with length 2"), "{report}");
}

#[test]
fn maps_store_lookup_and_delete() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let m = fb.emit(Op::MakeMap { zero: Value::I64(0) });
    fb.emit_void(Op::MapUpdate { map: m.into(), key: Value::str("a").into(), value: Value::I64(1).into() });
    fb.emit_void(Op::MapUpdate { map: m.into(), key: Value::str("b").into(), value: Value::I64(2).into() });
    fb.emit_void(Op::MapUpdate { map: m.into(), key: Value::str("a").into(), value: Value::I64(3).into() });

    let hit = fb.emit(Op::Lookup { map: m.into(), key: Value::str("a").into(), comma_ok: true });
    let hit_v = fb.emit(Op::Extract { tuple: hit.into(), index: 0 });
    let miss = fb.emit(Op::Lookup { map: m.into(), key: Value::str("zz").into(), comma_ok: true });
    let miss_v = fb.emit(Op::Extract { tuple: miss.into(), index: 0 });
    let miss_ok = fb.emit(Op::Extract { tuple: miss.into(), index: 1 });

    fb.emit(Op::Builtin { op: BuiltinOp::Delete, args: vec![m.into(), Value::str("b").into()] });
    let len = fb.emit(Op::Builtin { op: BuiltinOp::Len, args: vec![m.into()] });
    fb.ret(vec![hit_v.into(), miss_v.into(), miss_ok.into(), len.into()]);
    pb.define(main, fb);
    let v = returned(run(pb));
    assert_eq!(
        v,
        Value::tuple(vec![Value::I64(3), Value::I64(0), Value::Bool(false), Value::I64(1)])
    );
}

#[test]
fn writing_to_a_nil_map_panics() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    fb.emit_void(Op::MapUpdate {
        map: Value::Nil.into(),
        key: Value::str("k").into(),
        value: Value::I64(1).into(),
    });
    fb.ret(vec![]);
    pb.define(main, fb);
    let report = panicked(run(pb));
    assert!(report.contains("assignment to entry in nil map"), "{report}");
}

// ---- printing and introspection ----

static SINK: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new(String::new()));

fn sink_write(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value> {
    if let Some(Value::Str(s)) = args.get(1) {
        SINK.lock().push_str(s);
    }
    Ok(Value::tuple(vec![Value::I64(0), Value::Nil]))
}

fn stack_render(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value> {
    let line = ctx
        .stack
        .iter()
        .rev()
        .map(|m| format!("{}@{}:{}", m.name, m.file, m.line))
        .collect::<Vec<_>>()
        .join(";");
    Ok(Value::str(line))
}

#[test]
fn print_builtin_routes_through_the_write_primitive() {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare("main");
    let mut fb = pb.func(main, Loc::new("t.x", 1));
    fb.emit(Op::Builtin {
        op: BuiltinOp::Println,
        args: vec![Value::I64(7).into(), Value::str("ok").into(), Value::F64(1.5).into()],
    });
    fb.ret(vec![]);
    pb.define(main, fb);

    let mut reg = Registry::new();
    reg.register("syscall.Write", sink_write);
    SINK.lock().clear();
    returned(run_with(pb, reg));
    assert_eq!(&*SINK.lock(), "7 ok 1.5\n");
}

#[test]
fn frame_introspection_sees_callers_innermost_first() {
    let mut pb = ProgramBuilder::new();
    let anon = pb.declare("");
    let f = pb.declare("f");
    let main = pb.declare("main");

    let mut fb = pb.func(anon, Loc::new("t.x", 20));
    fb.at_line(22);
    let frames = fb.emit(Op::Call {
        callee: Value::func(FuncVal::Native(Arc::from("test.Frames"))).into(),
        args: vec![],
    });
    fb.ret(vec![frames.into()]);
    pb.define(anon, fb);

    let mut fb = pb.func(f, Loc::new("t.x", 10));
    let cl = fb.emit(Op::MakeClosure { func: anon, captures: vec![] });
    fb.at_line(13);
    let v = fb.emit(Op::Call { callee: cl.into(), args: vec![] });
    fb.ret(vec![v.into()]);
    pb.define(f, fb);

    let mut fb = pb.func(main, Loc::new("t.x", 1));
    let ff = fb.emit(Op::MakeClosure { func: f, captures: vec![] });
    fb.at_line(2);
    let v = fb.emit(Op::Call { callee: ff.into(), args: vec![] });
    fb.ret(vec![v.into()]);
    pb.define(main, fb);

    let mut reg = Registry::new();
    reg.register("test.Frames", stack_render);
    let v = returned(run_with(pb, reg));
    assert_eq!(v, Value::str("<closure>@t.x:22;f@t.x:13;main@t.x:2"));
}
