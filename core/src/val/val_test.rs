use std::sync::Arc;

use crate::ir::{BinKind, NumKind, UnKind};
use crate::typ::TypeId;

use super::*;

#[test]
fn int_arithmetic_wraps_at_width() {
    let v = ops::binop(BinKind::Add, &Value::I8(127), &Value::I8(1)).unwrap();
    assert_eq!(v, Value::I8(-128));
    let v = ops::binop(BinKind::Add, &Value::U8(255), &Value::U8(1)).unwrap();
    assert_eq!(v, Value::U8(0));
    let v = ops::binop(BinKind::Mul, &Value::I64(i64::MAX), &Value::I64(2)).unwrap();
    assert_eq!(v, Value::I64(-2));
    let v = ops::binop(BinKind::Sub, &Value::U16(0), &Value::U16(1)).unwrap();
    assert_eq!(v, Value::U16(u16::MAX));
}

#[test]
fn divide_by_zero_is_a_runtime_panic() {
    let err = ops::binop(BinKind::Div, &Value::I32(1), &Value::I32(0)).unwrap_err();
    assert!(err.contains("integer divide by zero"));
    let err = ops::binop(BinKind::Rem, &Value::U64(1), &Value::U64(0)).unwrap_err();
    assert!(err.contains("integer divide by zero"));
}

#[test]
fn oversized_shifts_are_defined() {
    let v = ops::binop(BinKind::Shl, &Value::U8(1), &Value::U8(200)).unwrap();
    assert_eq!(v, Value::U8(0));
    let v = ops::binop(BinKind::Shr, &Value::I8(-1), &Value::I8(100)).unwrap();
    assert_eq!(v, Value::I8(-1));
    let err = ops::binop(BinKind::Shl, &Value::I64(1), &Value::I64(-1)).unwrap_err();
    assert!(err.contains("negative shift amount"));
}

#[test]
fn mismatched_kinds_do_not_coerce() {
    assert!(ops::binop(BinKind::Add, &Value::I8(1), &Value::I16(1)).is_err());
    assert!(ops::binop(BinKind::Add, &Value::I64(1), &Value::F64(1.0)).is_err());
}

#[test]
fn conversions_truncate() {
    assert_eq!(ops::convert(&Value::I64(300), NumKind::U8).unwrap(), Value::U8(44));
    assert_eq!(ops::convert(&Value::F64(3.9), NumKind::I64).unwrap(), Value::I64(3));
    assert_eq!(ops::convert(&Value::I32(-1), NumKind::U16).unwrap(), Value::U16(u16::MAX));
    assert_eq!(ops::convert(&Value::U8(7), NumKind::F32).unwrap(), Value::F32(7.0));
}

#[test]
fn negation_wraps() {
    assert_eq!(ops::unop(UnKind::Neg, &Value::I8(i8::MIN)).unwrap(), Value::I8(i8::MIN));
    assert_eq!(ops::unop(UnKind::BitNot, &Value::U8(0)).unwrap(), Value::U8(255));
}

#[test]
fn string_concat_and_compare() {
    let v = ops::binop(BinKind::Add, &Value::str("foo"), &Value::str("bar")).unwrap();
    assert_eq!(v, Value::str("foobar"));
    let v = ops::binop(BinKind::Lt, &Value::str("a"), &Value::str("b")).unwrap();
    assert_eq!(v, Value::Bool(true));
}

#[test]
fn equality_follows_comparability() {
    // Structs compare field by field under the same type.
    let a = Value::Struct(Arc::new(StructVal { ty: TypeId(0), fields: vec![Value::I64(1)] }));
    let b = Value::Struct(Arc::new(StructVal { ty: TypeId(0), fields: vec![Value::I64(1)] }));
    let c = Value::Struct(Arc::new(StructVal { ty: TypeId(1), fields: vec![Value::I64(1)] }));
    assert!(value_eq(&a, &b).unwrap());
    assert!(!value_eq(&a, &c).unwrap());

    // Nil interface equals only nil interface.
    assert!(value_eq(&Value::Iface(None), &Value::Nil).unwrap());
    let boxed = Value::iface(TypeId(0), Value::I64(1));
    assert!(!value_eq(&boxed, &Value::Iface(None)).unwrap());
    assert!(value_eq(&boxed, &Value::iface(TypeId(0), Value::I64(1))).unwrap());
    assert!(!value_eq(&boxed, &Value::iface(TypeId(1), Value::I64(1))).unwrap());

    // Slices and maps only compare against nil.
    let heap = Heap::new();
    let cell = heap.alloc(Value::Array(Arc::new(vec![])));
    let s = Value::Slice(SliceVal { cell, path: vec![], off: 0, len: 0, cap: 0 });
    assert!(!value_eq(&s, &Value::Nil).unwrap());
    assert!(value_eq(&s, &s.clone()).is_err());
}

#[test]
fn pointer_identity_is_handle_equality() {
    let heap = Heap::new();
    let a = heap.alloc(Value::I64(5));
    let b = heap.alloc(Value::I64(5));
    let pa = Value::Pointer(PtrVal::root(a));
    let pa2 = Value::Pointer(PtrVal::root(a));
    let pb = Value::Pointer(PtrVal::root(b));
    assert!(value_eq(&pa, &pa2).unwrap());
    assert!(!value_eq(&pa, &pb).unwrap());
}

#[test]
fn interior_paths_read_and_write() {
    let heap = Heap::new();
    let cell = heap.alloc(Value::Struct(Arc::new(StructVal {
        ty: TypeId(0),
        fields: vec![Value::I64(0), Value::Array(Arc::new(vec![Value::I64(1), Value::I64(2)]))],
    })));
    let path = [PathSeg::Field(1), PathSeg::Index(1)];
    heap.write(cell, &path, Value::I64(9)).unwrap().unwrap();
    let v = heap.read(cell, &path).unwrap().unwrap();
    assert_eq!(v, Value::I64(9));

    let bad = [PathSeg::Field(7)];
    let msg = heap.read(cell, &bad).unwrap().unwrap_err();
    assert!(msg.contains("invalid field index"));
}

#[test]
fn struct_copies_do_not_observe_cell_mutation() {
    let heap = Heap::new();
    let orig = Value::Struct(Arc::new(StructVal { ty: TypeId(0), fields: vec![Value::I64(1)] }));
    let cell = heap.alloc(orig.clone());
    let snapshot = heap.read(cell, &[]).unwrap().unwrap();
    heap.write(cell, &[PathSeg::Field(0)], Value::I64(2)).unwrap().unwrap();
    // The earlier copy keeps value semantics.
    assert_eq!(snapshot, orig);
    let now = heap.read(cell, &[PathSeg::Field(0)]).unwrap().unwrap();
    assert_eq!(now, Value::I64(2));
}

#[test]
fn cyclic_structures_render_without_recursing_forever() {
    let heap = Heap::new();
    let cell = heap.alloc(Value::Nil);
    heap.write(cell, &[], Value::Pointer(PtrVal::root(cell)))
        .unwrap()
        .unwrap();
    let rendered = heap.render(&Value::Pointer(PtrVal::root(cell))).unwrap();
    assert!(rendered.starts_with('&'));
    assert!(rendered.ends_with("..."));

    let plain = heap.alloc(Value::I64(3));
    assert_eq!(heap.render(&Value::Pointer(PtrVal::root(plain))).unwrap(), "&3");
}

#[test]
fn map_keys_project_for_comparable_values_only() {
    let k = ValueKey::project(&Value::str("a")).unwrap();
    assert_eq!(k, ValueKey::Str(Arc::from("a")));
    let heap = Heap::new();
    let id = heap.alloc_map(Value::Nil);
    let err = ValueKey::project(&Value::Map(id)).unwrap_err();
    assert!(err.contains("unhashable"));
}

#[test]
fn map_iteration_keeps_insertion_order() {
    let mut data = MapData::new(Value::I64(0));
    for (k, v) in [("b", 1), ("a", 2), ("c", 3)] {
        data.insert(
            ValueKey::project(&Value::str(k)).unwrap(),
            Value::str(k),
            Value::I64(v),
        );
    }
    data.remove(&ValueKey::project(&Value::str("a")).unwrap());
    let keys: Vec<String> = data.iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, ["b", "c"]);
    assert_eq!(data.len(), 2);
}

#[test]
fn display_matches_print_formatting() {
    assert_eq!(Value::F64(1.5).to_string(), "1.5");
    assert_eq!(Value::F64(1.0).to_string(), "1");
    assert_eq!(Value::Nil.to_string(), "<nil>");
    assert_eq!(Value::Iface(None).to_string(), "<nil>");
    assert_eq!(Value::tuple(vec![Value::I64(1), Value::Bool(true)]).to_string(), "(1, true)");
    assert_eq!(Value::iface(TypeId(0), Value::str("x")).to_string(), "x");
}
