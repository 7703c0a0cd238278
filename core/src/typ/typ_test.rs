use std::sync::Arc;

use crate::val::Value;

use super::*;

fn iface(table: &mut TypeTable, name: &str, methods: &[&str]) -> TypeId {
    table.register(TypeDef {
        name: Arc::from(name),
        kind: TypeKind::Iface {
            methods: methods.iter().map(|m| Arc::from(*m)).collect(),
        },
        methods: Vec::new(),
        zero: Value::Iface(None),
    })
}

fn concrete(table: &mut TypeTable, name: &str, methods: &[(&str, usize)]) -> TypeId {
    table.register(TypeDef {
        name: Arc::from(name),
        kind: TypeKind::Struct { fields: Vec::new() },
        methods: methods.iter().map(|(m, f)| (Arc::from(*m), *f)).collect(),
        zero: Value::Nil,
    })
}

#[test]
fn satisfaction_is_method_set_superset() {
    let mut t = TypeTable::new();
    let speaker = iface(&mut t, "Speaker", &["Speak"]);
    let walker = iface(&mut t, "Walker", &["Speak", "Walk"]);
    let dog = concrete(&mut t, "Dog", &[("Speak", 0), ("Walk", 1), ("Fetch", 2)]);
    let rock = concrete(&mut t, "Rock", &[]);

    assert!(t.satisfies(dog, speaker).unwrap());
    assert!(t.satisfies(dog, walker).unwrap());
    assert!(!t.satisfies(rock, speaker).unwrap());

    // Interface-to-interface: a type covering the wider set covers the
    // narrower one too, never the other way around.
    let talker = concrete(&mut t, "Talker", &[("Speak", 3)]);
    assert!(t.satisfies(talker, speaker).unwrap());
    assert!(!t.satisfies(talker, walker).unwrap());
}

#[test]
fn direct_method_lookup() {
    let mut t = TypeTable::new();
    let dog = concrete(&mut t, "Dog", &[("Speak", 7)]);
    let entry = t.method(dog, "Speak").unwrap();
    assert_eq!(entry.path, Vec::<usize>::new());
    assert_eq!(entry.target, MethodTarget::Func(7));
    assert!(t.method(dog, "Missing").is_none());
}

#[test]
fn promotion_walks_embedded_fields() {
    let mut t = TypeTable::new();
    let inner = concrete(&mut t, "Inner", &[("Greet", 1)]);
    let outer = t.register(TypeDef {
        name: Arc::from("Outer"),
        kind: TypeKind::Struct {
            fields: vec![FieldDef::plain("tag"), FieldDef::embedded("Inner", inner)],
        },
        methods: Vec::new(),
        zero: Value::Nil,
    });

    let entry = t.method(outer, "Greet").unwrap();
    assert_eq!(entry.path, vec![1]);
    assert_eq!(entry.target, MethodTarget::Func(1));
}

#[test]
fn shallower_methods_shadow_deeper_ones() {
    let mut t = TypeTable::new();
    let deep = concrete(&mut t, "Deep", &[("Name", 1)]);
    let mid = t.register(TypeDef {
        name: Arc::from("Mid"),
        kind: TypeKind::Struct { fields: vec![FieldDef::embedded("Deep", deep)] },
        methods: vec![(Arc::from("Name"), 2)],
        zero: Value::Nil,
    });
    let top = t.register(TypeDef {
        name: Arc::from("Top"),
        kind: TypeKind::Struct { fields: vec![FieldDef::embedded("Mid", mid)] },
        methods: Vec::new(),
        zero: Value::Nil,
    });

    let entry = t.method(top, "Name").unwrap();
    assert_eq!(entry.target, MethodTarget::Func(2));
    assert_eq!(entry.path, vec![0]);
}

#[test]
fn same_depth_candidates_are_ambiguous() {
    let mut t = TypeTable::new();
    let a = concrete(&mut t, "A", &[("Do", 1)]);
    let b = concrete(&mut t, "B", &[("Do", 2)]);
    let both = t.register(TypeDef {
        name: Arc::from("Both"),
        kind: TypeKind::Struct {
            fields: vec![FieldDef::embedded("A", a), FieldDef::embedded("B", b)],
        },
        methods: Vec::new(),
        zero: Value::Nil,
    });

    assert!(t.method(both, "Do").is_none());
}

#[test]
fn embedded_interface_fields_promote_dynamically() {
    let mut t = TypeTable::new();
    let animal = iface(&mut t, "Animal", &["Sound"]);
    let farm = t.register(TypeDef {
        name: Arc::from("Farm"),
        kind: TypeKind::Struct { fields: vec![FieldDef::embedded("Animal", animal)] },
        methods: Vec::new(),
        zero: Value::Nil,
    });

    let entry = t.method(farm, "Sound").unwrap();
    assert_eq!(entry.path, vec![0]);
    assert_eq!(entry.target, MethodTarget::Dynamic);
    // The embedded interface makes the outer type satisfy it.
    assert!(t.satisfies(farm, animal).unwrap());
}
