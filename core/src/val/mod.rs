//! Runtime value model.
//!
//! A closed, tagged union over everything the evaluator can touch. Values
//! with reference semantics (pointers, slices, maps) do not carry host
//! pointers; they carry [`HeapId`] handles into the [`Heap`] arena so that
//! identity is handle equality and cyclic structures stay representable.

use std::fmt;
use std::sync::Arc;

use crate::ir::Function;
use crate::typ::TypeId;

mod heap;
mod key;
pub mod ops;

pub use heap::{Heap, HeapId, PathSeg};
pub use key::ValueKey;

#[cfg(test)]
mod val_test;

/// Channel handle into the runtime scheduler's channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChanId(pub u64);

/// A struct value: ordered fields plus the concrete type they belong to.
///
/// Struct values copy on assignment; mutation happens only through heap
/// cells, where `Arc::make_mut` preserves the copies already handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct StructVal {
    pub ty: TypeId,
    pub fields: Vec<Value>,
}

/// A pointer: a heap cell plus an access path for interior addresses
/// (field of a struct, element of an array) within that cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PtrVal {
    pub cell: HeapId,
    pub path: Vec<PathSeg>,
}

impl PtrVal {
    pub fn root(cell: HeapId) -> Self {
        Self { cell, path: Vec::new() }
    }

    pub fn child(&self, seg: PathSeg) -> Self {
        let mut path = self.path.clone();
        path.push(seg);
        Self { cell: self.cell, path }
    }
}

/// A slice header: backing array cell (possibly interior), offset, length
/// and capacity. Two slices alias when they share the same cell and their
/// index ranges overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceVal {
    pub cell: HeapId,
    pub path: Vec<PathSeg>,
    pub off: usize,
    pub len: usize,
    pub cap: usize,
}

/// Boxed interface content: the dynamic (concrete) type descriptor plus
/// the underlying value. The nil interface is `Value::Iface(None)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceVal {
    pub ty: TypeId,
    pub value: Value,
}

/// Function-shaped values.
#[derive(Debug, Clone)]
pub enum FuncVal {
    /// A plain IR function.
    Ir(Arc<Function>),
    /// An external primitive referenced by qualified name.
    Native(Arc<str>),
    /// A closure: IR function plus captured environment, bound at creation.
    Closure {
        func: Arc<Function>,
        captures: Vec<Value>,
    },
    /// A bound method value. Closes over the receiver *expression*: the
    /// method is resolved against the receiver's current dynamic state at
    /// call time, so mutation of an embedded field is observed.
    Bound { recv: Value, method: Arc<str> },
}

/// Heap-resident map storage. Lives only inside heap cells; user code sees
/// `Value::Map(handle)`.
#[derive(Debug, Clone)]
pub struct MapData {
    entries: crate::util::fast_map::FastHashMap<ValueKey, (Value, Value)>,
    insertion: Vec<ValueKey>,
    /// Element zero value, yielded by lookups that miss. Boxed so the
    /// `Value::MapStore` variant does not make `Value` infinitely sized.
    zero: Box<Value>,
}

impl MapData {
    pub fn new(zero: Value) -> Self {
        Self {
            entries: Default::default(),
            insertion: Vec::new(),
            zero: Box::new(zero),
        }
    }

    pub fn zero(&self) -> &Value {
        &self.zero
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ValueKey) -> Option<&Value> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: ValueKey, orig_key: Value, value: Value) {
        if !self.entries.contains_key(&key) {
            self.insertion.push(key.clone());
        }
        self.entries.insert(key, (orig_key, value));
    }

    pub fn remove(&mut self, key: &ValueKey) {
        if self.entries.remove(key).is_some() {
            self.insertion.retain(|k| k != key);
        }
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.insertion
            .iter()
            .filter_map(|k| self.entries.get(k).map(|(orig, v)| (orig, v)))
    }
}

/// The tagged runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// UTF-8 text. Slicing is byte-indexed and exact on code point
    /// boundaries; a slice that splits a code point yields the
    /// replacement character for the severed bytes, since this
    /// representation cannot hold invalid UTF-8.
    Str(Arc<str>),
    /// Multi-value result (call returns, comma-ok forms, select).
    Tuple(Arc<[Value]>),
    /// Array value (value semantics; the backing store of slices when
    /// resident in a heap cell).
    Array(Arc<Vec<Value>>),
    Struct(Arc<StructVal>),
    Pointer(PtrVal),
    Slice(SliceVal),
    /// Map handle; the cell holds `Value::MapStore`.
    Map(HeapId),
    /// Heap-resident map storage. Never appears in registers.
    MapStore(MapData),
    Chan(ChanId),
    Iface(Option<Arc<IfaceVal>>),
    Func(Arc<FuncVal>),
}

impl Value {
    pub fn str<S: AsRef<str>>(s: S) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn func(f: FuncVal) -> Value {
        Value::Func(Arc::new(f))
    }

    pub fn tuple(vals: Vec<Value>) -> Value {
        Value::Tuple(Arc::from(vals))
    }

    pub fn iface(ty: TypeId, value: Value) -> Value {
        Value::Iface(Some(Arc::new(IfaceVal { ty, value })))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil | Value::Iface(None))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view used by index/length contexts.
    pub fn as_index(&self) -> Option<i64> {
        match *self {
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U8(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::I8(_) => "int8",
            Value::I16(_) => "int16",
            Value::I32(_) => "int32",
            Value::I64(_) => "int",
            Value::U8(_) => "uint8",
            Value::U16(_) => "uint16",
            Value::U32(_) => "uint32",
            Value::U64(_) => "uint64",
            Value::F32(_) => "float32",
            Value::F64(_) => "float64",
            Value::Str(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Pointer(_) => "pointer",
            Value::Slice(_) => "slice",
            Value::Map(_) | Value::MapStore(_) => "map",
            Value::Chan(_) => "chan",
            Value::Iface(_) => "interface",
            Value::Func(_) => "func",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            // Handle identity for the reference kinds the language keeps
            // uncomparable; host-side tests still want an equivalence.
            (Value::Slice(a), Value::Slice(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::MapStore(_), Value::MapStore(_)) => false,
            _ => value_eq(self, other).unwrap_or(false),
        }
    }
}

/// Structural equality with the interpreted language's comparability rules.
/// `Err` carries a runtime panic message (comparing incomparable values).
pub fn value_eq(a: &Value, b: &Value) -> Result<bool, String> {
    use Value::*;
    let ok = match (a, b) {
        (Nil, Nil) => true,
        // Slices, maps, channels and funcs compare only against nil.
        (Nil, Slice(_)) | (Slice(_), Nil) => false,
        (Nil, Map(_)) | (Map(_), Nil) => false,
        (Nil, Func(_)) | (Func(_), Nil) => false,
        (Nil, Chan(_)) | (Chan(_), Nil) => false,
        (Nil, Pointer(_)) | (Pointer(_), Nil) => false,
        (Nil, Iface(i)) | (Iface(i), Nil) => i.is_none(),
        (Bool(x), Bool(y)) => x == y,
        (I8(x), I8(y)) => x == y,
        (I16(x), I16(y)) => x == y,
        (I32(x), I32(y)) => x == y,
        (I64(x), I64(y)) => x == y,
        (U8(x), U8(y)) => x == y,
        (U16(x), U16(y)) => x == y,
        (U32(x), U32(y)) => x == y,
        (U64(x), U64(y)) => x == y,
        (F32(x), F32(y)) => x == y,
        (F64(x), F64(y)) => x == y,
        (Str(x), Str(y)) => x == y,
        (Pointer(x), Pointer(y)) => x == y,
        (Chan(x), Chan(y)) => x == y,
        (Array(x), Array(y)) => {
            if x.len() != y.len() {
                return Ok(false);
            }
            for (xv, yv) in x.iter().zip(y.iter()) {
                if !value_eq(xv, yv)? {
                    return Ok(false);
                }
            }
            true
        }
        (Struct(x), Struct(y)) => {
            if x.ty != y.ty || x.fields.len() != y.fields.len() {
                return Ok(false);
            }
            for (xv, yv) in x.fields.iter().zip(y.fields.iter()) {
                if !value_eq(xv, yv)? {
                    return Ok(false);
                }
            }
            true
        }
        (Iface(None), Iface(None)) => true,
        (Iface(None), Iface(Some(_))) | (Iface(Some(_)), Iface(None)) => false,
        (Iface(Some(x)), Iface(Some(y))) => x.ty == y.ty && value_eq(&x.value, &y.value)?,
        (Tuple(x), Tuple(y)) => {
            if x.len() != y.len() {
                return Ok(false);
            }
            for (xv, yv) in x.iter().zip(y.iter()) {
                if !value_eq(xv, yv)? {
                    return Ok(false);
                }
            }
            true
        }
        (Slice(_), Slice(_)) => {
            return Err("runtime error: comparing uncomparable type slice".to_string());
        }
        (Map(_), Map(_)) => {
            return Err("runtime error: comparing uncomparable type map".to_string());
        }
        (Func(_), Func(_)) => {
            return Err("runtime error: comparing uncomparable type func".to_string());
        }
        _ => false,
    };
    Ok(ok)
}

fn fmt_f64(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_finite() {
        let mut buf = ryu::Buffer::new();
        let s = buf.format(v);
        f.write_str(s.strip_suffix(".0").unwrap_or(s))
    } else {
        write!(f, "{}", v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil | Value::Iface(None) => f.write_str("<nil>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I8(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::I16(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::I32(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::I64(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::U8(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::U16(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::U32(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::U64(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::F32(v) => fmt_f64(f, *v as f64),
            Value::F64(v) => fmt_f64(f, *v),
            Value::Str(s) => f.write_str(s),
            Value::Tuple(vals) => {
                f.write_str("(")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str(")")
            }
            Value::Array(vals) => {
                f.write_str("[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Value::Struct(s) => {
                f.write_str("{")?;
                for (i, v) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("}")
            }
            Value::Pointer(p) => write!(f, "0x{:x}", p.cell.0),
            Value::Slice(_) => f.write_str("[...]"),
            Value::Map(_) | Value::MapStore(_) => f.write_str("map[...]"),
            Value::Chan(c) => write!(f, "0x{:x}", c.0),
            Value::Iface(Some(i)) => write!(f, "{}", i.value),
            Value::Func(_) => f.write_str("<func>"),
        }
    }
}
