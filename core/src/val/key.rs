//! Hashable projection of comparable values, used as map keys.

use std::fmt;
use std::sync::Arc;

use crate::typ::TypeId;

use super::{PtrVal, Value};

/// A map key. Only comparable values project; attempting to key a map with
/// a slice, map or func raises a runtime panic at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    /// Raw bit pattern; distinct NaNs hash as distinct keys.
    Float(u64),
    Str(Arc<str>),
    Ptr(PtrVal),
    Chan(u64),
    Iface(Option<(TypeId, Box<ValueKey>)>),
    Composite(Vec<ValueKey>),
}

impl ValueKey {
    /// `Err` carries a runtime panic message.
    pub fn project(v: &Value) -> Result<ValueKey, String> {
        Ok(match v {
            Value::Nil => ValueKey::Nil,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::I8(n) => ValueKey::Int(*n as i64),
            Value::I16(n) => ValueKey::Int(*n as i64),
            Value::I32(n) => ValueKey::Int(*n as i64),
            Value::I64(n) => ValueKey::Int(*n),
            Value::U8(n) => ValueKey::Uint(*n as u64),
            Value::U16(n) => ValueKey::Uint(*n as u64),
            Value::U32(n) => ValueKey::Uint(*n as u64),
            Value::U64(n) => ValueKey::Uint(*n),
            Value::F32(f) => ValueKey::Float((*f as f64).to_bits()),
            Value::F64(f) => ValueKey::Float(f.to_bits()),
            Value::Str(s) => ValueKey::Str(s.clone()),
            Value::Pointer(p) => ValueKey::Ptr(p.clone()),
            Value::Chan(c) => ValueKey::Chan(c.0),
            Value::Iface(None) => ValueKey::Iface(None),
            Value::Iface(Some(i)) => {
                ValueKey::Iface(Some((i.ty, Box::new(ValueKey::project(&i.value)?))))
            }
            Value::Array(vals) => ValueKey::Composite(
                vals.iter().map(ValueKey::project).collect::<Result<_, _>>()?,
            ),
            Value::Struct(s) => ValueKey::Composite(
                s.fields
                    .iter()
                    .map(ValueKey::project)
                    .collect::<Result<_, _>>()?,
            ),
            other => {
                return Err(format!(
                    "runtime error: hash of unhashable type {}",
                    other.type_name()
                ));
            }
        })
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKey::Nil => f.write_str("<nil>"),
            ValueKey::Bool(b) => write!(f, "{}", b),
            ValueKey::Int(n) => write!(f, "{}", n),
            ValueKey::Uint(n) => write!(f, "{}", n),
            ValueKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            ValueKey::Str(s) => f.write_str(s),
            ValueKey::Ptr(p) => write!(f, "0x{:x}", p.cell.0),
            ValueKey::Chan(c) => write!(f, "0x{:x}", c),
            ValueKey::Iface(None) => f.write_str("<nil>"),
            ValueKey::Iface(Some((_, inner))) => write!(f, "{}", inner),
            ValueKey::Composite(parts) => {
                f.write_str("{")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str("}")
            }
        }
    }
}
