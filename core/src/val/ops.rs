//! Scalar operators with fixed-width wraparound semantics.
//!
//! All errors here are runtime panic messages, never host faults. Integer
//! arithmetic wraps at the operand width; divide by zero and negative
//! shift counts panic; oversized shift counts are defined and produce 0
//! (or the sign fill for arithmetic right shift).

use std::sync::Arc;

use crate::ir::{BinKind, NumKind, UnKind};

use super::{Value, value_eq};

type R = Result<Value, String>;

macro_rules! int_arith {
    ($op:expr, $x:expr, $y:expr, $variant:ident, $ty:ty) => {{
        let (x, y) = ($x, $y);
        let v: $ty = match $op {
            BinKind::Add => x.wrapping_add(y),
            BinKind::Sub => x.wrapping_sub(y),
            BinKind::Mul => x.wrapping_mul(y),
            BinKind::Div => {
                if y == 0 {
                    return Err("runtime error: integer divide by zero".to_string());
                }
                x.wrapping_div(y)
            }
            BinKind::Rem => {
                if y == 0 {
                    return Err("runtime error: integer divide by zero".to_string());
                }
                x.wrapping_rem(y)
            }
            BinKind::And => x & y,
            BinKind::Or => x | y,
            BinKind::Xor => x ^ y,
            BinKind::AndNot => x & !y,
            BinKind::Shl => {
                let s = shift_amount(y as i64)?;
                if s >= <$ty>::BITS {
                    0
                } else {
                    x.wrapping_shl(s)
                }
            }
            BinKind::Shr => {
                let s = shift_amount(y as i64)?;
                if s >= <$ty>::BITS {
                    // Arithmetic shift fills with the sign bit.
                    if (x as $ty) < 0 { !0 } else { 0 }
                } else {
                    x.wrapping_shr(s)
                }
            }
            BinKind::Lt => return Ok(Value::Bool(x < y)),
            BinKind::Le => return Ok(Value::Bool(x <= y)),
            BinKind::Gt => return Ok(Value::Bool(x > y)),
            BinKind::Ge => return Ok(Value::Bool(x >= y)),
            BinKind::Eq | BinKind::Ne => unreachable!("handled structurally"),
        };
        Ok(Value::$variant(v))
    }};
}

fn shift_amount(y: i64) -> Result<u32, String> {
    if y < 0 {
        return Err("runtime error: negative shift amount".to_string());
    }
    Ok(y.min(u32::MAX as i64) as u32)
}

macro_rules! float_arith {
    ($op:expr, $x:expr, $y:expr, $variant:ident) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinKind::Add => Ok(Value::$variant(x + y)),
            BinKind::Sub => Ok(Value::$variant(x - y)),
            BinKind::Mul => Ok(Value::$variant(x * y)),
            BinKind::Div => Ok(Value::$variant(x / y)),
            BinKind::Lt => Ok(Value::Bool(x < y)),
            BinKind::Le => Ok(Value::Bool(x <= y)),
            BinKind::Gt => Ok(Value::Bool(x > y)),
            BinKind::Ge => Ok(Value::Bool(x >= y)),
            _ => Err(format!("invalid float operator {:?}", $op)),
        }
    }};
}

/// Apply a binary operator. Equality is structural ([`value_eq`]); the
/// remaining operators require operands of the same scalar kind.
pub fn binop(op: BinKind, x: &Value, y: &Value) -> R {
    match op {
        BinKind::Eq => return value_eq(x, y).map(Value::Bool),
        BinKind::Ne => return value_eq(x, y).map(|b| Value::Bool(!b)),
        _ => {}
    }
    match (x, y) {
        (Value::I8(a), Value::I8(b)) => int_arith!(op, *a, *b, I8, i8),
        (Value::I16(a), Value::I16(b)) => int_arith!(op, *a, *b, I16, i16),
        (Value::I32(a), Value::I32(b)) => int_arith!(op, *a, *b, I32, i32),
        (Value::I64(a), Value::I64(b)) => int_arith!(op, *a, *b, I64, i64),
        (Value::U8(a), Value::U8(b)) => uint_arith(op, *a as u64, *b as u64, 8),
        (Value::U16(a), Value::U16(b)) => uint_arith(op, *a as u64, *b as u64, 16),
        (Value::U32(a), Value::U32(b)) => uint_arith(op, *a as u64, *b as u64, 32),
        (Value::U64(a), Value::U64(b)) => uint_arith(op, *a, *b, 64),
        (Value::F32(a), Value::F32(b)) => float_arith!(op, *a, *b, F32),
        (Value::F64(a), Value::F64(b)) => float_arith!(op, *a, *b, F64),
        (Value::Str(a), Value::Str(b)) => match op {
            BinKind::Add => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Value::Str(Arc::from(s.as_str())))
            }
            BinKind::Lt => Ok(Value::Bool(a < b)),
            BinKind::Le => Ok(Value::Bool(a <= b)),
            BinKind::Gt => Ok(Value::Bool(a > b)),
            BinKind::Ge => Ok(Value::Bool(a >= b)),
            _ => Err(format!("invalid string operator {:?}", op)),
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinKind::And => Ok(Value::Bool(*a && *b)),
            BinKind::Or => Ok(Value::Bool(*a || *b)),
            _ => Err(format!("invalid bool operator {:?}", op)),
        },
        _ => Err(format!(
            "invalid operation: mismatched kinds {} and {}",
            x.type_name(),
            y.type_name()
        )),
    }
}

// Unsigned variants share one body; the width masks the result back down.
fn uint_arith(op: BinKind, x: u64, y: u64, bits: u32) -> R {
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let v: u64 = match op {
        BinKind::Add => x.wrapping_add(y),
        BinKind::Sub => x.wrapping_sub(y),
        BinKind::Mul => x.wrapping_mul(y),
        BinKind::Div => {
            if y == 0 {
                return Err("runtime error: integer divide by zero".to_string());
            }
            x / y
        }
        BinKind::Rem => {
            if y == 0 {
                return Err("runtime error: integer divide by zero".to_string());
            }
            x % y
        }
        BinKind::And => x & y,
        BinKind::Or => x | y,
        BinKind::Xor => x ^ y,
        BinKind::AndNot => x & !y,
        BinKind::Shl => {
            let s = shift_amount(y as i64)?;
            if s >= bits { 0 } else { x << s }
        }
        BinKind::Shr => {
            let s = shift_amount(y as i64)?;
            if s >= bits { 0 } else { (x & mask) >> s }
        }
        BinKind::Lt => return Ok(Value::Bool(x < y)),
        BinKind::Le => return Ok(Value::Bool(x <= y)),
        BinKind::Gt => return Ok(Value::Bool(x > y)),
        BinKind::Ge => return Ok(Value::Bool(x >= y)),
        BinKind::Eq | BinKind::Ne => unreachable!("handled structurally"),
    } & mask;
    Ok(match bits {
        8 => Value::U8(v as u8),
        16 => Value::U16(v as u16),
        32 => Value::U32(v as u32),
        _ => Value::U64(v),
    })
}

pub fn unop(op: UnKind, x: &Value) -> R {
    match (op, x) {
        (UnKind::Neg, Value::I8(v)) => Ok(Value::I8(v.wrapping_neg())),
        (UnKind::Neg, Value::I16(v)) => Ok(Value::I16(v.wrapping_neg())),
        (UnKind::Neg, Value::I32(v)) => Ok(Value::I32(v.wrapping_neg())),
        (UnKind::Neg, Value::I64(v)) => Ok(Value::I64(v.wrapping_neg())),
        (UnKind::Neg, Value::U8(v)) => Ok(Value::U8(v.wrapping_neg())),
        (UnKind::Neg, Value::U16(v)) => Ok(Value::U16(v.wrapping_neg())),
        (UnKind::Neg, Value::U32(v)) => Ok(Value::U32(v.wrapping_neg())),
        (UnKind::Neg, Value::U64(v)) => Ok(Value::U64(v.wrapping_neg())),
        (UnKind::Neg, Value::F32(v)) => Ok(Value::F32(-v)),
        (UnKind::Neg, Value::F64(v)) => Ok(Value::F64(-v)),
        (UnKind::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnKind::BitNot, Value::I8(v)) => Ok(Value::I8(!v)),
        (UnKind::BitNot, Value::I16(v)) => Ok(Value::I16(!v)),
        (UnKind::BitNot, Value::I32(v)) => Ok(Value::I32(!v)),
        (UnKind::BitNot, Value::I64(v)) => Ok(Value::I64(!v)),
        (UnKind::BitNot, Value::U8(v)) => Ok(Value::U8(!v)),
        (UnKind::BitNot, Value::U16(v)) => Ok(Value::U16(!v)),
        (UnKind::BitNot, Value::U32(v)) => Ok(Value::U32(!v)),
        (UnKind::BitNot, Value::U64(v)) => Ok(Value::U64(!v)),
        _ => Err(format!(
            "invalid operation: {:?} on {}",
            op,
            x.type_name()
        )),
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match *v {
        Value::I8(n) => Some(n as i64),
        Value::I16(n) => Some(n as i64),
        Value::I32(n) => Some(n as i64),
        Value::I64(n) => Some(n),
        Value::U8(n) => Some(n as i64),
        Value::U16(n) => Some(n as i64),
        Value::U32(n) => Some(n as i64),
        Value::U64(n) => Some(n as i64),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match *v {
        Value::F32(f) => Some(f as f64),
        Value::F64(f) => Some(f),
        _ => as_i64(v).map(|n| n as f64),
    }
}

/// Numeric conversion. Integer narrowing truncates; float to int truncates
/// toward zero (saturating at the target bounds).
pub fn convert(x: &Value, to: NumKind) -> R {
    let bad = || {
        Err(format!(
            "invalid conversion from {} to {:?}",
            x.type_name(),
            to
        ))
    };
    Ok(match to {
        NumKind::I8 => match num_parts(x) {
            Some(Num::Float(f)) => Value::I8(f as i8),
            Some(Num::Int(n)) => Value::I8(n as i8),
            None => return bad(),
        },
        NumKind::I16 => match num_parts(x) {
            Some(Num::Float(f)) => Value::I16(f as i16),
            Some(Num::Int(n)) => Value::I16(n as i16),
            None => return bad(),
        },
        NumKind::I32 => match num_parts(x) {
            Some(Num::Float(f)) => Value::I32(f as i32),
            Some(Num::Int(n)) => Value::I32(n as i32),
            None => return bad(),
        },
        NumKind::I64 => match num_parts(x) {
            Some(Num::Float(f)) => Value::I64(f as i64),
            Some(Num::Int(n)) => Value::I64(n),
            None => return bad(),
        },
        NumKind::U8 => match num_parts(x) {
            Some(Num::Float(f)) => Value::U8(f as u8),
            Some(Num::Int(n)) => Value::U8(n as u8),
            None => return bad(),
        },
        NumKind::U16 => match num_parts(x) {
            Some(Num::Float(f)) => Value::U16(f as u16),
            Some(Num::Int(n)) => Value::U16(n as u16),
            None => return bad(),
        },
        NumKind::U32 => match num_parts(x) {
            Some(Num::Float(f)) => Value::U32(f as u32),
            Some(Num::Int(n)) => Value::U32(n as u32),
            None => return bad(),
        },
        NumKind::U64 => match num_parts(x) {
            Some(Num::Float(f)) => Value::U64(f as u64),
            Some(Num::Int(n)) => Value::U64(n as u64),
            None => return bad(),
        },
        NumKind::F32 => match as_f64(x) {
            Some(f) => Value::F32(f as f32),
            None => return bad(),
        },
        NumKind::F64 => match as_f64(x) {
            Some(f) => Value::F64(f),
            None => return bad(),
        },
    })
}

enum Num {
    Int(i64),
    Float(f64),
}

fn num_parts(v: &Value) -> Option<Num> {
    match v {
        Value::F32(f) => Some(Num::Float(*f as f64)),
        Value::F64(f) => Some(Num::Float(*f)),
        _ => as_i64(v).map(Num::Int),
    }
}
