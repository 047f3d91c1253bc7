//! Numeric tower arithmetic (`spec.md` §3.3): widening, the four basic
//! operators, `%` (modulus, sign follows divisor) vs. `%%` (true remainder,
//! sign follows dividend), and bitwise/shift ops over `int`/`long`.

use std::rc::Rc;

use crate::value::Value;

/// Arithmetic failures, kept free of source position (the VM attaches
/// position/source-name when converting to a `RuntimeError` at the call
/// site, since that's where the offending opcode's offset is known).
#[derive(Debug)]
pub enum ArithError {
    DivByZero,
    TypeError(String),
}

impl From<&str> for ArithError {
    fn from(s: &str) -> Self {
        ArithError::TypeError(s.to_string())
    }
}

fn widen_pair(a: &Value, b: &Value) -> Option<(Value, Value)> {
    use Value::{Byte, Decimal, Double, Int, Long};
    match (a, b) {
        (Decimal(_), _) | (_, Decimal(_)) => Some((to_decimal(a)?, to_decimal(b)?)),
        (Double(_), _) | (_, Double(_)) => Some((Double(a.as_f64()?), Double(b.as_f64()?))),
        (Long(_), _) | (_, Long(_)) => Some((Long(to_i64(a)?), Long(to_i64(b)?))),
        (Int(_), Int(_)) | (Byte(_), Int(_)) | (Int(_), Byte(_)) => Some((Int(to_i64(a)? as i32), Int(to_i64(b)? as i32))),
        (Byte(_), Byte(_)) => Some((a.clone(), b.clone())),
        _ => None,
    }
}

fn to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Byte(b) => Some(i64::from(*b)),
        Value::Int(i) => Some(i64::from(*i)),
        Value::Long(l) => Some(*l),
        _ => None,
    }
}

fn to_decimal(v: &Value) -> Option<Value> {
    match v {
        Value::Decimal(_) => Some(v.clone()),
        Value::Byte(b) => Some(Value::Decimal(Rc::new(crate::decimal::Decimal::from_i64(i64::from(*b))))),
        Value::Int(i) => Some(Value::Decimal(Rc::new(crate::decimal::Decimal::from_i64(i64::from(*i))))),
        Value::Long(l) => Some(Value::Decimal(Rc::new(crate::decimal::Decimal::from_i64(*l)))),
        _ => None,
    }
}

pub fn add(a: &Value, b: &Value) -> Result<Value, String> {
    if let (Value::Str(x), _) = (a, b) {
        return Ok(Value::Str(Rc::from(format!("{x}{b}"))));
    }
    if let (_, Value::Str(y)) = (a, b) {
        return Ok(Value::Str(Rc::from(format!("{a}{y}"))));
    }
    if let (Value::List(x), Value::List(y)) = (a, b) {
        let mut out = x.borrow().clone();
        out.extend(y.borrow().iter().cloned());
        return Ok(Value::List(Rc::new(std::cell::RefCell::new(out))));
    }
    let (wa, wb) = widen_pair(a, b).ok_or_else(|| "cannot add these types".to_string())?;
    Ok(match (wa, wb) {
        (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(y)),
        (Value::Long(x), Value::Long(y)) => Value::Long(x.wrapping_add(y)),
        (Value::Double(x), Value::Double(y)) => Value::Double(x + y),
        (Value::Decimal(x), Value::Decimal(y)) => Value::Decimal(Rc::new(x.add(&y))),
        _ => unreachable!(),
    })
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, String> {
    let (wa, wb) = widen_pair(a, b).ok_or_else(|| "cannot subtract these types".to_string())?;
    Ok(match (wa, wb) {
        (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_sub(y)),
        (Value::Long(x), Value::Long(y)) => Value::Long(x.wrapping_sub(y)),
        (Value::Double(x), Value::Double(y)) => Value::Double(x - y),
        (Value::Decimal(x), Value::Decimal(y)) => Value::Decimal(Rc::new(x.sub(&y))),
        _ => unreachable!(),
    })
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, String> {
    if let Value::Str(s) = a {
        if let Some(n) = to_i64(b) {
            return Ok(Value::Str(Rc::from(s.repeat(n.max(0) as usize))));
        }
    }
    let (wa, wb) = widen_pair(a, b).ok_or_else(|| "cannot multiply these types".to_string())?;
    Ok(match (wa, wb) {
        (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_mul(y)),
        (Value::Long(x), Value::Long(y)) => Value::Long(x.wrapping_mul(y)),
        (Value::Double(x), Value::Double(y)) => Value::Double(x * y),
        (Value::Decimal(x), Value::Decimal(y)) => Value::Decimal(Rc::new(x.mul(&y))),
        _ => unreachable!(),
    })
}

pub fn div(a: &Value, b: &Value, min_scale: u32) -> Result<Value, ArithError> {
    let (wa, wb) = widen_pair(a, b).ok_or(ArithError::TypeError("cannot divide these types".into()))?;
    match (wa, wb) {
        (Value::Int(x), Value::Int(y)) => {
            if y == 0 {
                return Err(ArithError::DivByZero);
            }
            Ok(Value::Int(x.wrapping_div(y)))
        }
        (Value::Long(x), Value::Long(y)) => {
            if y == 0 {
                return Err(ArithError::DivByZero);
            }
            Ok(Value::Long(x.wrapping_div(y)))
        }
        (Value::Double(x), Value::Double(y)) => Ok(Value::Double(x / y)),
        (Value::Decimal(x), Value::Decimal(y)) => x.div(&y, min_scale).map(|d| Value::Decimal(Rc::new(d))).ok_or(ArithError::DivByZero),
        _ => unreachable!(),
    }
}

/// `%`: result has the same sign as the divisor (modulus).
pub fn modulus(a: &Value, b: &Value) -> Result<Value, ArithError> {
    let (wa, wb) = widen_pair(a, b).ok_or(ArithError::TypeError("cannot modulus these types".into()))?;
    match (wa, wb) {
        (Value::Int(x), Value::Int(y)) => {
            if y == 0 {
                return Err(ArithError::DivByZero);
            }
            let m = x % y;
            Ok(Value::Int(if m != 0 && (m < 0) != (y < 0) { m + y } else { m }))
        }
        (Value::Long(x), Value::Long(y)) => {
            if y == 0 {
                return Err(ArithError::DivByZero);
            }
            let m = x % y;
            Ok(Value::Long(if m != 0 && (m < 0) != (y < 0) { m + y } else { m }))
        }
        (Value::Double(x), Value::Double(y)) => {
            let m = x % y;
            Ok(Value::Double(if m != 0.0 && (m < 0.0) != (y < 0.0) { m + y } else { m }))
        }
        _ => Err(ArithError::TypeError("modulus not supported for Decimal".into())),
    }
}

/// `%%`: true remainder, sign follows the dividend.
pub fn true_modulus(a: &Value, b: &Value) -> Result<Value, ArithError> {
    let (wa, wb) = widen_pair(a, b).ok_or(ArithError::TypeError("cannot modulus these types".into()))?;
    match (wa, wb) {
        (Value::Int(x), Value::Int(y)) => {
            if y == 0 {
                return Err(ArithError::DivByZero);
            }
            Ok(Value::Int(x % y))
        }
        (Value::Long(x), Value::Long(y)) => {
            if y == 0 {
                return Err(ArithError::DivByZero);
            }
            Ok(Value::Long(x % y))
        }
        (Value::Double(x), Value::Double(y)) => Ok(Value::Double(x % y)),
        _ => Err(ArithError::TypeError("%% not supported for Decimal".into())),
    }
}

pub fn neg(v: &Value) -> Result<Value, String> {
    Ok(match v {
        Value::Int(i) => Value::Int(-i),
        Value::Long(l) => Value::Long(-l),
        Value::Double(d) => Value::Double(-d),
        Value::Decimal(d) => Value::Decimal(Rc::new(crate::decimal::Decimal::zero().sub(d))),
        _ => return Err("cannot negate".into()),
    })
}

pub fn bitop(a: &Value, b: &Value, f: impl Fn(i64, i64) -> i64) -> Result<Value, String> {
    let x = to_i64(a).ok_or("expected integer")?;
    let y = to_i64(b).ok_or("expected integer")?;
    let r = f(x, y);
    Ok(if matches!(a, Value::Long(_)) || matches!(b, Value::Long(_)) { Value::Long(r) } else { Value::Int(r as i32) })
}
