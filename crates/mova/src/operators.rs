//! Arithmetic and comparison operator semantics.
//!
//! Integer purity: an operation on two ints stays an int unless it would
//! overflow (a runtime error); any float operand taints the result to
//! float. `+` with a string operand coerces both sides to their display
//! form and concatenates; `*` with a string and an int repeats the string;
//! `+` on two lists concatenates into a new list.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::value::Value;

fn type_mismatch(op: &str, left: &Value, right: &Value) -> Error {
    Error::runtime(format!(
        "unsupported operand types for {}: {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn overflow(op: &str) -> Error {
    Error::runtime(format!("integer overflow in {}", op))
}

pub fn add(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or_else(|| overflow("+")),
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            Ok(Value::Str(format!("{}{}", left.display(), right.display())))
        }
        (Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        _ => numeric(left, right, "+", |a, b| a + b),
    }
}

pub fn sub(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_sub(*b)
            .map(Value::Int)
            .ok_or_else(|| overflow("-")),
        _ => numeric(left, right, "-", |a, b| a - b),
    }
}

pub fn mul(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_mul(*b)
            .map(Value::Int)
            .ok_or_else(|| overflow("*")),
        (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
            if *n <= 0 {
                Ok(Value::Str(String::new()))
            } else {
                Ok(Value::Str(s.repeat(*n as usize)))
            }
        }
        _ => numeric(left, right, "*", |a, b| a * b),
    }
}

pub fn div(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(Error::runtime("Division by zero"))
            } else {
                a.checked_div(*b)
                    .map(Value::Int)
                    .ok_or_else(|| overflow("/"))
            }
        }
        _ => {
            let (a, b) = floats(left, right, "/")?;
            if b == 0.0 {
                Err(Error::runtime("Division by zero"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
    }
}

pub fn modulo(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(Error::runtime("Division by zero"))
            } else {
                a.checked_rem(*b)
                    .map(Value::Int)
                    .ok_or_else(|| overflow("%"))
            }
        }
        _ => {
            let (a, b) = floats(left, right, "%")?;
            if b == 0.0 {
                Err(Error::runtime("Division by zero"))
            } else {
                Ok(Value::Float(a % b))
            }
        }
    }
}

/// `**` stays an int for two ints and a non-negative exponent; otherwise
/// the result is a float.
pub fn pow(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) if *b >= 0 => {
            let exp = u32::try_from(*b).map_err(|_| overflow("**"))?;
            a.checked_pow(exp).map(Value::Int).ok_or_else(|| overflow("**"))
        }
        _ => {
            let (a, b) = floats(left, right, "**")?;
            Ok(Value::Float(a.powf(b)))
        }
    }
}

pub fn neg(operand: &Value) -> Result<Value> {
    match operand {
        Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(Error::runtime(format!(
            "unsupported operand type for unary -: {}",
            operand.type_name()
        ))),
    }
}

/// Ordering for the `< > <= >=` opcodes: two numbers, or two strings
/// (lexicographic).
pub fn order(left: &Value, right: &Value) -> Result<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => {
            let a = left
                .as_float()
                .ok_or_else(|| type_mismatch("comparison", left, right))?;
            let b = right
                .as_float()
                .ok_or_else(|| type_mismatch("comparison", left, right))?;
            a.partial_cmp(&b)
                .ok_or_else(|| Error::runtime("comparison with NaN has no ordering"))
        }
    }
}

fn numeric<F>(left: &Value, right: &Value, op: &str, float_op: F) -> Result<Value>
where
    F: Fn(f64, f64) -> f64,
{
    let (a, b) = floats(left, right, op)?;
    Ok(Value::Float(float_op(a, b)))
}

fn floats(left: &Value, right: &Value, op: &str) -> Result<(f64, f64)> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(type_mismatch(op, left, right)),
    }
}
