//! The built-in function registry.
//!
//! The VM seeds its global slots from this registry by name before
//! execution: any module global whose name matches a registry entry starts
//! out bound to the native function. Each entry publishes its arity
//! (negative means variadic); the VM enforces exact arities, and every
//! builtin fails cleanly on a type mismatch.

use crate::error::{Error, Result};
use crate::value::{NativeFunction, Value};

/// Look up a built-in by name.
pub fn lookup(name: &str) -> Option<NativeFunction> {
    REGISTRY.iter().find(|nf| nf.name == name).copied()
}

const REGISTRY: &[NativeFunction] = &[
    NativeFunction { name: "abs", arity: 1, f: builtin_abs },
    NativeFunction { name: "sqrt", arity: 1, f: builtin_sqrt },
    NativeFunction { name: "min", arity: -1, f: builtin_min },
    NativeFunction { name: "max", arity: -1, f: builtin_max },
    NativeFunction { name: "round", arity: 1, f: builtin_round },
    NativeFunction { name: "floor", arity: 1, f: builtin_floor },
    NativeFunction { name: "ceil", arity: 1, f: builtin_ceil },
    NativeFunction { name: "len", arity: 1, f: builtin_len },
    NativeFunction { name: "upper", arity: 1, f: builtin_upper },
    NativeFunction { name: "lower", arity: 1, f: builtin_lower },
    NativeFunction { name: "trim", arity: 1, f: builtin_trim },
    NativeFunction { name: "split", arity: 2, f: builtin_split },
    NativeFunction { name: "join", arity: 2, f: builtin_join },
    NativeFunction { name: "int", arity: 1, f: builtin_int },
    NativeFunction { name: "float", arity: 1, f: builtin_float },
    NativeFunction { name: "str", arity: 1, f: builtin_str },
    NativeFunction { name: "bool", arity: 1, f: builtin_bool },
    NativeFunction { name: "range", arity: -1, f: builtin_range },
    NativeFunction { name: "sum", arity: 1, f: builtin_sum },
    NativeFunction { name: "type", arity: 1, f: builtin_type },
];

fn expected(func: &str, what: &str, got: &Value) -> Error {
    Error::runtime(format!(
        "{}() expects {}, got {}",
        func,
        what,
        got.type_name()
    ))
}

fn arg_int(func: &str, arg: &Value) -> Result<i64> {
    arg.as_int().ok_or_else(|| expected(func, "an int", arg))
}

fn arg_number(func: &str, arg: &Value) -> Result<f64> {
    arg.as_float().ok_or_else(|| expected(func, "a number", arg))
}

fn arg_str<'a>(func: &str, arg: &'a Value) -> Result<&'a str> {
    arg.as_str().ok_or_else(|| expected(func, "a string", arg))
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

fn builtin_abs(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(expected("abs", "a number", other)),
    }
}

fn builtin_sqrt(args: &[Value]) -> Result<Value> {
    let x = arg_number("sqrt", &args[0])?;
    if x < 0.0 {
        return Err(Error::runtime("sqrt() of a negative number"));
    }
    Ok(Value::Float(x.sqrt()))
}

fn builtin_min(args: &[Value]) -> Result<Value> {
    fold_extremum("min", args, |a, b| a < b)
}

fn builtin_max(args: &[Value]) -> Result<Value> {
    fold_extremum("max", args, |a, b| a > b)
}

/// `min`/`max` accept either a single list or two-plus direct arguments.
fn fold_extremum(func: &str, args: &[Value], wins: fn(f64, f64) -> bool) -> Result<Value> {
    let items: Vec<Value> = match args {
        [] => return Err(Error::runtime(format!("{}() expects at least 1 argument", func))),
        [Value::List(items)] => items.borrow().clone(),
        _ => args.to_vec(),
    };
    if items.is_empty() {
        return Err(Error::runtime(format!("{}() of an empty list", func)));
    }

    let mut best = items[0].clone();
    let mut best_key = arg_number(func, &best)?;
    for item in &items[1..] {
        let key = arg_number(func, item)?;
        if wins(key, best_key) {
            best = item.clone();
            best_key = key;
        }
    }
    Ok(best)
}

fn builtin_round(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(f.round() as i64)),
        other => Err(expected("round", "a number", other)),
    }
}

fn builtin_floor(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(f.floor() as i64)),
        other => Err(expected("floor", "a number", other)),
    }
}

fn builtin_ceil(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(f.ceil() as i64)),
        other => Err(expected("ceil", "a number", other)),
    }
}

// ---------------------------------------------------------------------------
// Sequences and strings
// ---------------------------------------------------------------------------

fn builtin_len(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Int(items.borrow().len() as i64)),
        Value::Map(pairs) => Ok(Value::Int(pairs.borrow().len() as i64)),
        other => Err(expected("len", "a string, list, or map", other)),
    }
}

fn builtin_upper(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(arg_str("upper", &args[0])?.to_uppercase()))
}

fn builtin_lower(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(arg_str("lower", &args[0])?.to_lowercase()))
}

fn builtin_trim(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(arg_str("trim", &args[0])?.trim().to_string()))
}

fn builtin_split(args: &[Value]) -> Result<Value> {
    let text = arg_str("split", &args[0])?;
    let sep = arg_str("split", &args[1])?;
    let parts: Vec<Value> = if sep.is_empty() {
        text.chars().map(|c| Value::Str(c.to_string())).collect()
    } else {
        text.split(sep).map(|p| Value::Str(p.to_string())).collect()
    };
    Ok(Value::list(parts))
}

fn builtin_join(args: &[Value]) -> Result<Value> {
    let Value::List(items) = &args[0] else {
        return Err(expected("join", "a list", &args[0]));
    };
    let sep = arg_str("join", &args[1])?;
    let parts: Vec<String> = items.borrow().iter().map(|v| v.display()).collect();
    Ok(Value::Str(parts.join(sep)))
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn builtin_int(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Str(s) => s
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| Error::runtime(format!("int() cannot parse '{}'", s))),
        other => Err(expected("int", "a number, bool, or string", other)),
    }
}

fn builtin_float(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        Value::Str(s) => s
            .trim()
            .parse()
            .map(Value::Float)
            .map_err(|_| Error::runtime(format!("float() cannot parse '{}'", s))),
        other => Err(expected("float", "a number, bool, or string", other)),
    }
}

fn builtin_str(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(args[0].display()))
}

fn builtin_bool(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0].is_truthy()))
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

/// `range(stop)`, `range(start, stop)`, or `range(start, stop, step)` with
/// int arguments; the interval is half-open and the step may be negative
/// but never zero.
fn builtin_range(args: &[Value]) -> Result<Value> {
    let (start, stop, step) = match args {
        [stop] => (0, arg_int("range", stop)?, 1),
        [start, stop] => (arg_int("range", start)?, arg_int("range", stop)?, 1),
        [start, stop, step] => (
            arg_int("range", start)?,
            arg_int("range", stop)?,
            arg_int("range", step)?,
        ),
        _ => return Err(Error::runtime("range() takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(Error::runtime("range() step cannot be zero"));
    }

    let mut items = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            items.push(Value::Int(i));
            i += step;
        }
    } else {
        while i > stop {
            items.push(Value::Int(i));
            i += step;
        }
    }
    Ok(Value::list(items))
}

fn builtin_sum(args: &[Value]) -> Result<Value> {
    let Value::List(items) = &args[0] else {
        return Err(expected("sum", "a list", &args[0]));
    };

    let mut int_total = 0i64;
    let mut float_total = 0.0f64;
    let mut tainted = false;
    for item in items.borrow().iter() {
        match item {
            Value::Int(i) => {
                if tainted {
                    float_total += *i as f64;
                } else {
                    int_total = int_total
                        .checked_add(*i)
                        .ok_or_else(|| Error::runtime("integer overflow in sum()"))?;
                }
            }
            Value::Float(f) => {
                if !tainted {
                    tainted = true;
                    float_total = int_total as f64;
                }
                float_total += *f;
            }
            other => return Err(expected("sum", "a list of numbers", other)),
        }
    }
    if tainted {
        Ok(Value::Float(float_total))
    } else {
        Ok(Value::Int(int_total))
    }
}

fn builtin_type(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(args[0].type_name().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value> {
        (lookup(name).unwrap().f)(args)
    }

    #[test]
    fn test_registry_covers_the_contract() {
        for name in [
            "abs", "sqrt", "min", "max", "round", "floor", "ceil", "len", "upper", "lower",
            "trim", "split", "join", "int", "float", "str", "bool", "range", "sum", "type",
        ] {
            assert!(lookup(name).is_some(), "missing builtin {}", name);
        }
        assert!(lookup("no_such").is_none());
    }

    #[test]
    fn test_range_half_open() {
        assert_eq!(
            call("range", &[Value::Int(3)]).unwrap(),
            Value::list(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            call("range", &[Value::Int(5), Value::Int(1), Value::Int(-2)]).unwrap(),
            Value::list(vec![Value::Int(5), Value::Int(3)])
        );
        assert!(call("range", &[Value::Int(0), Value::Int(5), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_len() {
        assert_eq!(
            call("len", &[Value::Str("привіт".to_string())]).unwrap(),
            Value::Int(6)
        );
        assert_eq!(
            call("len", &[Value::list(vec![Value::Int(1)])]).unwrap(),
            Value::Int(1)
        );
        assert!(call("len", &[Value::Int(3)]).is_err());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            call("int", &[Value::Str(" 42 ".to_string())]).unwrap(),
            Value::Int(42)
        );
        assert_eq!(call("int", &[Value::Float(3.9)]).unwrap(), Value::Int(3));
        assert!(call("int", &[Value::Str("nope".to_string())]).is_err());
        assert_eq!(
            call("str", &[Value::Float(5.0)]).unwrap(),
            Value::Str("5".to_string())
        );
        assert_eq!(call("bool", &[Value::Int(0)]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_sum_promotion() {
        assert_eq!(
            call("sum", &[Value::list(vec![Value::Int(1), Value::Int(2)])]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            call(
                "sum",
                &[Value::list(vec![Value::Int(1), Value::Float(0.5)])]
            )
            .unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn test_min_max() {
        assert_eq!(
            call("min", &[Value::Int(3), Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            call("max", &[Value::list(vec![Value::Int(3), Value::Float(4.5)])]).unwrap(),
            Value::Float(4.5)
        );
        assert!(call("min", &[Value::list(vec![])]).is_err());
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(
            call("upper", &[Value::Str("ab".to_string())]).unwrap(),
            Value::Str("AB".to_string())
        );
        assert_eq!(
            call("trim", &[Value::Str("  x ".to_string())]).unwrap(),
            Value::Str("x".to_string())
        );
        assert_eq!(
            call(
                "split",
                &[Value::Str("a,b".to_string()), Value::Str(",".to_string())]
            )
            .unwrap(),
            Value::list(vec![
                Value::Str("a".to_string()),
                Value::Str("b".to_string())
            ])
        );
        assert_eq!(
            call(
                "join",
                &[
                    Value::list(vec![Value::Int(1), Value::Int(2)]),
                    Value::Str("-".to_string())
                ]
            )
            .unwrap(),
            Value::Str("1-2".to_string())
        );
    }

    #[test]
    fn test_type_names() {
        assert_eq!(
            call("type", &[Value::Int(1)]).unwrap(),
            Value::Str("int".to_string())
        );
        assert_eq!(
            call("type", &[Value::None]).unwrap(),
            Value::Str("none".to_string())
        );
    }
}
