//! Value operators
//!
//! Operands arrive dereferenced except for identity comparison, which
//! compares pointer references as they are.

use std::cmp::Ordering;

use datex_core::{to_normal_form, Cnf, DatexError, DatexResult, DatexType, FilterExpr, Value};
use datex_wire::{ActionKind, Opcode};

/// Largest text a repetition may produce, in bytes
pub const MAX_REPEAT_LEN: usize = 1 << 24;
/// Most elements a range may produce
pub const MAX_RANGE_LEN: u64 = 1 << 20;

fn type_error(op: Opcode, left: &Value, right: &Value) -> DatexError {
    DatexError::Type(format!(
        "cannot apply {} to {} and {}",
        op,
        DatexType::of(left),
        DatexType::of(right)
    ))
}

fn as_filter(v: &Value) -> Option<Cnf> {
    match v {
        Value::Filter(cnf) => Some(cnf.clone()),
        Value::Target(t) => Some(to_normal_form(&FilterExpr::Target(t.clone()))),
        _ => None,
    }
}

fn numeric(op: Opcode, l: &Value, r: &Value) -> DatexResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let out = match op {
                Opcode::ADD => a.checked_add(*b),
                Opcode::SUBTRACT => a.checked_sub(*b),
                Opcode::MULTIPLY => a.checked_mul(*b),
                Opcode::DIVIDE => {
                    if *b == 0 {
                        return Err(DatexError::Value("division by zero".into()));
                    }
                    a.checked_div(*b)
                }
                _ => None,
            };
            out.map(Value::Int)
                .ok_or_else(|| DatexError::Value(format!("integer overflow in {} {} {}", a, op, b)))
        }
        (Value::Unit(a), Value::Unit(b)) => Ok(Value::Unit(float_op(op, *a, *b))),
        (Value::Unit(a), b) | (b, Value::Unit(a)) if matches!(op, Opcode::MULTIPLY) => {
            b.as_f64().map(|b| Value::Unit(a * b)).ok_or_else(|| type_error(op, l, r))
        }
        (Value::Unit(a), b) if matches!(op, Opcode::DIVIDE) => {
            b.as_f64().map(|b| Value::Unit(a / b)).ok_or_else(|| type_error(op, l, r))
        }
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) if !matches!(l, Value::Unit(_)) && !matches!(r, Value::Unit(_)) => {
                Ok(Value::Float(float_op(op, a, b)))
            }
            _ => Err(type_error(op, l, r)),
        },
    }
}

fn float_op(op: Opcode, a: f64, b: f64) -> f64 {
    match op {
        Opcode::ADD => a + b,
        Opcode::SUBTRACT => a - b,
        Opcode::MULTIPLY => a * b,
        _ => a / b,
    }
}

/// Ordering between comparable values
pub fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Buffer(a), Value::Buffer(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}

/// Value equality; numbers compare across int and float
pub fn value_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            compare(l, r) == Some(Ordering::Equal)
        }
        _ => l == r,
    }
}

/// Whether `container` has `item` as key, element or substring
pub fn has(container: &Value, item: &Value) -> DatexResult<bool> {
    Ok(match container {
        Value::Array(items) | Value::Iterator(items) => items.iter().any(|v| value_equal(v, item)),
        Value::Object(obj) => item.key_string().map_or(false, |k| obj.contains_key(&k)),
        Value::Tuple(t) => match item {
            Value::Text(k) => t.get_named(k).is_some(),
            Value::Int(i) => *i >= 0 && (*i as usize) < t.len(),
            _ => false,
        },
        Value::Text(s) => match item {
            Value::Text(sub) => s.contains(sub.as_str()),
            _ => false,
        },
        Value::Filter(_) | Value::Target(_) => match (as_filter(container), item) {
            (Some(cnf), Value::Target(t)) => cnf.test(std::slice::from_ref(t)),
            _ => false,
        },
        other => {
            return Err(DatexError::Type(format!("{} has no members", DatexType::of(other))));
        }
    })
}

/// Infix operator on dereferenced operands
pub fn binary(op: Opcode, l: &Value, r: &Value) -> DatexResult<Value> {
    match op {
        Opcode::ADD => match (l, r) {
            (Value::Text(a), b) => Ok(Value::Text(match b {
                Value::Text(b) => format!("{}{}", a, b),
                other => format!("{}{}", a, other),
            })),
            (a, Value::Text(b)) => Ok(Value::Text(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            (Value::Buffer(a), Value::Buffer(b)) => Ok(Value::Buffer(a.iter().chain(b).copied().collect())),
            _ => numeric(op, l, r),
        },
        Opcode::SUBTRACT | Opcode::DIVIDE => numeric(op, l, r),
        Opcode::MULTIPLY => match (l, r) {
            (Value::Text(s), Value::Int(n)) | (Value::Int(n), Value::Text(s)) => {
                if *n < 0 {
                    return Err(DatexError::Value(format!("cannot repeat text {} times", n)));
                }
                let len = usize::try_from(*n)
                    .ok()
                    .and_then(|n| s.len().checked_mul(n))
                    .filter(|len| *len <= MAX_REPEAT_LEN)
                    .ok_or_else(|| DatexError::Value(format!("repeating text {} times is too large", n)))?;
                if len == 0 {
                    return Ok(Value::text(""));
                }
                Ok(Value::Text(s.repeat(len / s.len())))
            }
            _ => numeric(op, l, r),
        },
        Opcode::AND | Opcode::OR => match (l, r) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == Opcode::AND { *a && *b } else { *a || *b })),
            _ => match (as_filter(l), as_filter(r)) {
                (Some(a), Some(b)) => Ok(Value::Filter(if op == Opcode::AND { a.and(&b) } else { a.or(&b) })),
                _ => Err(type_error(op, l, r)),
            },
        },
        Opcode::EQUAL | Opcode::EQUAL_VALUE => Ok(Value::Bool(value_equal(l, r))),
        Opcode::NOT_EQUAL | Opcode::NOT_EQUAL_VALUE => Ok(Value::Bool(!value_equal(l, r))),
        Opcode::GREATER | Opcode::LESS | Opcode::GREATER_EQUAL | Opcode::LESS_EQUAL => {
            let ord = compare(l, r).ok_or_else(|| type_error(op, l, r))?;
            Ok(Value::Bool(match op {
                Opcode::GREATER => ord == Ordering::Greater,
                Opcode::LESS => ord == Ordering::Less,
                Opcode::GREATER_EQUAL => ord != Ordering::Less,
                _ => ord != Ordering::Greater,
            }))
        }
        Opcode::RANGE => match (l.as_int(), r.as_int()) {
            (Some(a), Some(b)) => {
                let span = (b as i128 - a as i128).max(0);
                if span > MAX_RANGE_LEN as i128 {
                    return Err(DatexError::Value(format!("range {}..{} is too large", a, b)));
                }
                Ok(Value::Iterator((a..b).map(Value::Int).collect()))
            }
            _ => Err(type_error(op, l, r)),
        },
        Opcode::HAS => has(l, r).map(Value::Bool),
        Opcode::MATCHES => match r {
            Value::Type(t) => Ok(Value::Bool(t.matches(l))),
            _ => Err(type_error(op, l, r)),
        },
        other => Err(DatexError::Runtime(format!("{} is not a binary operator", other))),
    }
}

/// `!`, applied to booleans and filters
pub fn not(v: &Value) -> DatexResult<Value> {
    match v {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        Value::Filter(_) | Value::Target(_) => match as_filter(v) {
            Some(cnf) => Ok(Value::Filter(cnf.negate())),
            None => Ok(Value::Bool(!v.is_truthy())),
        },
        other => Ok(Value::Bool(!other.is_truthy())),
    }
}

pub fn count(v: &Value) -> DatexResult<Value> {
    v.count()
        .map(|n| Value::Int(n as i64))
        .ok_or_else(|| DatexError::Type(format!("cannot count {}", DatexType::of(v))))
}

pub fn keys(v: &Value) -> DatexResult<Value> {
    match v {
        Value::Array(_) | Value::Object(_) | Value::Tuple(_) => Ok(Value::Iterator(v.keys())),
        other => Err(DatexError::Type(format!("{} has no keys", DatexType::of(other)))),
    }
}

/// Compound assignment on a plain value
pub fn apply_action(action: ActionKind, current: Value, value: Value) -> DatexResult<Value> {
    match (action, current) {
        (ActionKind::Add, Value::Array(mut items)) => {
            match value {
                Value::Iterator(more) => items.extend(more),
                v => items.push(v),
            }
            Ok(Value::Array(items))
        }
        (ActionKind::Subtract, Value::Array(mut items)) => {
            items.retain(|v| !value_equal(v, &value));
            Ok(Value::Array(items))
        }
        (ActionKind::Add, Value::Void) => Ok(value),
        (ActionKind::CreatePointer, _) => Err(DatexError::Runtime("pointer creation is not a value operation".into())),
        (action, current) => binary(action.opcode(), &current, &value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::{Endpoint, Target};

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(binary(Opcode::ADD, &Value::Int(1), &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(binary(Opcode::DIVIDE, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(binary(Opcode::DIVIDE, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-3));
        assert!(matches!(
            binary(Opcode::DIVIDE, &Value::Int(1), &Value::Int(0)),
            Err(DatexError::Value(_))
        ));
        assert!(binary(Opcode::ADD, &Value::Int(i64::MAX), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_mixed_numbers() {
        assert_eq!(binary(Opcode::MULTIPLY, &Value::Int(2), &Value::Float(1.5)).unwrap(), Value::Float(3.0));
        assert_eq!(
            binary(Opcode::EQUAL_VALUE, &Value::Int(2), &Value::Float(2.0)).unwrap(),
            Value::Bool(true)
        );
        assert!(binary(Opcode::ADD, &Value::Unit(1.0), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_text_operators() {
        assert_eq!(
            binary(Opcode::ADD, &Value::text("a"), &Value::Int(1)).unwrap(),
            Value::text("a1")
        );
        assert_eq!(
            binary(Opcode::MULTIPLY, &Value::text("ab"), &Value::Int(2)).unwrap(),
            Value::text("abab")
        );
        assert_eq!(
            binary(Opcode::LESS, &Value::text("a"), &Value::text("b")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_range_and_has() {
        assert_eq!(
            binary(Opcode::RANGE, &Value::Int(1), &Value::Int(4)).unwrap(),
            Value::Iterator(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let arr = Value::Array(vec![Value::Int(1)]);
        assert_eq!(binary(Opcode::HAS, &arr, &Value::Float(1.0)).unwrap(), Value::Bool(true));
        assert_eq!(
            binary(Opcode::HAS, &Value::text("hello"), &Value::text("ell")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_oversized_results_rejected() {
        assert!(matches!(
            binary(Opcode::MULTIPLY, &Value::text("ab"), &Value::Int(i64::MAX)),
            Err(DatexError::Value(_))
        ));
        assert!(matches!(
            binary(Opcode::MULTIPLY, &Value::Int((MAX_REPEAT_LEN / 2 + 1) as i64), &Value::text("ab")),
            Err(DatexError::Value(_))
        ));
        assert!(matches!(
            binary(Opcode::RANGE, &Value::Int(0), &Value::Int(i64::MAX)),
            Err(DatexError::Value(_))
        ));
        assert!(matches!(
            binary(Opcode::RANGE, &Value::Int(i64::MIN), &Value::Int(i64::MAX)),
            Err(DatexError::Value(_))
        ));
        assert_eq!(
            binary(Opcode::MULTIPLY, &Value::text(""), &Value::Int(i64::MAX)).unwrap(),
            Value::text("")
        );
        assert_eq!(
            binary(Opcode::RANGE, &Value::Int(5), &Value::Int(1)).unwrap(),
            Value::Iterator(vec![])
        );
    }

    #[test]
    fn test_filter_operators() {
        let a = Value::Target(Target::Endpoint(Endpoint::person("a")));
        let c = Value::Target(Target::Endpoint(Endpoint::person("c")));
        let filter = binary(Opcode::AND, &a, &not(&c).unwrap()).unwrap();
        let Value::Filter(cnf) = &filter else {
            panic!("expected filter");
        };
        assert!(cnf.test(&[Target::Endpoint(Endpoint::person("a"))]));
        assert!(!cnf.test(&[
            Target::Endpoint(Endpoint::person("a")),
            Target::Endpoint(Endpoint::person("c"))
        ]));
    }

    #[test]
    fn test_actions() {
        let arr = apply_action(ActionKind::Add, Value::Array(vec![]), Value::Int(1)).unwrap();
        assert_eq!(arr, Value::Array(vec![Value::Int(1)]));
        let arr = apply_action(ActionKind::Subtract, arr, Value::Int(1)).unwrap();
        assert_eq!(arr, Value::Array(vec![]));
        assert_eq!(
            apply_action(ActionKind::Multiply, Value::Int(3), Value::Int(4)).unwrap(),
            Value::Int(12)
        );
    }
}
