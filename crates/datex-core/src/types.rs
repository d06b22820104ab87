//! Type descriptors and casts
//!
//! Types are resolved once when a descriptor is built; the standard-type
//! tag is cached on the descriptor so casts dispatch on a closed enum.

use std::fmt;

use crate::{to_normal_form, DatexError, DatexResult, ErrorKind, FilterExpr, Object, Target, TraceHop, Tuple, Value};

/// Standard library types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StdType {
    Text,
    Int,
    Float,
    Bool,
    Null,
    Void,
    Buffer,
    Scope,
    Unit,
    Filter,
    Array,
    Object,
    Set,
    Map,
    Tuple,
    Record,
    Function,
    Stream,
    Any,
    Assertion,
    Task,
    Iterator,
    Type,
    Target,
    Error,
    Pointer,
}

const STD_TYPES: &[(StdType, &str)] = &[
    (StdType::Text, "String"),
    (StdType::Int, "Int"),
    (StdType::Float, "Float"),
    (StdType::Bool, "Boolean"),
    (StdType::Null, "Null"),
    (StdType::Void, "Void"),
    (StdType::Buffer, "Buffer"),
    (StdType::Scope, "Datex"),
    (StdType::Unit, "Unit"),
    (StdType::Filter, "Filter"),
    (StdType::Array, "Array"),
    (StdType::Object, "Object"),
    (StdType::Set, "Set"),
    (StdType::Map, "Map"),
    (StdType::Tuple, "Tuple"),
    (StdType::Record, "Record"),
    (StdType::Function, "Function"),
    (StdType::Stream, "Stream"),
    (StdType::Any, "Any"),
    (StdType::Assertion, "Assertion"),
    (StdType::Task, "Task"),
    (StdType::Iterator, "Iterator"),
    (StdType::Type, "Type"),
    (StdType::Target, "Target"),
    (StdType::Error, "Error"),
    (StdType::Pointer, "Pointer"),
];

impl StdType {
    pub fn from_name(name: &str) -> Option<Self> {
        STD_TYPES.iter().find(|(_, n)| *n == name).map(|(t, _)| *t)
    }

    pub fn name(self) -> &'static str {
        STD_TYPES
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, n)| *n)
            .unwrap_or("Any")
    }
}

/// Namespaced type descriptor
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatexType {
    pub namespace: String,
    pub name: String,
    std: Option<StdType>,
}

impl DatexType {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        let std = if namespace.is_empty() || namespace == "std" {
            StdType::from_name(&name)
        } else {
            None
        };
        DatexType {
            namespace,
            name,
            std,
        }
    }

    pub fn std(t: StdType) -> Self {
        DatexType {
            namespace: "std".into(),
            name: t.name().into(),
            std: Some(t),
        }
    }

    pub fn std_type(&self) -> Option<StdType> {
        self.std
    }

    /// Type of a value
    pub fn of(value: &Value) -> Self {
        DatexType::std(match value {
            Value::Void => StdType::Void,
            Value::Null => StdType::Null,
            Value::Bool(_) => StdType::Bool,
            Value::Int(_) => StdType::Int,
            Value::Float(_) => StdType::Float,
            Value::Text(_) => StdType::Text,
            Value::Buffer(_) => StdType::Buffer,
            Value::Unit(_) => StdType::Unit,
            Value::Type(_) => StdType::Type,
            Value::Target(_) => StdType::Target,
            Value::Filter(_) => StdType::Filter,
            Value::Array(_) => StdType::Array,
            Value::Object(_) => StdType::Object,
            Value::Tuple(_) => StdType::Tuple,
            Value::Pointer(_) => StdType::Pointer,
            Value::Function(_) => StdType::Function,
            Value::Iterator(_) => StdType::Iterator,
            Value::Error(_) => StdType::Error,
            Value::Wildcard => StdType::Any,
        })
    }

    /// Whether a value is an instance of this type
    pub fn matches(&self, value: &Value) -> bool {
        match self.std {
            Some(StdType::Any) => true,
            Some(t) => DatexType::of(value).std == Some(t),
            None => false,
        }
    }

    /// Apply this type as a cast
    pub fn cast(&self, value: Value) -> DatexResult<Value> {
        let Some(target) = self.std else {
            return Err(DatexError::Type(format!("cannot cast to unknown type {}", self)));
        };
        if self.matches(&value) {
            return Ok(value);
        }
        let fail = |v: &Value| DatexError::Type(format!("cannot cast {} to {}", DatexType::of(v), self));

        match (target, value) {
            (StdType::Any, v) => Ok(v),
            (StdType::Void, _) => Ok(Value::Void),
            (StdType::Null, _) => Ok(Value::Null),
            (StdType::Text, v) => Ok(Value::Text(match v {
                Value::Text(s) => s,
                other => other.to_string(),
            })),
            (StdType::Int, Value::Float(f)) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
            (StdType::Int, Value::Bool(b)) => Ok(Value::Int(b as i64)),
            (StdType::Int, Value::Unit(u)) if u.is_finite() => Ok(Value::Int(u.trunc() as i64)),
            (StdType::Int, Value::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| DatexError::Type(format!("cannot cast \"{}\" to {}", s, self))),
            (StdType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (StdType::Float, Value::Unit(u)) => Ok(Value::Float(u)),
            (StdType::Float, Value::Bool(b)) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
            (StdType::Float, Value::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| DatexError::Type(format!("cannot cast \"{}\" to {}", s, self))),
            (StdType::Unit, Value::Int(i)) => Ok(Value::Unit(i as f64)),
            (StdType::Unit, Value::Float(f)) => Ok(Value::Unit(f)),
            (StdType::Bool, v) => Ok(Value::Bool(v.is_truthy())),
            (StdType::Buffer, Value::Text(s)) => Ok(Value::Buffer(s.into_bytes())),
            (StdType::Array, Value::Tuple(t)) => Ok(Value::Array(t.into_values())),
            (StdType::Array, Value::Iterator(items)) => Ok(Value::Array(items)),
            (StdType::Array, Value::Void) => Ok(Value::Array(Vec::new())),
            (StdType::Object, Value::Tuple(t)) => {
                let mut obj = Object::new();
                for (i, (key, v)) in t.entries.into_iter().enumerate() {
                    obj.set(key.unwrap_or_else(|| i.to_string()), v);
                }
                Ok(Value::Object(obj))
            }
            (StdType::Object, Value::Void) => Ok(Value::Object(Object::new())),
            (StdType::Tuple, Value::Array(items)) => Ok(Value::Tuple(Tuple::from_values(items))),
            (StdType::Tuple, Value::Object(obj)) => {
                let mut t = Tuple::new();
                for (k, v) in obj.into_entries() {
                    t.push_named(k, v);
                }
                Ok(Value::Tuple(t))
            }
            (StdType::Tuple, Value::Void) => Ok(Value::Tuple(Tuple::new())),
            (StdType::Filter, Value::Target(t)) => Ok(Value::Filter(to_normal_form(&FilterExpr::Target(t)))),
            (StdType::Target, Value::Pointer(id)) => Ok(Value::Target(Target::Pointer(id))),
            (StdType::Target, Value::Text(s)) => Target::parse(&s).map(Value::Target),
            (StdType::Iterator, Value::Array(items)) => Ok(Value::Iterator(items)),
            (StdType::Type, v) => Ok(Value::Type(DatexType::of(&v))),
            (StdType::Error, Value::Text(s)) => Ok(Value::Error(DatexError::Runtime(s))),
            (StdType::Error, Value::Tuple(t)) => error_from_tuple(t).map(Value::Error),
            (_, v) => Err(fail(&v)),
        }
    }
}

/// `(kind, message, [(endpoint, location), ..])` as produced for error responses
fn error_from_tuple(t: Tuple) -> DatexResult<DatexError> {
    let invalid = || DatexError::Type("malformed error value".into());
    let mut values = t.into_values().into_iter();
    let kind = values
        .next()
        .and_then(|v| v.as_int())
        .and_then(|k| u8::try_from(k).ok())
        .and_then(ErrorKind::from_byte)
        .ok_or_else(invalid)?;
    let message = match values.next() {
        Some(Value::Text(m)) => m,
        _ => return Err(invalid()),
    };
    let mut error = DatexError::from_kind(kind, message);
    if let Some(Value::Array(hops)) = values.next() {
        for hop in hops {
            let Value::Tuple(hop) = hop else {
                return Err(invalid());
            };
            match (hop.get_index(0), hop.get_index(1)) {
                (Some(Value::Text(endpoint)), Some(Value::Text(location))) => {
                    error = error.with_hop(TraceHop {
                        endpoint: endpoint.clone(),
                        location: location.clone(),
                    });
                }
                _ => return Err(invalid()),
            }
        }
    }
    Ok(error)
}

impl fmt::Display for DatexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() || self.namespace == "std" {
            write!(f, "<{}>", self.name)
        } else {
            write!(f, "<{}:{}>", self.namespace, self.name)
        }
    }
}
