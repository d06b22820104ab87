//! Value model
//!
//! A closed set of variants covering everything an opcode stream can
//! produce. Compound values own their children; shared mutable state is
//! expressed through `Value::Pointer` references into a registry.

use std::fmt;
use std::sync::Arc;

use crate::{Cnf, DatexError, DatexResult, DatexType, PointerId, Target};

/// Ordered string-keyed map
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Object {
    entries: Vec<(String, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Object::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace, keeping the original position of existing keys
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }
}

impl FromIterator<(String, Value)> for Object {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut obj = Object::new();
        for (k, v) in iter {
            obj.set(k, v);
        }
        obj
    }
}

/// Positional and named entries
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Tuple {
    pub entries: Vec<(Option<String>, Value)>,
}

impl Tuple {
    pub fn new() -> Self {
        Tuple::default()
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Tuple {
            entries: values.into_iter().map(|v| (None, v)).collect(),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.entries.push((None, value));
    }

    pub fn push_named(&mut self, key: String, value: Value) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.as_deref() == Some(key.as_str()))
        {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((Some(key), value)),
        }
    }

    pub fn get_named(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_deref() == Some(key))
            .map(|(_, v)| v)
    }

    /// Nth positional entry
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.entries
            .iter()
            .filter(|(k, _)| k.is_none())
            .nth(index)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.entries.into_iter().map(|(_, v)| v).collect()
    }
}

/// Kind of an embedded scope block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Plain scope value
    Scope,
    Function,
    /// Executed in place
    Do,
    Assert,
    /// Executed on the receivers on the left-hand side
    Remote,
    Iterator,
    Transform,
}

/// A serialized sub-program with its parameter names and captured variables
#[derive(Clone, Debug, PartialEq)]
pub struct Closure {
    pub kind: BlockKind,
    pub params: Vec<String>,
    pub captures: Vec<(String, Value)>,
    pub body: Arc<[u8]>,
}

/// Any value an opcode stream can produce
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Buffer(Vec<u8>),
    /// Quantity with an implicit base unit
    Unit(f64),
    Type(DatexType),
    Target(Target),
    Filter(Cnf),
    Array(Vec<Value>),
    Object(Object),
    Tuple(Tuple),
    Pointer(PointerId),
    Function(Arc<Closure>),
    Iterator(Vec<Value>),
    Error(DatexError),
    Wildcard,
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Primitive values are copied by value into primitive pointers
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Text(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Bool(_)
                | Value::Buffer(_)
                | Value::Unit(_)
                | Value::Null
                | Value::Void
        )
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_) | Value::Tuple(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null | Value::Void => false,
            Value::Int(i) => *i != 0,
            Value::Float(f) | Value::Unit(f) => *f != 0.0,
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) | Value::Unit(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<PointerId> {
        match self {
            Value::Pointer(id) => Some(*id),
            _ => None,
        }
    }

    /// Key as used for object/tuple lookup
    pub fn key_string(&self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    fn index(key: &Value) -> DatexResult<usize> {
        match key.as_int() {
            Some(i) if i >= 0 => Ok(i as usize),
            _ => Err(DatexError::Value(format!("invalid index {}", key))),
        }
    }

    /// Read a child property; missing properties read as void
    pub fn child(&self, key: &Value) -> DatexResult<Value> {
        match self {
            Value::Array(items) => Ok(items.get(Value::index(key)?).cloned().unwrap_or(Value::Void)),
            Value::Object(obj) => {
                let k = key
                    .key_string()
                    .ok_or_else(|| DatexError::Value(format!("invalid key {}", key)))?;
                Ok(obj.get(&k).cloned().unwrap_or(Value::Void))
            }
            Value::Tuple(t) => match key {
                Value::Int(i) if *i >= 0 => Ok(t.get_index(*i as usize).cloned().unwrap_or(Value::Void)),
                Value::Text(s) => Ok(t.get_named(s).cloned().unwrap_or(Value::Void)),
                _ => Err(DatexError::Value(format!("invalid key {}", key))),
            },
            Value::Text(s) => {
                let i = Value::index(key)?;
                Ok(s.chars().nth(i).map(|c| Value::Text(c.to_string())).unwrap_or(Value::Void))
            }
            Value::Buffer(b) => Ok(b.get(Value::index(key)?).map(|b| Value::Int(*b as i64)).unwrap_or(Value::Void)),
            other => Err(DatexError::Value(format!(
                "cannot read property {} of {}",
                key,
                DatexType::of(other)
            ))),
        }
    }

    /// Write a child property
    pub fn set_child(&mut self, key: &Value, value: Value) -> DatexResult<()> {
        match self {
            Value::Array(items) => {
                let i = Value::index(key)?;
                if i >= items.len() {
                    items.resize(i + 1, Value::Void);
                }
                items[i] = value;
                Ok(())
            }
            Value::Object(obj) => {
                let k = key
                    .key_string()
                    .ok_or_else(|| DatexError::Value(format!("invalid key {}", key)))?;
                obj.set(k, value);
                Ok(())
            }
            Value::Tuple(t) => match key {
                Value::Text(s) => {
                    t.push_named(s.clone(), value);
                    Ok(())
                }
                Value::Int(i) if *i >= 0 => {
                    let idx = *i as usize;
                    let slot = t
                        .entries
                        .iter_mut()
                        .filter(|(k, _)| k.is_none())
                        .nth(idx)
                        .ok_or_else(|| DatexError::Value(format!("tuple index {} out of range", idx)))?;
                    slot.1 = value;
                    Ok(())
                }
                _ => Err(DatexError::Value(format!("invalid key {}", key))),
            },
            other => Err(DatexError::Value(format!(
                "cannot set property {} on {}",
                key,
                DatexType::of(other)
            ))),
        }
    }

    /// Remove a child property, returning whether it existed
    pub fn delete_child(&mut self, key: &Value) -> DatexResult<bool> {
        match self {
            Value::Array(items) => {
                let i = Value::index(key)?;
                if i >= items.len() {
                    return Ok(false);
                }
                items[i] = Value::Void;
                trim_trailing_void(items);
                Ok(true)
            }
            Value::Object(obj) => {
                let k = key
                    .key_string()
                    .ok_or_else(|| DatexError::Value(format!("invalid key {}", key)))?;
                Ok(obj.remove(&k).is_some())
            }
            Value::Tuple(t) => {
                let k = key.key_string();
                let before = t.entries.len();
                t.entries.retain(|(name, _)| name.is_none() || name.as_ref() != k.as_ref());
                Ok(t.entries.len() != before)
            }
            other => Err(DatexError::Value(format!(
                "cannot delete property {} of {}",
                key,
                DatexType::of(other)
            ))),
        }
    }

    pub fn keys(&self) -> Vec<Value> {
        match self {
            Value::Array(items) => (0..items.len() as i64).map(Value::Int).collect(),
            Value::Object(obj) => obj.keys().map(Value::text).collect(),
            Value::Tuple(t) => {
                let mut pos = 0i64;
                t.entries
                    .iter()
                    .map(|(k, _)| match k {
                        Some(name) => Value::text(name.clone()),
                        None => {
                            pos += 1;
                            Value::Int(pos - 1)
                        }
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn clear(&mut self) -> DatexResult<()> {
        match self {
            Value::Array(items) => items.clear(),
            Value::Object(obj) => obj.clear(),
            Value::Tuple(t) => t.entries.clear(),
            other => {
                return Err(DatexError::Value(format!("cannot clear {}", DatexType::of(other))));
            }
        }
        Ok(())
    }

    /// Number of elements, characters or bytes
    pub fn count(&self) -> Option<usize> {
        match self {
            Value::Array(items) | Value::Iterator(items) => Some(items.len()),
            Value::Object(obj) => Some(obj.len()),
            Value::Tuple(t) => Some(t.len()),
            Value::Text(s) => Some(s.chars().count()),
            Value::Buffer(b) => Some(b.len()),
            Value::Void => Some(0),
            _ => None,
        }
    }
}

/// Trailing void elements are never kept in sequences
pub fn trim_trailing_void(items: &mut Vec<Value>) {
    while matches!(items.last(), Some(Value::Void)) {
        items.pop();
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &str) -> fmt::Result {
    let plain = !key.is_empty()
        && key.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !key.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        f.write_str(key)
    } else {
        write_escaped(f, key)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{:.1}", x)
                } else if x.is_nan() {
                    f.write_str("nan")
                } else if x.is_infinite() {
                    f.write_str(if *x > 0.0 { "infinity" } else { "-infinity" })
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Text(s) => write_escaped(f, s),
            Value::Buffer(b) => {
                f.write_str("`")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                f.write_str("`")
            }
            Value::Unit(u) => write!(f, "{}u", u),
            Value::Type(t) => write!(f, "{}", t),
            Value::Target(t) => write!(f, "{}", t),
            Value::Filter(c) => write!(f, "{}", c),
            Value::Array(items) | Value::Iterator(items) => {
                if matches!(self, Value::Iterator(_)) {
                    f.write_str("<Iterator>")?;
                }
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Value::Object(obj) => {
                f.write_str("{")?;
                for (i, (k, v)) in obj.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_key(f, k)?;
                    write!(f, ": {}", v)?;
                }
                f.write_str("}")
            }
            Value::Tuple(t) => {
                f.write_str("(")?;
                for (i, (k, v)) in t.entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some(k) = k {
                        write_key(f, k)?;
                        f.write_str(": ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str(")")
            }
            Value::Pointer(id) => write!(f, "{}", id),
            Value::Function(c) => write!(f, "function ({})", c.params.join(", ")),
            Value::Error(e) => write!(f, "<{}> {}", e.kind(), e.message()),
            Value::Wildcard => f.write_str("*"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(obj)
    }
}

impl From<PointerId> for Value {
    fn from(id: PointerId) -> Self {
        Value::Pointer(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(entries: &[(&str, Value)]) -> Object {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_object_keeps_insertion_order() {
        let mut o = obj(&[("b", Value::Int(1)), ("a", Value::Int(2))]);
        o.set("b", Value::Int(3));
        let keys: Vec<_> = o.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(o.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_array_children() {
        let mut v = Value::Array(vec![Value::Int(1)]);
        v.set_child(&Value::Int(3), Value::Int(4)).unwrap();
        assert_eq!(v.count(), Some(4));
        assert_eq!(v.child(&Value::Int(1)).unwrap(), Value::Void);

        // deleting the last element trims the trailing voids
        v.delete_child(&Value::Int(3)).unwrap();
        assert_eq!(v, Value::Array(vec![Value::Int(1)]));
    }

    #[test]
    fn test_object_children() {
        let mut v = Value::Object(Object::new());
        v.set_child(&Value::text("x"), Value::Bool(true)).unwrap();
        assert_eq!(v.child(&Value::text("x")).unwrap(), Value::Bool(true));
        assert_eq!(v.child(&Value::text("y")).unwrap(), Value::Void);
        assert!(v.delete_child(&Value::text("x")).unwrap());
        assert!(!v.delete_child(&Value::text("x")).unwrap());
    }

    #[test]
    fn test_tuple_positional_and_named() {
        let mut t = Tuple::from_values(vec![Value::Int(1)]);
        t.push_named("k".into(), Value::Int(2));
        t.push(Value::Int(3));
        let v = Value::Tuple(t);

        assert_eq!(v.child(&Value::Int(1)).unwrap(), Value::Int(3));
        assert_eq!(v.child(&Value::text("k")).unwrap(), Value::Int(2));
        assert_eq!(v.keys(), vec![Value::Int(0), Value::text("k"), Value::Int(1)]);
    }

    #[test]
    fn test_primitive_children_fail() {
        assert!(Value::Int(1).child(&Value::text("x")).is_err());
        assert!(Value::Null.clone().set_child(&Value::text("x"), Value::Void).is_err());
    }

    #[test]
    fn test_display_escapes() {
        assert_eq!(Value::text("a\"b\n").to_string(), "\"a\\\"b\\n\"");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        let o = obj(&[("a b", Value::Int(1)), ("c", Value::Array(vec![Value::Null]))]);
        assert_eq!(Value::Object(o).to_string(), "{\"a b\": 1, c: [null]}");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Void.is_truthy());
        assert!(Value::text("").is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
    }
}
