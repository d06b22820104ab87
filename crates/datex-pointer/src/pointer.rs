//! Pointer model
//!
//! A pointer is a globally addressable mutable reference. Its value slot is
//! filled once; afterwards compound values only change through the
//! container operations below, each of which yields a `PointerChange` the
//! registry propagates and reports to observers.

use std::collections::BTreeSet;
use std::sync::Arc;

use datex_core::{trim_trailing_void, Closure, DatexError, DatexResult, DatexType, Endpoint, PointerId, Timestamp, Value};

/// Property access on a pointer value
pub trait ObservableContainer {
    fn get(&self, key: &Value) -> DatexResult<Value>;
    fn set(&mut self, key: &Value, value: Value) -> DatexResult<()>;
    /// Returns whether the property existed
    fn delete(&mut self, key: &Value) -> DatexResult<bool>;
    fn keys(&self) -> Vec<Value>;
    fn clear(&mut self) -> DatexResult<()>;
}

/// One logical mutation of a pointer
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    /// Whole value assignment (primitive pointers only once initialized)
    Replace(Value),
    Set { key: Value, value: Value },
    Delete { key: Value },
    Add(Value),
    Remove(Value),
    Clear,
    Splice { start: usize, delete_count: usize, items: Vec<Value> },
}

impl ChangeKind {
    /// Property the change applies to, if any
    pub fn key(&self) -> Option<&Value> {
        match self {
            ChangeKind::Set { key, .. } | ChangeKind::Delete { key } => Some(key),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PointerChange {
    pub pointer: PointerId,
    pub kind: ChangeKind,
}

/// A distributed mutable reference
#[derive(Clone, Debug)]
pub struct Pointer {
    id: PointerId,
    origin: Endpoint,
    anonymous: bool,
    pub(crate) persistent: bool,
    pub(crate) sealed: bool,
    value: Option<Value>,
    pub(crate) subscribers: BTreeSet<Endpoint>,
    visible_children: Option<BTreeSet<String>>,
    sealed_properties: BTreeSet<String>,
    /// Keep every update when batching instead of only the latest per property
    pub intermediate_updates: bool,
    /// Route outbound updates through the scheduler
    pub batched: bool,
    pub(crate) local_holds: u32,
    pub(crate) gc_deadline: Option<Timestamp>,
    pub(crate) transform: Option<Arc<Closure>>,
    pub(crate) dependencies: Vec<PointerId>,
}

impl Pointer {
    pub(crate) fn new(id: PointerId, origin: Endpoint, anonymous: bool) -> Self {
        Pointer {
            id,
            origin,
            anonymous,
            persistent: false,
            sealed: false,
            value: None,
            subscribers: BTreeSet::new(),
            visible_children: None,
            sealed_properties: BTreeSet::new(),
            intermediate_updates: false,
            batched: false,
            local_holds: 0,
            gc_deadline: None,
            transform: None,
            dependencies: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> PointerId {
        self.id
    }

    pub fn origin(&self) -> &Endpoint {
        &self.origin
    }

    pub(crate) fn set_origin(&mut self, origin: Endpoint) {
        self.origin = origin;
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    /// Primitive pointers hold a copied value that may be replaced
    pub fn is_primitive(&self) -> bool {
        self.value.as_ref().map_or(false, Value::is_primitive)
    }

    /// Current value; void while uninitialized
    pub fn value(&self) -> Value {
        self.value.clone().unwrap_or_default()
    }

    pub fn value_ref(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Endpoint> {
        self.subscribers.iter()
    }

    pub fn has_subscriber(&self, endpoint: &Endpoint) -> bool {
        self.subscribers.contains(endpoint)
    }

    pub fn gc_deadline(&self) -> Option<Timestamp> {
        self.gc_deadline
    }

    pub fn transform(&self) -> Option<&Arc<Closure>> {
        self.transform.as_ref()
    }

    pub fn dependencies(&self) -> &[PointerId] {
        &self.dependencies
    }

    /// Restrict readable and writable properties to `keys`
    pub fn set_visible_children(&mut self, keys: impl IntoIterator<Item = String>) {
        self.visible_children = Some(keys.into_iter().collect());
    }

    pub fn seal_property(&mut self, key: impl Into<String>) {
        self.sealed_properties.insert(key.into());
    }

    /// Whether the registry may evict this pointer
    pub fn is_collectible(&self) -> bool {
        !self.persistent && self.subscribers.is_empty() && self.local_holds == 0
    }

    /// Assign the whole value
    pub(crate) fn assign(&mut self, value: Value) -> DatexResult<()> {
        if self.sealed {
            return Err(DatexError::Permission(format!("pointer {} is sealed", self.id)));
        }
        match &self.value {
            Some(current) if !current.is_primitive() => Err(DatexError::Pointer(format!(
                "pointer {} is already initialized",
                self.id
            ))),
            Some(_) if !value.is_primitive() => Err(DatexError::Pointer(format!(
                "cannot assign {} to primitive pointer {}",
                DatexType::of(&value),
                self.id
            ))),
            _ => {
                self.value = Some(value);
                Ok(())
            }
        }
    }

    /// Replace the value of a transform pointer after recomputation
    pub(crate) fn recompute(&mut self, value: Value) {
        self.value = Some(value);
    }

    fn check_key(&self, key: &Value, write: bool) -> DatexResult<()> {
        let name = key.key_string();
        if let (Some(visible), Some(name)) = (&self.visible_children, &name) {
            if !visible.contains(name) {
                return Err(DatexError::Value(format!("property {} does not exist on {}", name, self.id)));
            }
        }
        if write {
            if self.sealed {
                return Err(DatexError::Permission(format!("pointer {} is sealed", self.id)));
            }
            if name.map_or(false, |n| self.sealed_properties.contains(&n)) {
                return Err(DatexError::Permission(format!("property {} of {} is sealed", key, self.id)));
            }
        }
        Ok(())
    }

    fn container_mut(&mut self) -> DatexResult<&mut Value> {
        if self.sealed {
            return Err(DatexError::Permission(format!("pointer {} is sealed", self.id)));
        }
        let id = self.id;
        self.value
            .as_mut()
            .ok_or_else(|| DatexError::Pointer(format!("pointer {} has no value", id)))
    }

    pub(crate) fn add(&mut self, value: Value) -> DatexResult<()> {
        match self.container_mut()? {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            Value::Tuple(t) => {
                t.push(value);
                Ok(())
            }
            other => Err(DatexError::Value(format!("cannot add to {}", DatexType::of(other)))),
        }
    }

    pub(crate) fn remove(&mut self, value: &Value) -> DatexResult<()> {
        match self.container_mut()? {
            Value::Array(items) => {
                items.retain(|v| v != value);
                Ok(())
            }
            Value::Object(obj) => {
                if let Some(key) = value.key_string() {
                    obj.remove(&key);
                }
                Ok(())
            }
            other => Err(DatexError::Value(format!("cannot remove from {}", DatexType::of(other)))),
        }
    }

    pub(crate) fn splice(&mut self, start: usize, delete_count: usize, items: Vec<Value>) -> DatexResult<Vec<Value>> {
        match self.container_mut()? {
            Value::Array(array) => {
                let start = start.min(array.len());
                let end = start.saturating_add(delete_count).min(array.len());
                let removed = array.splice(start..end, items).collect();
                trim_trailing_void(array);
                Ok(removed)
            }
            other => Err(DatexError::Value(format!("cannot splice {}", DatexType::of(other)))),
        }
    }
}

impl ObservableContainer for Pointer {
    fn get(&self, key: &Value) -> DatexResult<Value> {
        self.check_key(key, false)?;
        match &self.value {
            Some(v) => v.child(key),
            None => Ok(Value::Void),
        }
    }

    fn set(&mut self, key: &Value, value: Value) -> DatexResult<()> {
        self.check_key(key, true)?;
        if value.is_void() {
            return self.delete(key).map(|_| ());
        }
        self.container_mut()?.set_child(key, value)
    }

    fn delete(&mut self, key: &Value) -> DatexResult<bool> {
        self.check_key(key, true)?;
        self.container_mut()?.delete_child(key)
    }

    fn keys(&self) -> Vec<Value> {
        let keys = self.value.as_ref().map(Value::keys).unwrap_or_default();
        match &self.visible_children {
            Some(visible) => keys
                .into_iter()
                .filter(|k| k.key_string().map_or(false, |n| visible.contains(&n)))
                .collect(),
            None => keys,
        }
    }

    fn clear(&mut self) -> DatexResult<()> {
        self.container_mut()?.clear()
    }
}
