//! Pointer registry
//!
//! Pointers live in an arena addressed by (slot, generation) handles; an id
//! index maps pointer ids to handles. A freed slot bumps its generation so
//! stale handles never resolve to a later occupant.
//!
//! Every mutation runs through `mutate`, which validates and applies the
//! change, forwards it upstream to the origin or downstream to subscribers
//! (minus whatever the current update exclusion filters out), marks
//! dependent transforms dirty and finally notifies observers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use datex_core::{
    Closure, Cnf, DatexError, DatexResult, Endpoint, EndpointId, Literal, PointerId, Target, Timestamp, Value,
};

use crate::{
    compile_change, ChangeKind, ObservableContainer, Pointer, PointerChange, PointerSources, SchedulerConfig,
    UpdateScheduler,
};

/// Registry configuration
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Delay between becoming collectible and eviction
    pub gc_timeout: Duration,
    pub sweep_interval: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            gc_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Generation-checked arena handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PointerHandle {
    slot: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    pointer: Option<Pointer>,
}

/// Options for `PointerRegistry::create`
#[derive(Clone, Debug, Default)]
pub struct PointerOptions {
    pub id: Option<PointerId>,
    pub origin: Option<Endpoint>,
    pub sealed: bool,
    pub persistent: bool,
    pub anonymous: bool,
}

/// Compiled update program and its receivers
#[derive(Clone, Debug)]
pub struct OutboundUpdate {
    pub receivers: Vec<Endpoint>,
    pub program: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

type ChangeCallback = Box<dyn FnMut(&PointerChange) + Send>;
type DeleteCallback = Box<dyn FnMut(PointerId) + Send>;

struct Observer {
    handle: ObserverHandle,
    /// None observes every pointer
    pointer: Option<PointerId>,
    key: Option<Value>,
    callback: ChangeCallback,
}

impl Observer {
    fn wants(&self, change: &PointerChange) -> bool {
        if self.pointer.map_or(false, |p| p != change.pointer) {
            return false;
        }
        match (&self.key, change.kind.key()) {
            (None, _) => true,
            (Some(k), Some(changed)) => k == changed,
            (Some(_), None) => matches!(change.kind, ChangeKind::Clear | ChangeKind::Replace(_)),
        }
    }
}

/// Local table of all known pointers
pub struct PointerRegistry {
    local: Endpoint,
    config: RegistryConfig,
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<PointerId, PointerHandle>,
    labels: HashMap<String, PointerId>,
    endpoints: HashMap<EndpointId, Endpoint>,
    instance: [u8; 8],
    counter: u8,
    now: Timestamp,
    update_filter: Option<Cnf>,
    outbox: Vec<(Vec<Endpoint>, PointerChange)>,
    scheduler: UpdateScheduler,
    observers: Vec<Observer>,
    delete_listeners: Vec<(ObserverHandle, DeleteCallback)>,
    next_observer: u64,
    loading: HashSet<PointerId>,
    dependents: HashMap<PointerId, Vec<PointerId>>,
    dirty: Vec<PointerId>,
    sources: PointerSources,
}

impl PointerRegistry {
    pub fn new(local: Endpoint, config: RegistryConfig) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(local.id(), local.main());
        PointerRegistry {
            scheduler: UpdateScheduler::new(config.scheduler.clone()),
            local,
            config,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            labels: HashMap::new(),
            endpoints,
            instance: rand::random(),
            counter: 0,
            now: Timestamp::ZERO,
            update_filter: None,
            outbox: Vec::new(),
            observers: Vec::new(),
            delete_listeners: Vec::new(),
            next_observer: 0,
            loading: HashSet::new(),
            dependents: HashMap::new(),
            dirty: Vec::new(),
            sources: PointerSources::new(),
        }
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Advance the registry clock used for GC deadlines
    pub fn set_now(&mut self, now: Timestamp) {
        self.now = now;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn sources(&self) -> &PointerSources {
        &self.sources
    }

    pub fn set_sources(&mut self, sources: PointerSources) {
        self.sources = sources;
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut UpdateScheduler {
        &mut self.scheduler
    }

    /// Remember an endpoint so ids minted by it resolve to their origin
    pub fn register_endpoint(&mut self, endpoint: &Endpoint) {
        self.endpoints.insert(endpoint.id(), endpoint.main());
    }

    /// Origin endpoint encoded in a pointer id, if known
    pub fn origin_of(&self, id: &PointerId) -> Option<Endpoint> {
        if let Some(p) = self.get(*id) {
            return Some(p.origin().clone());
        }
        id.endpoint().and_then(|e| self.endpoints.get(&e).cloned())
    }

    pub fn is_local_origin(&self, pointer: &Pointer) -> bool {
        pointer.origin().main() == self.local.main()
    }

    // ---- arena ----

    pub fn handle(&self, id: PointerId) -> Option<PointerHandle> {
        self.index.get(&id).copied()
    }

    pub fn resolve(&self, handle: PointerHandle) -> Option<&Pointer> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.pointer.as_ref())
    }

    fn resolve_mut(&mut self, handle: PointerHandle) -> Option<&mut Pointer> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.pointer.as_mut())
    }

    pub fn get(&self, id: PointerId) -> Option<&Pointer> {
        self.handle(id).and_then(|h| self.resolve(h))
    }

    pub fn get_mut(&mut self, id: PointerId) -> Option<&mut Pointer> {
        self.handle(id).and_then(|h| self.resolve_mut(h))
    }

    fn require_mut(&mut self, id: PointerId) -> DatexResult<&mut Pointer> {
        self.get_mut(id)
            .ok_or_else(|| DatexError::Pointer(format!("pointer {} does not exist", id)))
    }

    pub fn contains(&self, id: PointerId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = PointerId> + '_ {
        self.index.keys().copied()
    }

    /// Current value of a pointer
    pub fn value(&self, id: PointerId) -> Option<Value> {
        self.get(id).map(Pointer::value)
    }

    /// Follow a pointer reference one level; other values pass through
    pub fn deref(&self, value: &Value) -> Value {
        match value {
            Value::Pointer(id) => self.value(*id).unwrap_or_default(),
            other => other.clone(),
        }
    }

    fn insert(&mut self, pointer: Pointer) -> PointerHandle {
        let id = pointer.id();
        let handle = match self.free.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot as usize];
                s.pointer = Some(pointer);
                PointerHandle {
                    slot,
                    generation: s.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    pointer: Some(pointer),
                });
                PointerHandle {
                    slot: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.index.insert(id, handle);
        handle
    }

    /// Fresh id owned by the local endpoint
    pub fn generate_id(&mut self) -> PointerId {
        loop {
            let id = PointerId::new_default(self.local.id(), self.instance, self.now.as_secs(), self.counter);
            self.counter = self.counter.wrapping_add(1);
            if self.counter == 0 {
                self.instance = rand::random();
            }
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    // ---- lifecycle ----

    /// Create a pointer, or return the existing one for a pointer-backed value
    pub fn create(&mut self, value: Value, options: PointerOptions) -> DatexResult<PointerHandle> {
        if let (Value::Pointer(existing), None) = (&value, options.id) {
            if let Some(handle) = self.handle(*existing) {
                return Ok(handle);
            }
        }

        if let Some(id) = options.id {
            if let Some(handle) = self.handle(id) {
                let pointer = self.require_mut(id)?;
                if pointer.is_initialized() && !pointer.is_primitive() {
                    return Err(DatexError::Pointer(format!("pointer {} is already allocated", id)));
                }
                pointer.assign(value)?;
                pointer.persistent |= options.persistent;
                pointer.sealed |= options.sealed;
                self.refresh_gc(handle);
                return Ok(handle);
            }
        }

        let id = match options.id {
            Some(id) => id,
            None => self.generate_id(),
        };
        let origin = options.origin.unwrap_or_else(|| self.local.main());
        let mut pointer = Pointer::new(id, origin, options.anonymous);
        pointer.assign(value)?;
        pointer.persistent = options.persistent;
        pointer.sealed = options.sealed;

        let handle = self.insert(pointer);
        self.refresh_gc(handle);
        tracing::debug!(pointer = %id, "created pointer");
        Ok(handle)
    }

    pub fn create_or_get(&mut self, value: Value) -> DatexResult<PointerHandle> {
        self.create(value, PointerOptions::default())
    }

    /// Id of the pointer holding `value`, created if needed
    pub fn pointer_for(&mut self, value: Value) -> DatexResult<PointerId> {
        let handle = self.create_or_get(value)?;
        self.resolve(handle)
            .map(Pointer::id)
            .ok_or_else(|| DatexError::Pointer("pointer vanished after creation".into()))
    }

    /// Uninitialized pointer awaiting its value from the origin
    pub fn create_placeholder(&mut self, id: PointerId, origin: Endpoint) -> PointerHandle {
        if let Some(handle) = self.handle(id) {
            return handle;
        }
        let handle = self.insert(Pointer::new(id, origin, false));
        self.refresh_gc(handle);
        handle
    }

    /// Remove a pointer immediately
    pub fn delete(&mut self, id: PointerId) -> DatexResult<()> {
        let handle = self
            .index
            .remove(&id)
            .ok_or_else(|| DatexError::Pointer(format!("pointer {} does not exist", id)))?;
        let slot = &mut self.slots[handle.slot as usize];
        slot.pointer = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);

        self.labels.retain(|_, p| *p != id);
        self.dependents.remove(&id);
        self.loading.remove(&id);
        for (_, callback) in self.delete_listeners.iter_mut() {
            callback(id);
        }
        tracing::debug!(pointer = %id, "deleted pointer");
        Ok(())
    }

    /// Local lookup, falling back to registered sources
    pub fn load_local(&mut self, id: PointerId) -> DatexResult<Option<PointerHandle>> {
        if let Some(handle) = self.handle(id) {
            // a placeholder still waiting for its value is not available yet
            if self.resolve(handle).map_or(false, Pointer::is_initialized) {
                return Ok(Some(handle));
            }
        }
        let Some(value) = self.sources.fetch(&id) else {
            return Ok(None);
        };
        let origin = self.origin_of(&id);
        let handle = self.create(
            value,
            PointerOptions {
                id: Some(id),
                origin,
                ..Default::default()
            },
        )?;
        Ok(Some(handle))
    }

    /// Guard against a pointer load re-entering itself
    pub fn begin_load(&mut self, id: PointerId) -> DatexResult<()> {
        if !self.loading.insert(id) {
            return Err(DatexError::Pointer(format!("recursive load of pointer {}", id)));
        }
        Ok(())
    }

    pub fn end_load(&mut self, id: PointerId) {
        self.loading.remove(&id);
    }

    pub fn is_loading(&self, id: PointerId) -> bool {
        self.loading.contains(&id)
    }

    /// Origin moved (answer of an `origin ?` query)
    pub fn set_origin(&mut self, id: PointerId, origin: Endpoint) -> DatexResult<()> {
        self.require_mut(id)?.set_origin(origin);
        Ok(())
    }

    // ---- labels ----

    pub fn add_label(&mut self, id: PointerId, name: impl Into<String>) -> DatexResult<()> {
        let name = name.into();
        if let Some(existing) = self.labels.get(&name) {
            if *existing != id {
                return Err(DatexError::Pointer(format!("label {} is already taken", name)));
            }
        }
        self.set_persistent(id, true)?;
        self.labels.insert(name, id);
        Ok(())
    }

    pub fn resolve_label(&self, name: &str) -> Option<PointerId> {
        self.labels.get(name).copied()
    }

    pub fn remove_label(&mut self, name: &str) -> Option<PointerId> {
        self.labels.remove(name)
    }

    // ---- collection ----

    fn refresh_gc(&mut self, handle: PointerHandle) {
        let deadline = self.now.as_millis() + self.config.gc_timeout.as_millis() as u64;
        if let Some(pointer) = self.resolve_mut(handle) {
            if pointer.is_collectible() {
                if pointer.gc_deadline.is_none() {
                    pointer.gc_deadline = Some(Timestamp::from_millis(deadline));
                }
            } else {
                pointer.gc_deadline = None;
            }
        }
    }

    fn refresh_gc_id(&mut self, id: PointerId) {
        if let Some(handle) = self.handle(id) {
            self.refresh_gc(handle);
        }
    }

    pub fn set_persistent(&mut self, id: PointerId, persistent: bool) -> DatexResult<()> {
        self.require_mut(id)?.persistent = persistent;
        self.refresh_gc_id(id);
        Ok(())
    }

    /// Hold a pointer strongly on behalf of local code
    pub fn retain(&mut self, id: PointerId) -> DatexResult<()> {
        self.require_mut(id)?.local_holds += 1;
        self.refresh_gc_id(id);
        Ok(())
    }

    pub fn release(&mut self, id: PointerId) -> DatexResult<()> {
        let pointer = self.require_mut(id)?;
        pointer.local_holds = pointer.local_holds.saturating_sub(1);
        self.refresh_gc_id(id);
        Ok(())
    }

    pub fn add_subscriber(&mut self, id: PointerId, endpoint: Endpoint) -> DatexResult<()> {
        tracing::debug!(pointer = %id, subscriber = %endpoint, "subscriber added");
        self.require_mut(id)?.subscribers.insert(endpoint);
        self.refresh_gc_id(id);
        Ok(())
    }

    pub fn remove_subscriber(&mut self, id: PointerId, endpoint: &Endpoint) -> DatexResult<bool> {
        let removed = self.require_mut(id)?.subscribers.remove(endpoint);
        self.refresh_gc_id(id);
        Ok(removed)
    }

    /// Evict collectible pointers whose deadline passed
    pub fn sweep(&mut self, now: Timestamp) -> Vec<PointerId> {
        self.now = now;
        let expired: Vec<PointerId> = self
            .slots
            .iter()
            .filter_map(|s| s.pointer.as_ref())
            .filter(|p| p.is_collectible() && p.gc_deadline.map_or(false, |d| d <= now))
            .map(Pointer::id)
            .collect();
        for id in &expired {
            tracing::debug!(pointer = %id, "collecting pointer");
            // ids come from the arena scan above
            let _ = self.delete(*id);
        }
        expired
    }

    // ---- update exclusion ----

    /// Do not propagate the following mutations back to `endpoint`
    pub fn exclude_endpoint_from_updates(&mut self, endpoint: &Endpoint) {
        self.update_filter = Some(Cnf::literal(Literal::negative(Target::Endpoint(endpoint.main()))));
    }

    pub fn enable_updates_for_all(&mut self) {
        self.update_filter = None;
    }

    pub fn with_update_exclusion<R>(&mut self, endpoint: &Endpoint, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.update_filter.take();
        self.exclude_endpoint_from_updates(endpoint);
        let out = f(self);
        self.update_filter = previous;
        out
    }

    // ---- mutation ----

    pub fn set_value(&mut self, id: PointerId, value: Value) -> DatexResult<()> {
        self.mutate(id, ChangeKind::Replace(value))
    }

    pub fn set_property(&mut self, id: PointerId, key: Value, value: Value) -> DatexResult<()> {
        if value.is_void() {
            return self.mutate(id, ChangeKind::Delete { key });
        }
        self.mutate(id, ChangeKind::Set { key, value })
    }

    pub fn delete_property(&mut self, id: PointerId, key: Value) -> DatexResult<()> {
        self.mutate(id, ChangeKind::Delete { key })
    }

    pub fn add(&mut self, id: PointerId, value: Value) -> DatexResult<()> {
        self.mutate(id, ChangeKind::Add(value))
    }

    pub fn remove(&mut self, id: PointerId, value: Value) -> DatexResult<()> {
        self.mutate(id, ChangeKind::Remove(value))
    }

    pub fn clear(&mut self, id: PointerId) -> DatexResult<()> {
        self.mutate(id, ChangeKind::Clear)
    }

    pub fn splice(&mut self, id: PointerId, start: usize, delete_count: usize, items: Vec<Value>) -> DatexResult<()> {
        self.mutate(
            id,
            ChangeKind::Splice {
                start,
                delete_count,
                items,
            },
        )
    }

    pub fn seal(&mut self, id: PointerId) -> DatexResult<()> {
        self.require_mut(id)?.sealed = true;
        Ok(())
    }

    /// Validate, apply, propagate and report one change
    pub fn mutate(&mut self, id: PointerId, kind: ChangeKind) -> DatexResult<()> {
        let pointer = self.require_mut(id)?;
        match &kind {
            ChangeKind::Replace(value) => pointer.assign(value.clone())?,
            ChangeKind::Set { key, value } => pointer.set(key, value.clone())?,
            ChangeKind::Delete { key } => {
                pointer.delete(key)?;
            }
            ChangeKind::Add(value) => pointer.add(value.clone())?,
            ChangeKind::Remove(value) => pointer.remove(value)?,
            ChangeKind::Clear => pointer.clear()?,
            ChangeKind::Splice {
                start,
                delete_count,
                items,
            } => {
                pointer.splice(*start, *delete_count, items.clone())?;
            }
        }

        let change = PointerChange { pointer: id, kind };
        self.propagate(&change);
        self.mark_dependents(id);
        self.notify(&change);
        Ok(())
    }

    fn propagate(&mut self, change: &PointerChange) {
        let Some(pointer) = self.get(change.pointer) else {
            return;
        };
        let mut receivers: Vec<Endpoint> = if self.is_local_origin(pointer) {
            pointer.subscribers().cloned().collect()
        } else {
            vec![pointer.origin().clone()]
        };
        let local = self.local.main();
        receivers.retain(|e| {
            e.main() != local
                && self
                    .update_filter
                    .as_ref()
                    .map_or(true, |f| f.test(&[Target::Endpoint(e.clone())]))
        });
        if receivers.is_empty() {
            return;
        }

        let (batched, intermediate) = (pointer.batched, pointer.intermediate_updates);
        tracing::trace!(pointer = %change.pointer, receivers = receivers.len(), "propagating update");
        if batched {
            for receiver in receivers {
                self.scheduler.enqueue(receiver, change.clone(), intermediate);
            }
        } else {
            self.outbox.push((receivers, change.clone()));
        }
    }

    /// Compiled updates ready to send, including due scheduler batches
    pub fn take_outbound(&mut self, now: Timestamp) -> DatexResult<Vec<OutboundUpdate>> {
        let mut out = Vec::with_capacity(self.outbox.len());
        for (receivers, change) in std::mem::take(&mut self.outbox) {
            out.push(OutboundUpdate {
                receivers,
                program: compile_change(&change)?,
            });
        }
        for batch in self.scheduler.trigger(now)? {
            out.push(OutboundUpdate {
                receivers: vec![batch.receiver],
                program: batch.program,
            });
        }
        Ok(out)
    }

    // ---- transforms ----

    /// Attach the closure recomputing a pointer when `dependencies` change
    pub fn set_transform(&mut self, id: PointerId, closure: Arc<Closure>, dependencies: Vec<PointerId>) -> DatexResult<()> {
        let pointer = self.require_mut(id)?;
        pointer.transform = Some(closure);
        pointer.dependencies = dependencies.clone();
        for dep in dependencies {
            let list = self.dependents.entry(dep).or_default();
            if !list.contains(&id) {
                list.push(id);
            }
        }
        Ok(())
    }

    fn mark_dependents(&mut self, id: PointerId) {
        if let Some(list) = self.dependents.get(&id) {
            for dependent in list {
                if !self.dirty.contains(dependent) {
                    self.dirty.push(*dependent);
                }
            }
        }
    }

    /// Transforms whose inputs changed since the last call
    pub fn take_dirty_transforms(&mut self) -> Vec<PointerId> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty.into_iter().filter(|id| self.contains(*id)).collect()
    }

    /// Store a recomputed transform value
    pub fn recompute(&mut self, id: PointerId, value: Value) -> DatexResult<()> {
        let pointer = self.require_mut(id)?;
        let primitive = value.is_primitive();
        pointer.recompute(value.clone());
        let change = PointerChange {
            pointer: id,
            kind: ChangeKind::Replace(value),
        };
        // compound replicas cannot take a whole-value replacement
        if primitive {
            self.propagate(&change);
        }
        self.mark_dependents(id);
        self.notify(&change);
        Ok(())
    }

    // ---- observers ----

    fn next_handle(&mut self) -> ObserverHandle {
        self.next_observer += 1;
        ObserverHandle(self.next_observer)
    }

    /// Observe one pointer, optionally a single property
    pub fn observe(
        &mut self,
        id: PointerId,
        key: Option<Value>,
        callback: impl FnMut(&PointerChange) + Send + 'static,
    ) -> DatexResult<ObserverHandle> {
        if !self.contains(id) {
            return Err(DatexError::Pointer(format!("pointer {} does not exist", id)));
        }
        let handle = self.next_handle();
        self.observers.push(Observer {
            handle,
            pointer: Some(id),
            key,
            callback: Box::new(callback),
        });
        Ok(handle)
    }

    /// Observe changes of all pointers
    pub fn observe_all(&mut self, callback: impl FnMut(&PointerChange) + Send + 'static) -> ObserverHandle {
        let handle = self.next_handle();
        self.observers.push(Observer {
            handle,
            pointer: None,
            key: None,
            callback: Box::new(callback),
        });
        handle
    }

    pub fn on_delete(&mut self, callback: impl FnMut(PointerId) + Send + 'static) -> ObserverHandle {
        let handle = self.next_handle();
        self.delete_listeners.push((handle, Box::new(callback)));
        handle
    }

    pub fn unobserve(&mut self, handle: ObserverHandle) -> bool {
        let before = self.observers.len() + self.delete_listeners.len();
        self.observers.retain(|o| o.handle != handle);
        self.delete_listeners.retain(|(h, _)| *h != handle);
        before != self.observers.len() + self.delete_listeners.len()
    }

    fn notify(&mut self, change: &PointerChange) {
        for observer in self.observers.iter_mut().filter(|o| o.wants(change)) {
            (observer.callback)(change);
        }
    }
}

impl std::fmt::Debug for PointerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerRegistry")
            .field("local", &self.local)
            .field("pointers", &self.index.len())
            .field("labels", &self.labels.len())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}
