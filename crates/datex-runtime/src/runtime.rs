//! DATEX Runtime - endpoint orchestration
//!
//! Every inbound block passes the same stages:
//! 1. Parse the header
//! 2. Relay floods, redirect blocks addressed elsewhere
//! 3. Verify and decrypt
//! 4. Reassemble the scope in increment order
//! 5. Execute, suspending on pointer loads and remote calls
//! 6. Respond, or settle the matching outbound request
//!
//! Outbound blocks leave through a single send hook. Until one is
//! installed they are buffered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use datex_core::{
    BlockKind, Closure, Cnf, DatexError, DatexResult, Endpoint, PointerId, SessionId, Target, Timestamp, TraceHop,
    Value,
};
use datex_crypto::{BlockSecurity, Identity, KeyStore, OpenError, PublicIdentity};
use datex_pointer::{OutboundUpdate, PointerOptions, PointerRegistry};
use datex_vm::{decode_detached, update_transforms, ScopeContext, Step, Suspension};
use datex_wire::{
    encode_value, patch_ttl, split_scope, BlockOptions, Header, InstructionBuilder, MessageKind, Opcode, Receivers,
    MAX_BLOCK_SIZE,
};

use crate::{Accepted, ActiveScope, Reply, RuntimeConfig, RuntimeStats, ScopeKey};

/// Floods and finished scopes remembered to avoid processing them twice
const RECENT_KEYS: usize = 1024;

/// A serialized block handed to the transport
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundBlock {
    pub bytes: Vec<u8>,
    /// Endpoints named by the receiver filter; empty for floods
    pub receivers: Vec<Endpoint>,
    /// Never deliver back to this endpoint
    pub except: Option<Endpoint>,
}

impl OutboundBlock {
    pub fn is_flood(&self) -> bool {
        self.receivers.is_empty()
    }
}

/// The transport seam. Must not call back into the runtime synchronously.
pub type SendHook = Box<dyn FnMut(OutboundBlock) + Send>;

/// Receives the answer to a request together with the header it came in.
/// Runs once the runtime's lock is released, so it may call back into it.
pub type DetailedCallback = Box<dyn FnOnce(DatexResult<Value>, Option<&Header>) + Send>;

/// Where a resolved suspension goes
#[derive(Debug)]
enum Resumer {
    Scope(ScopeKey),
    Channel(oneshot::Sender<DatexResult<Value>>),
}

enum Continuation {
    Resume(Resumer),
    Detailed(DetailedCallback),
    Subscribe {
        pointer: PointerId,
        endpoint: Endpoint,
        retried: bool,
        then: Resumer,
    },
    Origin {
        pointer: PointerId,
        endpoint: Endpoint,
        then: Resumer,
    },
}

struct PendingRequest {
    deadline: Timestamp,
    continuation: Continuation,
}

/// Bounded memory of recently seen keys
struct Recent<K> {
    seen: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash> Recent<K> {
    fn new() -> Self {
        Recent {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Whether the key was new
    fn insert(&mut self, key: K) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > RECENT_KEYS {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

struct State {
    local: Endpoint,
    config: RuntimeConfig,
    security: BlockSecurity,
    registry: PointerRegistry,
    scopes: HashMap<ScopeKey, ActiveScope>,
    requests: HashMap<SessionId, PendingRequest>,
    /// Readers of a pointer whose subscription is already in flight
    load_waiters: HashMap<PointerId, Vec<Resumer>>,
    ready: VecDeque<(ScopeKey, DatexResult<Value>)>,
    /// Settled callbacks, run after the lock is released
    answered: Vec<(DetailedCallback, DatexResult<Value>, Option<Header>)>,
    outbound: VecDeque<OutboundBlock>,
    floods: Recent<(Option<Endpoint>, SessionId, u16)>,
    finished: Recent<ScopeKey>,
    stats: RuntimeStats,
    last_sid: SessionId,
    now: Timestamp,
}

/// One DATEX endpoint
pub struct Runtime {
    state: Mutex<State>,
    hook: Mutex<Option<SendHook>>,
}

impl Runtime {
    pub fn new(endpoint: Endpoint, identity: Identity, config: RuntimeConfig) -> Self {
        let now = Timestamp::now();
        let keys = Arc::new(KeyStore::new(identity));
        let mut registry = PointerRegistry::new(endpoint.clone(), config.registry.clone());
        registry.set_now(now);
        Runtime {
            state: Mutex::new(State {
                security: BlockSecurity::new(endpoint.clone(), keys),
                local: endpoint,
                config,
                registry,
                scopes: HashMap::new(),
                requests: HashMap::new(),
                load_waiters: HashMap::new(),
                answered: Vec::new(),
                ready: VecDeque::new(),
                outbound: VecDeque::new(),
                floods: Recent::new(),
                finished: Recent::new(),
                stats: RuntimeStats::default(),
                last_sid: SessionId::ZERO,
                now,
            }),
            hook: Mutex::new(None),
        }
    }

    /// Runtime with a freshly generated identity
    pub fn with_config(endpoint: Endpoint, config: RuntimeConfig) -> Self {
        Runtime::new(endpoint, Identity::generate(), config)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.state.lock().local.clone()
    }

    pub fn config(&self) -> RuntimeConfig {
        self.state.lock().config.clone()
    }

    pub fn keys(&self) -> Arc<KeyStore> {
        self.state.lock().security.keys().clone()
    }

    pub fn public_identity(&self) -> PublicIdentity {
        self.keys().identity().public()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.state.lock().stats.clone()
    }

    /// Time of the last tick
    pub fn now(&self) -> Timestamp {
        self.state.lock().now
    }

    pub fn active_scopes(&self) -> usize {
        self.state.lock().scopes.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Blocks waiting for a send hook
    pub fn buffered(&self) -> usize {
        self.state.lock().outbound.len()
    }

    /// Run `f` against the pointer registry
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut PointerRegistry) -> R) -> R {
        let out = {
            let mut state = self.state.lock();
            let out = f(&mut state.registry);
            state.pump();
            out
        };
        self.flush();
        out
    }

    /// Install the transport and hand it everything buffered so far
    pub fn set_send_hook(&self, hook: SendHook) {
        *self.hook.lock() = Some(hook);
        self.flush();
    }

    pub fn has_send_hook(&self) -> bool {
        self.hook.lock().is_some()
    }

    fn flush(&self) {
        let answered = std::mem::take(&mut self.state.lock().answered);
        for (callback, outcome, header) in answered {
            callback(outcome, header.as_ref());
        }

        let mut hook = self.hook.lock();
        let Some(hook) = hook.as_mut() else {
            return;
        };
        loop {
            let blocks: Vec<OutboundBlock> = {
                let mut state = self.state.lock();
                state.stats.blocks_out += state.outbound.len() as u64;
                state.outbound.drain(..).collect()
            };
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                hook(block);
            }
        }
    }

    /// Handle a raw block that arrived from `last_hop`
    pub fn receive(&self, bytes: &[u8], last_hop: Option<&Endpoint>) {
        {
            let mut state = self.state.lock();
            state.receive(bytes, last_hop);
            state.pump();
        }
        self.flush();
    }

    /// Flood the local verifying key
    pub fn announce(&self) -> DatexResult<()> {
        let result = self.state.lock().announce();
        self.flush();
        result
    }

    /// Send a scope body with explicit block options; returns its sid
    pub fn send_scope(&self, body: &[u8], mut options: BlockOptions) -> DatexResult<SessionId> {
        let result = {
            let mut state = self.state.lock();
            if options.sid == SessionId::ZERO {
                options.sid = state.next_sid();
            }
            let sid = options.sid;
            state.emit(body, options).map(|()| sid)
        };
        self.flush();
        result
    }

    /// Execute a program on the local endpoint
    pub async fn execute(&self, program: &[u8]) -> DatexResult<Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.execute(program, tx);
            state.pump();
        }
        self.flush();
        self.wait(None, rx).await
    }

    /// Execute a program on the receivers and await the first answer
    pub async fn request(&self, program: &[u8], receivers: Cnf) -> DatexResult<Value> {
        let (tx, rx) = oneshot::channel();
        let sent = {
            let mut state = self.state.lock();
            state.send_program(program, receivers).map(|sid| {
                state.await_reply(sid, Continuation::Resume(Resumer::Channel(tx)));
                sid
            })
        };
        self.flush();
        let sid = sent?;
        self.wait(Some(sid), rx).await
    }

    /// Request with explicit block options, e.g. to encrypt the program
    pub async fn request_with(&self, program: &[u8], options: BlockOptions) -> DatexResult<Value> {
        let (tx, rx) = oneshot::channel();
        let sent = {
            let mut state = self.state.lock();
            state.send_request(program, options).map(|sid| {
                state.await_reply(sid, Continuation::Resume(Resumer::Channel(tx)));
                sid
            })
        };
        self.flush();
        let sid = sent?;
        self.wait(Some(sid), rx).await
    }

    /// Block options carrying the configured ttl, priority and signing
    pub fn block_options(&self, receivers: Receivers) -> BlockOptions {
        let state = self.state.lock();
        state.options(MessageKind::Request, SessionId::ZERO, receivers)
    }

    /// Send a request whose answer is handed to `callback` with its header
    pub fn request_detailed(&self, program: &[u8], receivers: Cnf, callback: DetailedCallback) -> DatexResult<SessionId> {
        let sent = {
            let mut state = self.state.lock();
            state.send_program(program, receivers).map(|sid| {
                state.await_reply(sid, Continuation::Detailed(callback));
                sid
            })
        };
        self.flush();
        sent
    }

    /// Make a pointer available locally, subscribing at its origin if needed
    pub async fn load_pointer(&self, id: PointerId) -> DatexResult<PointerId> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.registry.load_local(id)?.is_some() {
                return Ok(id);
            }
            state.start_load(id, Resumer::Channel(tx));
            state.pump();
        }
        self.flush();
        self.wait(None, rx).await.map(|_| id)
    }

    /// Stop receiving updates of a remote pointer
    pub async fn unsubscribe(&self, id: PointerId) -> DatexResult<()> {
        let origin = {
            let state = self.state.lock();
            let pointer = state
                .registry
                .get(id)
                .ok_or_else(|| DatexError::Pointer(format!("pointer {} does not exist", id)))?;
            if state.registry.is_local_origin(pointer) {
                return Err(DatexError::Pointer(format!("pointer {} is local", id)));
            }
            pointer.origin().clone()
        };
        let mut b = InstructionBuilder::new();
        b.op(Opcode::UNSUBSCRIBE).pointer(id);
        self.request(b.as_slice(), Cnf::target(Target::Endpoint(origin))).await?;
        Ok(())
    }

    async fn wait(&self, sid: Option<SessionId>, rx: oneshot::Receiver<DatexResult<Value>>) -> DatexResult<Value> {
        let timeout = self.state.lock().config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DatexError::Network("request was cancelled".into())),
            Err(_) => {
                let mut state = self.state.lock();
                if let Some(sid) = sid {
                    if state.requests.remove(&sid).is_some() {
                        state.stats.requests_timed_out += 1;
                    }
                }
                tracing::warn!(?sid, "request timed out");
                Err(DatexError::Network("request timed out".into()))
            }
        }
    }

    /// One tick at wall-clock time
    pub fn tick(&self) {
        self.tick_at(Timestamp::now());
    }

    /// Expire requests, flush updates, collect garbage and drain the buffer
    pub fn tick_at(&self, now: Timestamp) {
        let start = Instant::now();
        {
            let mut state = self.state.lock();
            state.tick(now);
            state.stats.last_tick_duration = start.elapsed();
        }
        self.flush();
    }

    /// Tick periodically until the runtime is dropped
    pub fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let period = self.config().tick_interval;
        let runtime: Weak<Runtime> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                runtime.tick();
            }
        })
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Runtime")
            .field("endpoint", &state.local)
            .field("scopes", &state.scopes.len())
            .field("requests", &state.requests.len())
            .field("buffered", &state.outbound.len())
            .finish()
    }
}

/// Endpoints a receiver filter names positively, narrowed to those it accepts on their own
fn route_of(receivers: &Receivers) -> Vec<Endpoint> {
    let Some(cnf) = receivers.filter() else {
        return Vec::new();
    };
    let mut named: Vec<Endpoint> = Vec::new();
    for clause in cnf.clauses() {
        for literal in clause.literals() {
            if literal.negated {
                continue;
            }
            if let Target::Endpoint(e) = &literal.target {
                if !named.contains(e) {
                    named.push(e.clone());
                }
            }
        }
    }
    let accepted: Vec<Endpoint> = named
        .iter()
        .filter(|e| cnf.test(&[Target::Endpoint((*e).clone())]))
        .cloned()
        .collect();
    if accepted.is_empty() {
        named
    } else {
        accepted
    }
}

/// Program running a closure remotely: captures first, then the body as a DO block
fn remote_program(closure: &Closure) -> DatexResult<Vec<u8>> {
    let mut b = InstructionBuilder::new();
    let mut names = Vec::with_capacity(closure.captures.len());
    for (name, value) in &closure.captures {
        b.set_var(name.as_str())?.value(value)?;
        b.close_and_store();
        names.push(name.clone());
    }
    b.scope_block(BlockKind::Do, &[], &names, &closure.body)?;
    Ok(b.into_vec())
}

/// Error values in a reply reject the request
fn into_outcome(value: Value) -> DatexResult<Value> {
    match value {
        Value::Error(e) => Err(e),
        other => Ok(other),
    }
}

impl State {
    fn next_sid(&mut self) -> SessionId {
        self.last_sid = self.last_sid.next();
        self.last_sid
    }

    fn deadline(&self) -> Timestamp {
        Timestamp::from_millis(self.now.as_millis() + self.config.request_timeout.as_millis() as u64)
    }

    fn options(&self, kind: MessageKind, sid: SessionId, receivers: Receivers) -> BlockOptions {
        BlockOptions {
            kind,
            sid,
            ttl: self.config.default_ttl,
            priority: self.config.default_priority,
            receivers,
            sign: self.config.sign_blocks,
            timestamp: self.now,
            ..BlockOptions::default()
        }
    }

    // ---- outbound ----

    fn push_outbound(&mut self, block: OutboundBlock) {
        if self.outbound.len() >= self.config.outbound_buffer_limit {
            self.outbound.pop_front();
            self.stats.blocks_dropped += 1;
            tracing::warn!(limit = self.config.outbound_buffer_limit, "outbound buffer full, dropping oldest block");
        }
        self.outbound.push_back(block);
    }

    fn emit(&mut self, body: &[u8], options: BlockOptions) -> DatexResult<()> {
        let max_block_size = self.config.max_block_size;
        self.emit_sized(body, options, max_block_size)
    }

    /// Split, seal and queue a scope body
    fn emit_sized(&mut self, body: &[u8], mut options: BlockOptions, max_block_size: usize) -> DatexResult<()> {
        let receivers = route_of(&options.receivers);
        match &options.receivers {
            Receivers::None => return Err(DatexError::Network("block has no receivers".into())),
            Receivers::Filter(_) if receivers.is_empty() => {
                return Err(DatexError::Network("no endpoint among the receivers".into()));
            }
            _ => {}
        }
        if options.encrypt {
            self.security.attach_keys(&mut options.receivers)?;
        }

        let blocks = split_scope(Some(&self.local), &options, body, max_block_size)?;
        tracing::trace!(sid = %options.sid, kind = ?options.kind, blocks = blocks.len(), "emitting scope");
        for block in blocks {
            let bytes = self.security.seal(block)?;
            self.push_outbound(OutboundBlock {
                bytes,
                receivers: receivers.clone(),
                except: None,
            });
        }
        Ok(())
    }

    fn send_program(&mut self, program: &[u8], receivers: Cnf) -> DatexResult<SessionId> {
        let options = self.options(MessageKind::Request, SessionId::ZERO, Receivers::to(receivers));
        self.send_request(program, options)
    }

    fn send_request(&mut self, program: &[u8], mut options: BlockOptions) -> DatexResult<SessionId> {
        let sid = self.next_sid();
        options.sid = sid;
        options.kind = MessageKind::Request;
        options.executable = true;
        self.emit(program, options)?;
        self.stats.requests_sent += 1;
        Ok(sid)
    }

    fn await_reply(&mut self, sid: SessionId, continuation: Continuation) {
        let deadline = self.deadline();
        self.requests.insert(sid, PendingRequest { deadline, continuation });
    }

    fn respond(&mut self, to: Endpoint, sid: SessionId, return_index: u16, encrypt: bool, outcome: DatexResult<Value>) {
        let value = match outcome {
            Ok(v) => v,
            Err(e) => Value::Error(e),
        };
        let body = match encode_value(&value) {
            Ok(body) => body,
            Err(e) => match encode_value(&Value::Error(e)) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(sid = %sid, error = %e, "cannot encode response");
                    return;
                }
            },
        };
        let mut options = self.options(MessageKind::Response, sid, Receivers::endpoint(to.clone()));
        options.return_index = return_index;
        options.encrypt = encrypt;
        if let Err(e) = self.emit(&body, options) {
            tracing::warn!(sid = %sid, to = %to, error = %e, "cannot send response");
        }
    }

    fn send_update(&mut self, update: OutboundUpdate) {
        let Some(cnf) = update
            .receivers
            .iter()
            .map(|e| Cnf::target(Target::Endpoint(e.clone())))
            .reduce(|a, b| a.or(&b))
        else {
            return;
        };
        let sid = self.next_sid();
        let mut options = self.options(MessageKind::Data, sid, Receivers::to(cnf));
        options.executable = true;
        if let Err(e) = self.emit(&update.program, options) {
            tracing::warn!(sid = %sid, error = %e, "cannot send pointer update");
        }
    }

    fn announce(&mut self) -> DatexResult<()> {
        let public = self.security.keys().identity().public().to_bytes();
        let body = encode_value(&Value::Buffer(public.to_vec()))?;
        let sid = self.next_sid();
        let mut options = self.options(MessageKind::Hello, sid, Receivers::Flood);
        options.sign = false;
        // HELLO is always a single block
        self.emit_sized(&body, options, MAX_BLOCK_SIZE)
    }

    // ---- inbound ----

    fn receive(&mut self, bytes: &[u8], last_hop: Option<&Endpoint>) {
        self.stats.blocks_in += 1;
        let header = match Header::parse(bytes) {
            Ok((header, _)) => header,
            Err(e) => {
                self.stats.blocks_dropped += 1;
                tracing::warn!(error = %e, "dropping unparsable block");
                return;
            }
        };
        if header.sender.as_ref().map_or(false, |s| s.main() == self.local.main()) {
            self.stats.blocks_dropped += 1;
            tracing::trace!(sid = %header.sid, "dropping own block");
            return;
        }

        match &header.receivers {
            Receivers::Flood => {
                let key = (header.sender.as_ref().map(Endpoint::main), header.sid, header.inc);
                if !self.floods.insert(key) {
                    tracing::trace!(sid = %header.sid, "flood already seen");
                    return;
                }
                self.relay_flood(bytes, &header, last_hop);
            }
            Receivers::Filter(_) if !header.is_addressed_to(&self.local) => {
                self.redirect(bytes, &header, last_hop);
                return;
            }
            _ => {}
        }
        self.process(bytes);
    }

    fn relay_flood(&mut self, bytes: &[u8], header: &Header, last_hop: Option<&Endpoint>) {
        if !self.config.flood_relay || header.ttl <= 1 {
            return;
        }
        let mut relayed = bytes.to_vec();
        if patch_ttl(&mut relayed, header.ttl - 1).is_err() {
            return;
        }
        self.stats.blocks_relayed += 1;
        tracing::debug!(sid = %header.sid, ttl = header.ttl - 1, "relaying flood");
        self.push_outbound(OutboundBlock {
            bytes: relayed,
            receivers: Vec::new(),
            except: last_hop.cloned(),
        });
    }

    fn redirect(&mut self, bytes: &[u8], header: &Header, last_hop: Option<&Endpoint>) {
        if header.ttl <= 1 {
            self.stats.blocks_dropped += 1;
            tracing::warn!(sid = %header.sid, error = %DatexError::Network("too many redirects".into()), "dropping block");
            return;
        }
        let local = self.local.main();
        let hop = last_hop.map(Endpoint::main);
        let receivers: Vec<Endpoint> = route_of(&header.receivers)
            .into_iter()
            .filter(|e| {
                let main = e.main();
                main != local && Some(&main) != hop.as_ref()
            })
            .collect();
        if receivers.is_empty() {
            self.stats.blocks_dropped += 1;
            tracing::debug!(sid = %header.sid, "no route for block");
            return;
        }
        let mut forwarded = bytes.to_vec();
        if patch_ttl(&mut forwarded, header.ttl - 1).is_err() {
            return;
        }
        self.stats.blocks_relayed += 1;
        tracing::debug!(sid = %header.sid, receivers = receivers.len(), "redirecting block");
        self.push_outbound(OutboundBlock {
            bytes: forwarded,
            receivers,
            except: last_hop.cloned(),
        });
    }

    fn process(&mut self, bytes: &[u8]) {
        let opened = match self.security.open(bytes) {
            Ok(opened) => opened,
            Err(OpenError { header, error }) => {
                self.stats.blocks_dropped += 1;
                tracing::warn!(error = %error, "cannot open block");
                if let Some(header) = header {
                    self.reject_block(&header, error);
                }
                return;
            }
        };
        let header = opened.header;
        if let Some(sender) = &header.sender {
            self.registry.register_endpoint(sender);
        }
        if header.kind == MessageKind::Hello {
            self.hello(&header, &opened.body);
            return;
        }

        let key = ScopeKey::of(&header);
        if self.finished.contains(&key) {
            self.stats.blocks_dropped += 1;
            tracing::debug!(sid = %header.sid, inc = header.inc, "block of a finished scope");
            return;
        }
        let max_parked = self.config.max_parked_blocks;
        let accepted = match self.scopes.get_mut(&key) {
            Some(scope) => scope.accept(header.inc, header.flags.is_end_of_scope(), opened.body, max_parked),
            None => {
                let mut scope = self.open_scope(&header);
                let accepted = scope.accept(header.inc, header.flags.is_end_of_scope(), opened.body, max_parked);
                self.scopes.insert(key.clone(), scope);
                accepted
            }
        };
        match accepted {
            Accepted::Fed(_) => self.run_scope(key),
            Accepted::Parked => tracing::debug!(sid = %header.sid, inc = header.inc, "parked block"),
            Accepted::Duplicate | Accepted::Overflow => {
                self.stats.blocks_dropped += 1;
                tracing::warn!(sid = %header.sid, inc = header.inc, ?accepted, "dropping block");
            }
        }
    }

    /// A block that failed verification still gets answered or correlated
    fn reject_block(&mut self, header: &Header, error: DatexError) {
        match (&header.kind, &header.sender) {
            (MessageKind::Request, Some(sender)) => {
                let sender = sender.clone();
                self.respond(sender, header.sid, header.return_index, false, Err(error));
            }
            (MessageKind::Response | MessageKind::Data | MessageKind::Local, _) => {
                self.settle(header.sid, Err(error), Some(header))
            }
            _ => {}
        }
    }

    fn hello(&mut self, header: &Header, body: &[u8]) {
        let Some(sender) = &header.sender else {
            return;
        };
        let public = decode_detached(body).and_then(|value| match value {
            Value::Buffer(bytes) => PublicIdentity::from_bytes(&bytes),
            other => Err(DatexError::Value(format!("unexpected HELLO payload {}", other))),
        });
        match public {
            Ok(public) => {
                self.security.keys().register_identity(sender, public);
                tracing::info!(endpoint = %sender, "registered endpoint key");
            }
            Err(e) => tracing::warn!(endpoint = %sender, error = %e, "invalid HELLO"),
        }
    }

    fn open_scope(&self, header: &Header) -> ActiveScope {
        let ctx = ScopeContext {
            local: self.local.clone(),
            sender: header.sender.clone(),
            sid: header.sid,
            executable: header.flags.is_executable(),
            impersonation: false,
            signed: header.signature.is_some(),
            encrypted: header.iv.is_some(),
            timestamp: header.timestamp,
        };
        let reply = match (header.kind, &header.sender) {
            (MessageKind::Request, Some(sender)) => Reply::Respond {
                to: sender.clone(),
                return_index: header.return_index,
            },
            (MessageKind::Response, _) => Reply::Resolve,
            (MessageKind::Data | MessageKind::Local, _) => Reply::Reject,
            _ => Reply::Silent,
        };
        ActiveScope::new(header.clone(), ctx, reply)
    }

    fn execute(&mut self, program: &[u8], tx: oneshot::Sender<DatexResult<Value>>) {
        let sid = self.next_sid();
        let mut header = Header::new(sid, MessageKind::Local);
        header.sender = Some(self.local.clone());
        header.timestamp = self.now;
        let mut ctx = ScopeContext::local(self.local.clone());
        ctx.sid = sid;
        ctx.timestamp = self.now;

        let key = ScopeKey::of(&header);
        self.scopes
            .insert(key.clone(), ActiveScope::with_program(header, ctx, Reply::Channel(tx), program));
        self.run_scope(key);
    }

    // ---- execution ----

    fn run_scope(&mut self, key: ScopeKey) {
        let Some(mut scope) = self.scopes.remove(&key) else {
            return;
        };
        match self.drive_scope(&key, &mut scope) {
            Ok(None) => {
                self.scopes.insert(key, scope);
            }
            Ok(Some(value)) => self.complete_scope(key, scope, Ok(value)),
            Err(e) => self.complete_scope(key, scope, Err(e)),
        }
    }

    fn drive_scope(&mut self, key: &ScopeKey, scope: &mut ActiveScope) -> DatexResult<Option<Value>> {
        if scope.awaiting {
            return Ok(None);
        }
        let exclude = scope
            .context()
            .sender
            .clone()
            .filter(|s| s.main() != self.local.main());
        loop {
            let execution = &mut scope.execution;
            let step = match &exclude {
                Some(sender) => self.registry.with_update_exclusion(sender, |reg| execution.run(reg))?,
                None => execution.run(&mut self.registry)?,
            };
            match step {
                Step::Done(value) => return Ok(Some(value)),
                Step::Progress | Step::NeedMore => return Ok(None),
                Step::Await(Suspension::LoadPointer(id)) => {
                    if !scope.context().executable {
                        // unknown pointers in plain values stay references
                        scope.execution.resume(Ok(Value::Void))?;
                        continue;
                    }
                    self.start_load(id, Resumer::Scope(key.clone()));
                    scope.awaiting = true;
                    return Ok(None);
                }
                Step::Await(Suspension::Remote { receivers, closure }) => {
                    let program = remote_program(&closure)?;
                    let sid = self.send_program(&program, receivers)?;
                    tracing::debug!(sid = %sid, scope = %key.sid, "remote execution");
                    self.await_reply(sid, Continuation::Resume(Resumer::Scope(key.clone())));
                    scope.awaiting = true;
                    return Ok(None);
                }
                Step::Await(other) => {
                    return Err(DatexError::Runtime(format!("cannot resolve {:?} here", other)));
                }
            }
        }
    }

    fn traced(&self, error: DatexError, sid: SessionId, instruction: u64) -> DatexError {
        if !self.config.trace_errors {
            return error;
        }
        error.with_hop(TraceHop {
            endpoint: self.local.to_string(),
            location: format!("{}:{}", sid, instruction),
        })
    }

    fn complete_scope(&mut self, key: ScopeKey, scope: ActiveScope, outcome: DatexResult<Value>) {
        let instruction = scope.execution.root().instruction_count();
        self.finished.insert(key.clone());
        match &outcome {
            Ok(_) => self.stats.scopes_completed += 1,
            Err(e) => {
                self.stats.scopes_failed += 1;
                tracing::debug!(sid = %key.sid, error = %e, "scope failed");
            }
        }
        let encrypt = scope.header.iv.is_some();
        match scope.reply {
            Reply::Respond { to, return_index } => {
                let outcome = outcome.map_err(|e| self.traced(e, key.sid, instruction));
                self.respond(to, key.sid, return_index, encrypt, outcome);
            }
            Reply::Resolve => {
                self.settle(key.sid, outcome.and_then(into_outcome), Some(&scope.header));
            }
            Reply::Reject => {
                if let Err(e) = outcome {
                    self.settle(key.sid, Err(e), Some(&scope.header));
                }
            }
            Reply::Silent => {
                if let Err(e) = outcome {
                    tracing::warn!(sid = %key.sid, error = %e, "scope failed");
                }
            }
            Reply::Channel(tx) => {
                // the caller may have stopped waiting
                let _ = tx.send(outcome);
            }
        }
    }

    /// Hand a reply to whatever waits for `sid`
    fn settle(&mut self, sid: SessionId, outcome: DatexResult<Value>, header: Option<&Header>) {
        let Some(pending) = self.requests.remove(&sid) else {
            if let Err(e) = outcome {
                tracing::debug!(sid = %sid, error = %e, "error for unknown request");
            }
            return;
        };
        match pending.continuation {
            Continuation::Resume(then) => self.resume(then, outcome),
            Continuation::Detailed(callback) => self.answered.push((callback, outcome, header.cloned())),
            Continuation::Subscribe {
                pointer,
                endpoint,
                retried,
                then,
            } => self.subscribed(pointer, endpoint, retried, then, outcome),
            Continuation::Origin { pointer, endpoint, then } => self.origin_found(pointer, endpoint, then, outcome),
        }
    }

    fn resume(&mut self, then: Resumer, outcome: DatexResult<Value>) {
        match then {
            Resumer::Scope(key) => self.ready.push_back((key, outcome)),
            Resumer::Channel(tx) => {
                let _ = tx.send(outcome);
            }
        }
    }

    /// Resume scopes whose suspensions resolved, then ship resulting updates
    fn pump(&mut self) {
        loop {
            while let Some((key, outcome)) = self.ready.pop_front() {
                let Some(mut scope) = self.scopes.remove(&key) else {
                    tracing::debug!(sid = %key.sid, "resumed scope is gone");
                    continue;
                };
                scope.awaiting = false;
                match scope.execution.resume(outcome) {
                    Ok(()) => {
                        self.scopes.insert(key.clone(), scope);
                        self.run_scope(key);
                    }
                    Err(e) => self.complete_scope(key, scope, Err(e)),
                }
            }

            let ctx = ScopeContext::local(self.local.clone());
            match update_transforms(&mut self.registry, &ctx) {
                Ok(updated) if !updated.is_empty() => {
                    tracing::trace!(transforms = updated.len(), "recomputed transforms");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "transform update failed"),
            }

            match self.registry.take_outbound(self.now) {
                Ok(updates) => {
                    for update in updates {
                        self.send_update(update);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cannot compile pointer updates"),
            }

            if self.ready.is_empty() {
                break;
            }
        }
    }

    fn tick(&mut self, now: Timestamp) {
        self.now = now;
        self.stats.ticks += 1;
        self.registry.set_now(now);

        let expired: Vec<SessionId> = self
            .requests
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in expired {
            self.stats.requests_timed_out += 1;
            tracing::warn!(sid = %sid, "request timed out");
            self.settle(sid, Err(DatexError::Network(format!("request {} timed out", sid))), None);
        }

        let collected = self.registry.sweep(now);
        if !collected.is_empty() {
            self.stats.pointers_collected += collected.len() as u64;
            tracing::debug!(count = collected.len(), "collected pointers");
        }
        self.pump();
    }

    // ---- pointer subscriptions ----

    fn start_load(&mut self, id: PointerId, then: Resumer) {
        let origin = match self.registry.origin_of(&id) {
            Some(origin) if origin.main() != self.local.main() => origin,
            _ => {
                let error = DatexError::Pointer(format!("pointer {} does not exist", id));
                return self.resume(then, Err(error));
            }
        };
        if self.registry.is_loading(id) {
            tracing::debug!(pointer = %id, "joining pointer load in flight");
            self.load_waiters.entry(id).or_default().push(then);
            return;
        }
        if let Err(e) = self.registry.begin_load(id) {
            return self.resume(then, Err(e));
        }
        self.registry.create_placeholder(id, origin.clone());
        self.subscribe_at(id, origin, false, then);
    }

    fn subscribe_at(&mut self, id: PointerId, endpoint: Endpoint, retried: bool, then: Resumer) {
        tracing::debug!(pointer = %id, endpoint = %endpoint, retried, "subscribing");
        let mut b = InstructionBuilder::new();
        b.op(Opcode::SUBSCRIBE).pointer(id);
        match self.send_program(b.as_slice(), Cnf::target(Target::Endpoint(endpoint.clone()))) {
            Ok(sid) => self.await_reply(
                sid,
                Continuation::Subscribe {
                    pointer: id,
                    endpoint,
                    retried,
                    then,
                },
            ),
            Err(e) => self.fail_load(id, then, e),
        }
    }

    fn subscribed(&mut self, id: PointerId, endpoint: Endpoint, retried: bool, then: Resumer, outcome: DatexResult<Value>) {
        match outcome {
            Ok(value) => {
                self.registry.end_load(id);
                let options = PointerOptions {
                    id: Some(id),
                    origin: Some(endpoint.clone()),
                    ..Default::default()
                };
                let created = self
                    .registry
                    .create(value, options)
                    .and_then(|_| self.registry.set_origin(id, endpoint));
                match created {
                    Ok(()) => {
                        for waiter in self.load_waiters.remove(&id).unwrap_or_default() {
                            self.resume(waiter, Ok(Value::Pointer(id)));
                        }
                        self.resume(then, Ok(Value::Pointer(id)))
                    }
                    Err(e) => self.fail_load(id, then, e),
                }
            }
            Err(e) if !retried => {
                tracing::warn!(pointer = %id, endpoint = %endpoint, error = %e, "subscription failed, asking for origin");
                let mut b = InstructionBuilder::new();
                b.op(Opcode::ORIGIN).pointer(id);
                match self.send_program(b.as_slice(), Cnf::target(Target::Endpoint(endpoint.clone()))) {
                    Ok(sid) => self.await_reply(
                        sid,
                        Continuation::Origin {
                            pointer: id,
                            endpoint,
                            then,
                        },
                    ),
                    Err(e) => self.fail_load(id, then, e),
                }
            }
            Err(e) => self.fail_load(id, then, e),
        }
    }

    fn origin_found(&mut self, id: PointerId, asked: Endpoint, then: Resumer, outcome: DatexResult<Value>) {
        match outcome {
            Ok(Value::Target(Target::Endpoint(origin)))
                if origin.main() != asked.main() && origin.main() != self.local.main() =>
            {
                if let Err(e) = self.registry.set_origin(id, origin.clone()) {
                    return self.fail_load(id, then, e);
                }
                self.subscribe_at(id, origin, true, then);
            }
            Ok(_) => {
                let error = DatexError::Network(format!("cannot find origin of pointer {}", id));
                self.fail_load(id, then, error);
            }
            Err(e) => self.fail_load(id, then, e),
        }
    }

    /// Unwind a load: the partially created pointer goes away
    fn fail_load(&mut self, id: PointerId, then: Resumer, error: DatexError) {
        tracing::warn!(pointer = %id, error = %error, "pointer load failed");
        self.registry.end_load(id);
        if self.registry.get(id).map_or(false, |p| !p.is_initialized()) {
            // presence checked above
            let _ = self.registry.delete(id);
        }
        for waiter in self.load_waiters.remove(&id).unwrap_or_default() {
            self.resume(waiter, Err(error.clone()));
        }
        self.resume(then, Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use datex_wire::{Block, VarName};

    type Sent = Arc<Mutex<Vec<OutboundBlock>>>;

    fn runtime(name: &str, config: RuntimeConfig) -> (Runtime, Sent) {
        let rt = Runtime::with_config(Endpoint::person(name), config);
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        rt.set_send_hook(Box::new(move |block| sink.lock().push(block)));
        (rt, sent)
    }

    fn take(sent: &Sent) -> Vec<OutboundBlock> {
        std::mem::take(&mut *sent.lock())
    }

    /// Deliver everything both sides send until neither sends anything
    fn shuttle(a: (&Runtime, &Sent), b: (&Runtime, &Sent)) {
        loop {
            let from_a = take(a.1);
            let from_b = take(b.1);
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            let (a_name, b_name) = (a.0.endpoint(), b.0.endpoint());
            for block in from_a {
                b.0.receive(&block.bytes, Some(&a_name));
            }
            for block in from_b {
                a.0.receive(&block.bytes, Some(&b_name));
            }
        }
    }

    fn to(name: &str) -> Cnf {
        Cnf::target(Target::Endpoint(Endpoint::person(name)))
    }

    type Answer = Arc<Mutex<Option<(DatexResult<Value>, Option<MessageKind>)>>>;

    fn capture() -> (Answer, DetailedCallback) {
        let answer: Answer = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&answer);
        let callback: DetailedCallback = Box::new(move |outcome, header| {
            *slot.lock() = Some((outcome, header.map(|h| h.kind)));
        });
        (answer, callback)
    }

    fn sum_program() -> Vec<u8> {
        let mut b = InstructionBuilder::new();
        b.int(1).op(Opcode::ADD).int(2);
        b.into_vec()
    }

    #[test]
    fn test_outbound_buffered_until_hook() {
        let rt = Runtime::with_config(Endpoint::person("alice"), RuntimeConfig::default());
        rt.announce().unwrap();
        assert_eq!(rt.buffered(), 1);

        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        rt.set_send_hook(Box::new(move |block| sink.lock().push(block)));
        assert_eq!(rt.buffered(), 0);
        let blocks = take(&sent);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_flood());
        assert_eq!(rt.stats().blocks_out, 1);
    }

    #[test]
    fn test_outbound_buffer_limit() {
        let config = RuntimeConfig {
            outbound_buffer_limit: 2,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::with_config(Endpoint::person("alice"), config);
        for _ in 0..3 {
            rt.announce().unwrap();
        }
        assert_eq!(rt.buffered(), 2);
        assert_eq!(rt.stats().blocks_dropped, 1);
    }

    #[test]
    fn test_request_response() {
        let (alice, a_sent) = runtime("alice", RuntimeConfig::default());
        let (bob, b_sent) = runtime("bob", RuntimeConfig::default());
        let (answer, callback) = capture();

        alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();
        assert_eq!(alice.pending_requests(), 1);
        shuttle((&alice, &a_sent), (&bob, &b_sent));

        let (outcome, kind) = answer.lock().take().unwrap();
        assert_eq!(outcome.unwrap(), Value::Int(3));
        assert_eq!(kind, Some(MessageKind::Response));
        assert_eq!(alice.pending_requests(), 0);
        assert_eq!(bob.stats().scopes_completed, 1);
        assert_eq!(alice.active_scopes(), 0);
        assert_eq!(bob.active_scopes(), 0);
    }

    #[test]
    fn test_duplicate_request_runs_once() {
        let (alice, a_sent) = runtime("alice", RuntimeConfig::default());
        let (bob, b_sent) = runtime("bob", RuntimeConfig::default());
        let (_answer, callback) = capture();
        alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();

        let request = take(&a_sent).remove(0);
        bob.receive(&request.bytes, Some(&alice.endpoint()));
        bob.receive(&request.bytes, Some(&alice.endpoint()));
        assert_eq!(take(&b_sent).len(), 1);
        assert_eq!(bob.stats().scopes_completed, 1);
        assert_eq!(bob.stats().blocks_dropped, 1);
    }

    #[test]
    fn test_error_response_carries_trace() {
        let config = RuntimeConfig {
            trace_errors: true,
            ..RuntimeConfig::default()
        };
        let (alice, a_sent) = runtime("alice", RuntimeConfig::default());
        let (bob, b_sent) = runtime("bob", config);
        let (answer, callback) = capture();

        let mut b = InstructionBuilder::new();
        b.var(VarName::from("missing")).unwrap();
        alice.request_detailed(b.as_slice(), to("bob"), callback).unwrap();
        shuttle((&alice, &a_sent), (&bob, &b_sent));

        let (outcome, _) = answer.lock().take().unwrap();
        let error = outcome.unwrap_err();
        assert!(matches!(error.root(), DatexError::Runtime(_)));
        assert_eq!(error.trace().len(), 1);
        assert_eq!(error.trace()[0].endpoint, "@bob");
        assert_eq!(bob.stats().scopes_failed, 1);
    }

    #[test]
    fn test_failed_data_rejects_request() {
        let (alice, _sent) = runtime("alice", RuntimeConfig::default());
        let (answer, callback) = capture();
        let sid = alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();

        let bob = Endpoint::person("bob");
        let mut b = InstructionBuilder::new();
        b.var(VarName::from("missing")).unwrap();
        let options = BlockOptions {
            kind: MessageKind::Data,
            sid,
            receivers: Receivers::endpoint(alice.endpoint()),
            ..BlockOptions::default()
        };
        let (bytes, _) = Block::new(options.header(Some(&bob), 0, true), b.into_vec())
            .to_bytes()
            .unwrap();
        alice.receive(&bytes, Some(&bob));

        let (outcome, kind) = answer.lock().take().unwrap();
        assert!(matches!(outcome, Err(DatexError::Runtime(_))));
        assert_eq!(kind, Some(MessageKind::Data));
        assert_eq!(alice.pending_requests(), 0);
        assert_eq!(alice.stats().scopes_failed, 1);
    }

    #[test]
    fn test_successful_data_leaves_request_pending() {
        let (alice, _sent) = runtime("alice", RuntimeConfig::default());
        let (answer, callback) = capture();
        let sid = alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();

        let bob = Endpoint::person("bob");
        let options = BlockOptions {
            kind: MessageKind::Data,
            sid,
            receivers: Receivers::endpoint(alice.endpoint()),
            ..BlockOptions::default()
        };
        let (bytes, _) = Block::new(options.header(Some(&bob), 0, true), sum_program())
            .to_bytes()
            .unwrap();
        alice.receive(&bytes, Some(&bob));

        assert!(answer.lock().is_none());
        assert_eq!(alice.pending_requests(), 1);
    }

    #[test]
    fn test_callback_may_reenter_runtime() {
        let (alice, a_sent) = runtime("alice", RuntimeConfig::default());
        let (bob, b_sent) = runtime("bob", RuntimeConfig::default());
        let alice = Arc::new(alice);

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let inner = Arc::clone(&alice);
        let callback: DetailedCallback = Box::new(move |outcome, _| {
            let follow_up = inner.request_detailed(&sum_program(), to("bob"), Box::new(|_, _| {}));
            *slot.lock() = Some((outcome, inner.pending_requests(), follow_up.is_ok()));
        });
        alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();
        shuttle((&*alice, &a_sent), (&bob, &b_sent));

        let (outcome, pending, sent) = seen.lock().take().unwrap();
        assert_eq!(outcome.unwrap(), Value::Int(3));
        assert_eq!(pending, 1);
        assert!(sent);
        assert_eq!(bob.stats().scopes_completed, 2);
    }

    #[test]
    fn test_request_expires_on_tick() {
        let (alice, _sent) = runtime("alice", RuntimeConfig::default());
        let (answer, callback) = capture();
        alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();

        let later = Timestamp::from_millis(alice.now().as_millis() + 1000);
        alice.tick_at(later);
        assert!(answer.lock().is_none());

        let expired = Timestamp::from_millis(alice.now().as_millis() + 5000);
        alice.tick_at(expired);
        let (outcome, kind) = answer.lock().take().unwrap();
        assert!(matches!(outcome, Err(DatexError::Network(_))));
        assert_eq!(kind, None);
        assert_eq!(alice.stats().requests_timed_out, 1);
    }

    #[test]
    fn test_split_scope_reassembled_out_of_order() {
        let config = RuntimeConfig {
            max_block_size: 120,
            ..RuntimeConfig::default()
        };
        let (alice, a_sent) = runtime("alice", config);
        let (bob, b_sent) = runtime("bob", RuntimeConfig::default());
        let (answer, callback) = capture();

        let text = "x".repeat(400);
        let mut b = InstructionBuilder::new();
        b.text(&text);
        alice.request_detailed(b.as_slice(), to("bob"), callback).unwrap();

        let mut blocks = take(&a_sent);
        assert!(blocks.len() > 3);
        blocks.reverse();
        for block in &blocks {
            bob.receive(&block.bytes, Some(&alice.endpoint()));
        }
        shuttle((&alice, &a_sent), (&bob, &b_sent));

        let (outcome, _) = answer.lock().take().unwrap();
        assert_eq!(outcome.unwrap(), Value::Text(text));
    }

    #[test]
    fn test_redirect_decrements_ttl() {
        let (relay, sent) = runtime("relay", RuntimeConfig::default());
        let alice = Endpoint::person("alice");
        let options = BlockOptions {
            sid: SessionId::new(3),
            receivers: Receivers::endpoint(Endpoint::person("bob")),
            ttl: 5,
            ..BlockOptions::default()
        };
        let (bytes, _) = Block::new(options.header(Some(&alice), 0, true), sum_program())
            .to_bytes()
            .unwrap();

        relay.receive(&bytes, Some(&alice));
        let out = take(&sent);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].receivers, vec![Endpoint::person("bob")]);
        assert_eq!(out[0].except, Some(alice.clone()));
        let (header, _) = Header::parse(&out[0].bytes).unwrap();
        assert_eq!(header.ttl, 4);
        assert_eq!(relay.active_scopes(), 0);
        assert_eq!(relay.stats().blocks_relayed, 1);

        let options = BlockOptions { ttl: 1, ..options };
        let (bytes, _) = Block::new(options.header(Some(&alice), 0, true), sum_program())
            .to_bytes()
            .unwrap();
        relay.receive(&bytes, Some(&alice));
        assert!(take(&sent).is_empty());
        assert_eq!(relay.stats().blocks_dropped, 1);
    }

    #[test]
    fn test_flood_relayed_once_and_key_registered() {
        let (alice, a_sent) = runtime("alice", RuntimeConfig::default());
        let (relay, r_sent) = runtime("relay", RuntimeConfig::default());
        alice.announce().unwrap();
        let hello = take(&a_sent).remove(0);

        relay.receive(&hello.bytes, Some(&alice.endpoint()));
        relay.receive(&hello.bytes, Some(&alice.endpoint()));
        let out = take(&r_sent);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_flood());
        assert_eq!(out[0].except, Some(alice.endpoint()));
        assert_eq!(Header::parse(&out[0].bytes).unwrap().0.ttl, 63);
        assert_eq!(relay.keys().identity_of(&alice.endpoint()), Some(alice.public_identity()));
    }

    #[test]
    fn test_signed_blocks_need_hello() {
        let config = RuntimeConfig {
            sign_blocks: true,
            ..RuntimeConfig::default()
        };
        let (alice, a_sent) = runtime("alice", config);
        let (bob, b_sent) = runtime("bob", RuntimeConfig::default());

        let (answer, callback) = capture();
        alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();
        shuttle((&alice, &a_sent), (&bob, &b_sent));
        let (outcome, _) = answer.lock().take().unwrap();
        assert!(matches!(outcome, Err(DatexError::Security(_))));

        alice.announce().unwrap();
        shuttle((&alice, &a_sent), (&bob, &b_sent));
        let (answer, callback) = capture();
        alice.request_detailed(&sum_program(), to("bob"), callback).unwrap();
        shuttle((&alice, &a_sent), (&bob, &b_sent));
        assert_eq!(answer.lock().take().unwrap().0.unwrap(), Value::Int(3));
    }

    #[test]
    fn test_collects_unreferenced_pointers() {
        let (alice, _sent) = runtime("alice", RuntimeConfig::default());
        let id = alice.with_registry(|reg| reg.pointer_for(Value::text("abc"))).unwrap();
        assert!(alice.with_registry(|reg| reg.contains(id)));

        let later = alice.now().as_millis() + Duration::from_secs(6).as_millis() as u64;
        alice.tick_at(Timestamp::from_millis(later));
        assert!(!alice.with_registry(|reg| reg.contains(id)));
        assert_eq!(alice.stats().pointers_collected, 1);
    }

    #[test]
    fn test_remote_program_binds_captures() {
        let closure = Closure {
            kind: BlockKind::Remote,
            params: Vec::new(),
            captures: vec![("x".to_string(), Value::Int(4))],
            body: {
                let mut b = InstructionBuilder::new();
                b.var(VarName::from("x")).unwrap().op(Opcode::MULTIPLY).int(10);
                b.into_vec().into()
            },
        };
        let program = remote_program(&closure).unwrap();
        let mut reg = PointerRegistry::new(Endpoint::person("bob"), Default::default());
        let mut execution = datex_vm::Execution::new(datex_vm::ScopeMachine::new(ScopeContext::local(
            Endpoint::person("bob"),
        )));
        execution.feed(&program);
        execution.finish_input();
        assert_eq!(execution.run(&mut reg).unwrap(), Step::Done(Value::Int(40)));
    }

    #[tokio::test]
    async fn test_execute_locally() {
        let (alice, _sent) = runtime("alice", RuntimeConfig::default());
        assert_eq!(alice.execute(&sum_program()).await.unwrap(), Value::Int(3));
    }

    #[tokio::test]
    async fn test_request_awaits_response() {
        let (alice, a_sent) = runtime("alice", RuntimeConfig::default());
        let (bob, b_sent) = runtime("bob", RuntimeConfig::default());
        let alice = Arc::new(alice);

        let requester = Arc::clone(&alice);
        let pending = tokio::spawn(async move { requester.request(&sum_program(), to("bob")).await });
        while alice.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        shuttle((&alice, &a_sent), (&bob, &b_sent));
        assert_eq!(pending.await.unwrap().unwrap(), Value::Int(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let config = RuntimeConfig {
            request_timeout: Duration::from_millis(50),
            ..RuntimeConfig::default()
        };
        let (alice, _sent) = runtime("alice", config);
        let outcome = alice.request(&sum_program(), to("bob")).await;
        assert!(matches!(outcome, Err(DatexError::Network(_))));
        assert_eq!(alice.pending_requests(), 0);
        assert_eq!(alice.stats().requests_timed_out, 1);
    }
}
