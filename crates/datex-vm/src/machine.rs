//! Scope machine
//!
//! Executes one scope's instruction stream as bytes arrive. The machine
//! never blocks: when the buffered input ends mid-instruction it reports
//! `Step::NeedMore` and the instruction is decoded again from its opcode
//! once more bytes are fed. Work that needs the outside world (a remote
//! pointer, a function call, remote execution) surfaces as
//! `Step::Await`; the driver resolves it and hands the outcome back
//! through `resume`.
//!
//! Operands are collected on a per-frame pending stack. A delivered value
//! pops entries until one of them needs more input, with one token of
//! lookahead deciding whether the value still belongs to a longer
//! expression (`<Int> x + 1` casts the sum, `a.b` binds before `+`).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use datex_core::{
    trim_trailing_void, BlockKind, Closure, Cnf, DatexError, DatexResult, DatexType, Object, PointerId, StdType,
    Target, Tuple, Value,
};
use datex_pointer::{ObservableContainer, PointerOptions, PointerRegistry};
use datex_wire::{ActionKind, ByteReader, Opcode};

use crate::{ops, read_instruction, Access, BlockDef, Bracket, Instruction, Reserved, ScopeContext};

/// Work the machine cannot do on its own
#[derive(Clone, Debug, PartialEq)]
pub enum Suspension {
    /// Pointer is neither in the registry nor in a local source
    LoadPointer(PointerId),
    Call { function: Arc<Closure>, args: Value },
    /// Execute a closure on the endpoints matching `receivers`
    Remote { receivers: Cnf, closure: Arc<Closure> },
    /// Create a pointer whose value is recomputed from the closure
    Transform { closure: Arc<Closure> },
}

/// Outcome of a single step
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Progress,
    NeedMore,
    Await(Suspension),
    Done(Value),
}

/// What to do with the value a suspension resolves to
#[derive(Clone, Copy, Debug, PartialEq)]
enum Resume {
    Deliver,
    Assert,
    Iterate,
    Pointer(PointerId),
}

enum Flow {
    Continue,
    Suspend(Resume, Suspension),
    Done(Value),
}

#[derive(Clone, Debug, PartialEq)]
enum PlaceRoot {
    Var(String),
    Internal(String),
    Reserved(Reserved),
    Pointer(PointerId),
}

/// Where a delivered value came from, for property assignment through it
#[derive(Clone, Debug, PartialEq)]
struct Place {
    root: PlaceRoot,
    path: Vec<Value>,
}

impl Place {
    fn new(root: PlaceRoot) -> Self {
        Place { root, path: Vec::new() }
    }
}

#[derive(Clone, Debug)]
enum AssignTarget {
    Var(String),
    Internal(String),
    Reserved(Reserved),
    Label(String),
    Pointer(PointerId),
}

#[derive(Clone, Debug)]
enum Pending {
    Cast(DatexType),
    Unary(Opcode),
    Binary {
        op: Opcode,
        left: Value,
    },
    ChildGet {
        parent: Value,
        place: Option<Place>,
        by_ref: bool,
    },
    ChildSetKey {
        parent: Value,
        place: Option<Place>,
        action: Option<ActionKind>,
    },
    ChildSetValue {
        parent: Value,
        place: Option<Place>,
        key: Value,
        action: Option<ActionKind>,
    },
    Assign {
        target: AssignTarget,
        action: Option<ActionKind>,
    },
    Jump {
        when: bool,
        target: u32,
    },
    Spread,
    Call(Arc<Closure>),
}

#[derive(Debug, Default)]
struct Frame {
    /// `None` for the scope root
    bracket: Option<Bracket>,
    pending: Vec<Pending>,
    active: Option<Value>,
    place: Option<Place>,
    /// Last stored statement value
    result: Option<Value>,
    items: Vec<(Option<String>, Value)>,
    key: Option<String>,
    spread: bool,
}

impl Frame {
    fn open(bracket: Bracket) -> Self {
        Frame {
            bracket: Some(bracket),
            ..Default::default()
        }
    }
}

fn is_infix(op: Opcode) -> bool {
    op.is_binary_operator() || matches!(op, Opcode::MATCHES | Opcode::REMOTE)
}

fn undefined(name: &str) -> DatexError {
    DatexError::Runtime(format!("variable {} is not defined", name))
}

fn missing_pointer(id: PointerId) -> DatexError {
    DatexError::Pointer(format!("pointer {} does not exist", id))
}

fn splice_range(range: &Tuple) -> DatexResult<(usize, usize)> {
    let bound = |i: usize| {
        range
            .get_index(i)
            .and_then(Value::as_int)
            .filter(|n| *n >= 0)
            .map(|n| n as usize)
            .ok_or_else(|| DatexError::Value("splice range needs a start and a count".into()))
    };
    Ok((bound(0)?, bound(1)?))
}

/// Assignment at the end of a property path on a plain value
fn apply_set(target: &mut Value, key: &Value, value: Value, action: Option<ActionKind>) -> DatexResult<()> {
    let value = match action {
        Some(a) => ops::apply_action(a, target.child(key)?, value)?,
        None => value,
    };
    match (key, value) {
        (Value::Wildcard, Value::Void) => target.clear(),
        (Value::Tuple(range), Value::Array(new_items)) if matches!(target, Value::Array(_)) => {
            let (start, count) = splice_range(range)?;
            if let Value::Array(items) = target {
                let start = start.min(items.len());
                let end = start.saturating_add(count).min(items.len());
                items.splice(start..end, new_items);
            }
            Ok(())
        }
        (key, Value::Void) => target.delete_child(key).map(|_| ()),
        (key, value) => target.set_child(key, value),
    }
}

fn set_nested(target: &mut Value, path: &[Value], key: &Value, value: Value, action: Option<ActionKind>) -> DatexResult<()> {
    match path.split_first() {
        None => apply_set(target, key, value, action),
        Some((head, rest)) => {
            let mut child = target.child(head)?;
            set_nested(&mut child, rest, key, value, action)?;
            target.set_child(head, child)
        }
    }
}

fn spread_into(items: &mut Vec<(Option<String>, Value)>, value: Value) -> DatexResult<()> {
    match value {
        Value::Array(values) | Value::Iterator(values) => items.extend(values.into_iter().map(|v| (None, v))),
        Value::Tuple(t) => items.extend(t.entries),
        Value::Object(obj) => items.extend(obj.into_entries().into_iter().map(|(k, v)| (Some(k), v))),
        Value::Void => {}
        other => {
            return Err(DatexError::Value(format!("cannot spread {}", DatexType::of(&other))));
        }
    }
    Ok(())
}

fn build_collection(bracket: Bracket, items: Vec<(Option<String>, Value)>) -> Value {
    match bracket {
        Bracket::Array => {
            let mut values: Vec<Value> = items.into_iter().map(|(_, v)| v).collect();
            trim_trailing_void(&mut values);
            Value::Array(values)
        }
        Bracket::Object => Value::Object(
            items
                .into_iter()
                .enumerate()
                .map(|(i, (k, v))| (k.unwrap_or_else(|| i.to_string()), v))
                .collect(),
        ),
        Bracket::Tuple | Bracket::Record | Bracket::Subscope => {
            let mut tuple = Tuple::new();
            for (k, v) in items {
                match k {
                    Some(k) => tuple.push_named(k, v),
                    None => tuple.push(v),
                }
            }
            Value::Tuple(tuple)
        }
    }
}

/// Resumable interpreter for one scope
#[derive(Debug)]
pub struct ScopeMachine {
    ctx: ScopeContext,
    buffer: Vec<u8>,
    /// Global offset of `buffer[0]`
    base: usize,
    /// Global offset of the next instruction
    pos: usize,
    input_complete: bool,
    /// Consumed input is kept for backward jumps
    retain: bool,
    frames: Vec<Frame>,
    vars: HashMap<String, Value>,
    internals: HashMap<String, Value>,
    reserved: HashMap<Reserved, Value>,
    result_override: Option<Value>,
    awaiting: Option<Resume>,
    inbox: Option<(Resume, Value)>,
    ended: bool,
    done: Option<Value>,
    reads: Option<BTreeSet<PointerId>>,
    executed: u64,
}

impl ScopeMachine {
    pub fn new(ctx: ScopeContext) -> Self {
        ScopeMachine {
            ctx,
            buffer: Vec::new(),
            base: 0,
            pos: 0,
            input_complete: false,
            retain: false,
            frames: vec![Frame::default()],
            vars: HashMap::new(),
            internals: HashMap::new(),
            reserved: HashMap::new(),
            result_override: None,
            awaiting: None,
            inbox: None,
            ended: false,
            done: None,
            reads: None,
            executed: 0,
        }
    }

    /// Machine over a complete body; the input is kept so loops can jump back
    pub fn with_body(ctx: ScopeContext, body: &[u8]) -> Self {
        let mut machine = ScopeMachine::new(ctx);
        machine.buffer = body.to_vec();
        machine.input_complete = true;
        machine.retain = true;
        machine
    }

    /// Machine running a closure with its captures and bound arguments
    pub fn for_closure(ctx: ScopeContext, closure: &Closure, args: Value) -> Self {
        let mut machine = ScopeMachine::with_body(ctx, &closure.body);
        for (name, value) in &closure.captures {
            machine.vars.insert(name.clone(), value.clone());
        }
        match &args {
            Value::Tuple(t) => {
                let mut positional = 0;
                for param in &closure.params {
                    let value = match t.get_named(param) {
                        Some(v) => v.clone(),
                        None => {
                            let v = t.get_index(positional).cloned().unwrap_or_default();
                            positional += 1;
                            v
                        }
                    };
                    machine.vars.insert(param.clone(), value);
                }
            }
            Value::Void => {
                for param in &closure.params {
                    machine.vars.insert(param.clone(), Value::Void);
                }
            }
            single => {
                for (i, param) in closure.params.iter().enumerate() {
                    let value = if i == 0 { single.clone() } else { Value::Void };
                    machine.vars.insert(param.clone(), value);
                }
            }
        }
        machine.reserved.insert(Reserved::It, args);
        machine
    }

    pub fn context(&self) -> &ScopeContext {
        &self.ctx
    }

    /// Append input; consumed bytes are dropped unless a cache point is active
    pub fn feed(&mut self, bytes: &[u8]) {
        if !self.retain {
            let consumed = self.pos.saturating_sub(self.base).min(self.buffer.len());
            if consumed > 0 {
                self.buffer.drain(..consumed);
                self.base += consumed;
            }
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// No more input will arrive
    pub fn finish_input(&mut self) {
        self.input_complete = true;
    }

    pub fn is_input_complete(&self) -> bool {
        self.input_complete
    }

    /// Global offset of the next instruction
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes currently held in the input buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn instruction_count(&self) -> u64 {
        self.executed
    }

    pub fn is_done(&self) -> bool {
        self.done.is_some()
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaiting.is_some()
    }

    pub fn result(&self) -> Option<&Value> {
        self.done.as_ref()
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Start recording which pointers the scope reads
    pub fn track_reads(&mut self) {
        self.reads = Some(BTreeSet::new());
    }

    pub fn take_reads(&mut self) -> Vec<PointerId> {
        self.reads.take().map(|r| r.into_iter().collect()).unwrap_or_default()
    }

    /// Hand back the outcome of the last `Step::Await`
    pub fn resume(&mut self, outcome: DatexResult<Value>) -> DatexResult<()> {
        let resume = self
            .awaiting
            .take()
            .ok_or_else(|| DatexError::Runtime("scope is not waiting for anything".into()))?;
        self.inbox = Some((resume, outcome?));
        Ok(())
    }

    /// Step until the machine needs input, awaits, or finishes
    pub fn run(&mut self, reg: &mut PointerRegistry) -> DatexResult<Step> {
        loop {
            match self.step(reg)? {
                Step::Progress => continue,
                other => return Ok(other),
            }
        }
    }

    pub fn step(&mut self, reg: &mut PointerRegistry) -> DatexResult<Step> {
        if let Some(value) = &self.done {
            return Ok(Step::Done(value.clone()));
        }
        if self.awaiting.is_some() {
            return Err(DatexError::Runtime("scope is waiting for a suspension to resolve".into()));
        }
        if let Some((resume, value)) = self.inbox.take() {
            let Some(next) = self.peek(self.pos) else {
                self.inbox = Some((resume, value));
                return Ok(Step::NeedMore);
            };
            let flow = self.complete(reg, resume, value, next)?;
            return Ok(self.into_step(flow));
        }
        if self.ended {
            let flow = self.finish(reg)?;
            return Ok(self.into_step(flow));
        }

        let local = self.pos.saturating_sub(self.base);
        if local >= self.buffer.len() {
            if !self.input_complete {
                return Ok(Step::NeedMore);
            }
            self.ended = true;
            let flow = self.finish(reg)?;
            return Ok(self.into_step(flow));
        }

        let (instruction, next_pos) = {
            let mut r = ByteReader::at(&self.buffer, local);
            let byte = r.u8()?;
            let op = Opcode::from_byte(byte)
                .ok_or_else(|| DatexError::Runtime(format!("unknown opcode 0x{:02x} at {}", byte, self.pos)))?;
            match read_instruction(&mut r, op) {
                Ok(instruction) => (instruction, self.base + r.position()),
                Err(e) if e.is_incomplete() && !self.input_complete => return Ok(Step::NeedMore),
                Err(e) if e.is_incomplete() => {
                    return Err(DatexError::Syntax(format!("truncated {} at {}", op, self.pos)));
                }
                Err(e) => return Err(e),
            }
        };
        let Some(next) = self.peek(next_pos) else {
            return Ok(Step::NeedMore);
        };

        self.pos = next_pos;
        self.executed += 1;
        let flow = self.execute(reg, instruction, next)?;
        Ok(self.into_step(flow))
    }

    /// Opcode at `at`; `None` while it has not arrived yet
    fn peek(&self, at: usize) -> Option<Option<Opcode>> {
        match at.checked_sub(self.base).and_then(|i| self.buffer.get(i)) {
            Some(b) => Some(Opcode::from_byte(*b)),
            None if self.input_complete => Some(None),
            None => None,
        }
    }

    fn into_step(&mut self, flow: Flow) -> Step {
        match flow {
            Flow::Continue => Step::Progress,
            Flow::Suspend(resume, suspension) => {
                self.awaiting = Some(resume);
                Step::Await(suspension)
            }
            Flow::Done(value) => {
                self.done = Some(value.clone());
                Step::Done(value)
            }
        }
    }

    fn top(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn require_executable(&self, what: &str) -> DatexResult<()> {
        if self.ctx.executable {
            Ok(())
        } else {
            Err(DatexError::Permission(format!("{} is not allowed in this scope", what)))
        }
    }

    fn track(&mut self, id: PointerId) {
        if let Some(reads) = &mut self.reads {
            reads.insert(id);
        }
    }

    fn deref(&mut self, reg: &PointerRegistry, value: &Value) -> Value {
        if let Value::Pointer(id) = value {
            self.track(*id);
        }
        reg.deref(value)
    }

    fn take_active(&mut self, what: &str) -> DatexResult<(Value, Option<Place>)> {
        let frame = self.top();
        match frame.active.take() {
            Some(value) => Ok((value, frame.place.take())),
            None => Err(DatexError::Syntax(format!("missing operand before {}", what))),
        }
    }

    fn complete(&mut self, reg: &mut PointerRegistry, resume: Resume, value: Value, next: Option<Opcode>) -> DatexResult<Flow> {
        match resume {
            Resume::Deliver => self.deliver(reg, value, None, next),
            Resume::Assert => {
                if self.deref(reg, &value).is_truthy() {
                    Ok(Flow::Continue)
                } else {
                    Err(DatexError::Assertion("assertion failed".into()))
                }
            }
            Resume::Iterate => {
                let items = match self.deref(reg, &value) {
                    Value::Iterator(items) | Value::Array(items) => items,
                    Value::Void => Vec::new(),
                    other => vec![other],
                };
                self.deliver(reg, Value::Iterator(items), None, next)
            }
            Resume::Pointer(id) => {
                self.track(id);
                self.deliver(reg, Value::Pointer(id), Some(Place::new(PlaceRoot::Pointer(id))), next)
            }
        }
    }

    /// Feed a finished value into the current frame
    fn deliver(
        &mut self,
        reg: &mut PointerRegistry,
        mut value: Value,
        mut place: Option<Place>,
        next: Option<Opcode>,
    ) -> DatexResult<Flow> {
        let access_next = matches!(next, Some(Opcode::CHILD_GET | Opcode::CHILD_GET_REF));
        let infix_next = next.map_or(false, is_infix);
        loop {
            let frame = self.top();
            let pending = match frame.pending.pop() {
                Some(p) => p,
                None => match frame.active.take() {
                    Some(Value::Function(f)) if f.kind == BlockKind::Function => {
                        frame.place = None;
                        Pending::Call(f)
                    }
                    _ => {
                        frame.active = Some(value);
                        frame.place = place;
                        return Ok(Flow::Continue);
                    }
                },
            };

            let defer = match &pending {
                Pending::ChildGet { .. } => false,
                Pending::Binary { .. } | Pending::Unary(_) => access_next,
                _ => access_next || infix_next,
            };
            if defer {
                let frame = self.top();
                frame.pending.push(pending);
                frame.active = Some(value);
                frame.place = place;
                return Ok(Flow::Continue);
            }

            match pending {
                Pending::Cast(t) => {
                    value = self.cast(reg, &t, value)?;
                    place = None;
                }
                Pending::Unary(op) => {
                    value = self.unary(reg, op, value)?;
                    place = None;
                }
                Pending::Binary { op, left } => {
                    value = self.binary(reg, op, left, value)?;
                    place = None;
                }
                Pending::ChildGet { parent, place: at, by_ref } => {
                    let (v, p) = self.child_get(reg, parent, at, value, by_ref)?;
                    value = v;
                    place = p;
                }
                Pending::ChildSetKey { parent, place: at, action } => {
                    let key = self.deref(reg, &value);
                    self.top().pending.push(Pending::ChildSetValue {
                        parent,
                        place: at,
                        key,
                        action,
                    });
                    return Ok(Flow::Continue);
                }
                Pending::ChildSetValue {
                    parent,
                    place: at,
                    key,
                    action,
                } => {
                    self.child_set(reg, parent, at, key, value, action)?;
                    return Ok(Flow::Continue);
                }
                Pending::Assign { target, action } => {
                    self.assign(reg, target, action, value)?;
                    return Ok(Flow::Continue);
                }
                Pending::Jump { when, target } => {
                    if self.deref(reg, &value).is_truthy() == when {
                        self.jump(target)?;
                    }
                    return Ok(Flow::Continue);
                }
                Pending::Spread => {
                    self.top().spread = true;
                }
                Pending::Call(function) => {
                    self.require_executable("function call")?;
                    return Ok(Flow::Suspend(Resume::Deliver, Suspension::Call { function, args: value }));
                }
            }
        }
    }

    /// Resolve everything pending in the current frame
    fn settle(&mut self, reg: &mut PointerRegistry) -> DatexResult<Flow> {
        loop {
            let frame = self.top();
            if frame.pending.is_empty() {
                return Ok(Flow::Continue);
            }
            let flow = match frame.active.take() {
                Some(value) => {
                    let place = frame.place.take();
                    self.deliver(reg, value, place, None)?
                }
                None => match frame.pending.pop() {
                    // a cast with nothing to apply to is a type value
                    Some(Pending::Cast(t)) => self.deliver(reg, Value::Type(t), None, None)?,
                    _ => return Err(DatexError::Syntax("incomplete expression".into())),
                },
            };
            if !matches!(flow, Flow::Continue) {
                return Ok(flow);
            }
        }
    }

    fn finish(&mut self, reg: &mut PointerRegistry) -> DatexResult<Flow> {
        if self.frames.len() > 1 {
            return Err(DatexError::Syntax("unclosed bracket at end of scope".into()));
        }
        let flow = self.settle(reg)?;
        if !matches!(flow, Flow::Continue) {
            return Ok(flow);
        }
        let root = &mut self.frames[0];
        let value = self
            .result_override
            .take()
            .or_else(|| root.active.take())
            .or_else(|| root.result.take())
            .unwrap_or_default();
        Ok(Flow::Done(value))
    }

    fn jump(&mut self, target: u32) -> DatexResult<()> {
        let target = target as usize;
        if target < self.base {
            return Err(DatexError::Syntax(format!(
                "jump target {} was already discarded; a cache point is required",
                target
            )));
        }
        self.pos = target;
        Ok(())
    }

    fn finish_element(&mut self, reg: &mut PointerRegistry) -> DatexResult<()> {
        let frame = self.top();
        let spread = std::mem::take(&mut frame.spread);
        frame.place = None;
        let Some(value) = frame.active.take() else {
            return Ok(());
        };
        let key = frame.key.take();
        if spread {
            let value = self.deref(reg, &value);
            spread_into(&mut self.top().items, value)
        } else {
            self.top().items.push((key, value));
            Ok(())
        }
    }

    fn execute(&mut self, reg: &mut PointerRegistry, instruction: Instruction, next: Option<Opcode>) -> DatexResult<Flow> {
        match instruction {
            Instruction::End => {
                self.ended = true;
                self.finish(reg)
            }
            Instruction::CloseAndStore => {
                let flow = self.settle(reg)?;
                if !matches!(flow, Flow::Continue) {
                    return Ok(flow);
                }
                let frame = self.top();
                if frame.bracket.map_or(true, |b| b == Bracket::Subscope) {
                    if let Some(value) = frame.active.take() {
                        frame.result = Some(value);
                    }
                    frame.place = None;
                    Ok(Flow::Continue)
                } else {
                    self.finish_element(reg)?;
                    Ok(Flow::Continue)
                }
            }
            Instruction::Return => {
                let flow = self.settle(reg)?;
                if !matches!(flow, Flow::Continue) {
                    return Ok(flow);
                }
                let frame = self.top();
                let value = frame.active.take().or_else(|| frame.result.take()).unwrap_or_default();
                Ok(Flow::Done(value))
            }
            Instruction::Value(value) => self.deliver(reg, value, None, next),
            Instruction::Type(t) => {
                if next.map_or(true, Opcode::defers_cast) {
                    self.deliver(reg, Value::Type(t), None, next)
                } else {
                    self.top().pending.push(Pending::Cast(t));
                    Ok(Flow::Continue)
                }
            }
            Instruction::Open(bracket) => {
                self.frames.push(Frame::open(bracket));
                Ok(Flow::Continue)
            }
            Instruction::Close(bracket) => self.close(reg, bracket, next),
            Instruction::Element(key) => {
                if self.frames.len() == 1 {
                    return Err(DatexError::Syntax("element outside of a collection".into()));
                }
                let flow = self.settle(reg)?;
                if !matches!(flow, Flow::Continue) {
                    return Ok(flow);
                }
                self.finish_element(reg)?;
                self.top().key = key;
                Ok(Flow::Continue)
            }
            Instruction::Reserved(var, Access::Get) => {
                let value = self.reserved_value(var);
                let place = var.is_settable().then(|| Place::new(PlaceRoot::Reserved(var)));
                self.deliver(reg, value, place, next)
            }
            Instruction::Reserved(var, access) => {
                if !var.is_settable() {
                    return Err(DatexError::Runtime(format!("{:?} cannot be assigned", var)));
                }
                self.push_assign(AssignTarget::Reserved(var), access);
                Ok(Flow::Continue)
            }
            Instruction::Var(name, Access::Get) => {
                let name = name.to_string();
                let value = self.vars.get(&name).cloned().ok_or_else(|| undefined(&name))?;
                self.deliver(reg, value, Some(Place::new(PlaceRoot::Var(name))), next)
            }
            Instruction::Var(name, access) => {
                self.push_assign(AssignTarget::Var(name.to_string()), access);
                Ok(Flow::Continue)
            }
            Instruction::Internal(name, Access::Get) => {
                let name = name.to_string();
                let value = self.internals.get(&name).cloned().unwrap_or_default();
                self.deliver(reg, value, Some(Place::new(PlaceRoot::Internal(name))), next)
            }
            Instruction::Internal(name, access) => {
                let name = name.to_string();
                if name == "sender" && !self.ctx.impersonation {
                    return Err(DatexError::Permission("cannot assign #sender without impersonation".into()));
                }
                self.push_assign(AssignTarget::Internal(name), access);
                Ok(Flow::Continue)
            }
            Instruction::Label(name, Access::Get) => {
                let name = name.to_string();
                let id = reg
                    .resolve_label(&name)
                    .ok_or_else(|| DatexError::Pointer(format!("label {} does not exist", name)))?;
                self.track(id);
                self.deliver(reg, Value::Pointer(id), Some(Place::new(PlaceRoot::Pointer(id))), next)
            }
            Instruction::Label(name, access) => {
                self.require_executable("label assignment")?;
                self.push_assign(AssignTarget::Label(name.to_string()), access);
                Ok(Flow::Continue)
            }
            Instruction::Pointer(id, Access::Get) => {
                self.track(id);
                if reg.load_local(id)?.is_some() {
                    self.deliver(reg, Value::Pointer(id), Some(Place::new(PlaceRoot::Pointer(id))), next)
                } else {
                    Ok(Flow::Suspend(Resume::Pointer(id), Suspension::LoadPointer(id)))
                }
            }
            Instruction::Pointer(id, access) => {
                self.require_executable("pointer assignment")?;
                self.push_assign(AssignTarget::Pointer(id), access);
                Ok(Flow::Continue)
            }
            Instruction::ChildGet { by_ref } => {
                let (parent, place) = self.take_active("property access")?;
                self.top().pending.push(Pending::ChildGet { parent, place, by_ref });
                Ok(Flow::Continue)
            }
            Instruction::ChildSet => {
                let (parent, place) = self.take_active("property assignment")?;
                self.top().pending.push(Pending::ChildSetKey {
                    parent,
                    place,
                    action: None,
                });
                Ok(Flow::Continue)
            }
            Instruction::ChildAction(action) => {
                let (parent, place) = self.take_active("property assignment")?;
                self.top().pending.push(Pending::ChildSetKey {
                    parent,
                    place,
                    action: Some(action),
                });
                Ok(Flow::Continue)
            }
            Instruction::Jump { condition: None, target } => {
                self.jump(target)?;
                Ok(Flow::Continue)
            }
            Instruction::Jump {
                condition: Some(when),
                target,
            } => {
                self.top().pending.push(Pending::Jump { when, target });
                Ok(Flow::Continue)
            }
            Instruction::Binary(op) => {
                let (left, _) = self.take_active(op.mnemonic())?;
                self.top().pending.push(Pending::Binary { op, left });
                Ok(Flow::Continue)
            }
            Instruction::Unary(op) => {
                self.top().pending.push(Pending::Unary(op));
                Ok(Flow::Continue)
            }
            Instruction::Block(def) => self.block(reg, def, next),
            Instruction::CachePoint => {
                self.retain = true;
                Ok(Flow::Continue)
            }
            Instruction::CacheReset => {
                self.retain = false;
                Ok(Flow::Continue)
            }
            Instruction::Spread => {
                self.top().pending.push(Pending::Spread);
                Ok(Flow::Continue)
            }
        }
    }

    fn push_assign(&mut self, target: AssignTarget, access: Access) {
        let action = match access {
            Access::Action(a) => Some(a),
            _ => None,
        };
        self.top().pending.push(Pending::Assign { target, action });
    }

    fn close(&mut self, reg: &mut PointerRegistry, bracket: Bracket, next: Option<Opcode>) -> DatexResult<Flow> {
        if self.frames.len() == 1 {
            return Err(DatexError::Syntax(format!("unexpected closing {:?}", bracket)));
        }
        let flow = self.settle(reg)?;
        if !matches!(flow, Flow::Continue) {
            return Ok(flow);
        }
        if self.top().bracket != Some(bracket) {
            return Err(DatexError::Syntax(format!("mismatched closing {:?}", bracket)));
        }
        let value = if bracket == Bracket::Subscope {
            let frame = self.top();
            frame.active.take().or_else(|| frame.result.take()).unwrap_or_default()
        } else {
            self.finish_element(reg)?;
            build_collection(bracket, std::mem::take(&mut self.top().items))
        };
        self.frames.pop();
        self.deliver(reg, value, None, next)
    }

    fn reserved_value(&self, var: Reserved) -> Value {
        match var {
            Reserved::Result => self
                .result_override
                .clone()
                .or_else(|| self.frames[0].result.clone())
                .unwrap_or_default(),
            Reserved::SubResult => self.frames.last().and_then(|f| f.result.clone()).unwrap_or_default(),
            Reserved::Origin => self
                .reserved
                .get(&var)
                .cloned()
                .unwrap_or_else(|| self.ctx.sender_value()),
            Reserved::Sender => self.ctx.sender_value(),
            Reserved::Current => Value::Target(Target::Endpoint(self.ctx.local.clone())),
            Reserved::Encrypted => Value::Bool(self.ctx.encrypted),
            Reserved::Signed => Value::Bool(self.ctx.signed),
            Reserved::Timestamp => Value::Int(self.ctx.timestamp.as_millis() as i64),
            Reserved::Meta => self.ctx.meta(),
            Reserved::Static => Value::Object(Object::new()),
            Reserved::Root | Reserved::Remote | Reserved::It | Reserved::Iter | Reserved::This => {
                self.reserved.get(&var).cloned().unwrap_or_default()
            }
        }
    }

    fn slot_mut(&mut self, root: &PlaceRoot) -> DatexResult<&mut Value> {
        match root {
            PlaceRoot::Var(name) => self.vars.get_mut(name).ok_or_else(|| undefined(name)),
            PlaceRoot::Internal(name) => Ok(self.internals.entry(name.clone()).or_default()),
            PlaceRoot::Reserved(Reserved::Result) => Ok(self.result_override.get_or_insert_with(Value::default)),
            PlaceRoot::Reserved(var) => Ok(self.reserved.entry(*var).or_default()),
            PlaceRoot::Pointer(id) => Err(DatexError::Runtime(format!("pointer {} has no local slot", id))),
        }
    }

    fn cast(&mut self, reg: &PointerRegistry, t: &DatexType, value: Value) -> DatexResult<Value> {
        let value = match (&value, t.std_type()) {
            (Value::Pointer(_), Some(StdType::Target | StdType::Pointer | StdType::Any)) => value,
            (Value::Pointer(_), _) => self.deref(reg, &value),
            _ => value,
        };
        t.cast(value)
    }

    fn binary(&mut self, reg: &PointerRegistry, op: Opcode, left: Value, right: Value) -> DatexResult<Value> {
        // identity compares references, everything else their values
        if matches!(op, Opcode::EQUAL | Opcode::NOT_EQUAL)
            && (matches!(left, Value::Pointer(_)) || matches!(right, Value::Pointer(_)))
        {
            let same = left == right;
            return Ok(Value::Bool(if op == Opcode::EQUAL { same } else { !same }));
        }
        let left = self.deref(reg, &left);
        let right = self.deref(reg, &right);
        ops::binary(op, &left, &right)
    }

    fn pointer_arg(value: &Value) -> DatexResult<PointerId> {
        match value {
            Value::Pointer(id) | Value::Target(Target::Pointer(id)) => Ok(*id),
            other => Err(DatexError::Value(format!("{} is not a pointer", DatexType::of(other)))),
        }
    }

    fn unary(&mut self, reg: &mut PointerRegistry, op: Opcode, value: Value) -> DatexResult<Value> {
        match op {
            Opcode::NOT => ops::not(&self.deref(reg, &value)),
            Opcode::COUNT => ops::count(&self.deref(reg, &value)),
            Opcode::KEYS => ops::keys(&self.deref(reg, &value)),
            Opcode::GET_TYPE => Ok(Value::Type(DatexType::of(&self.deref(reg, &value)))),
            Opcode::VALUE => Ok(self.deref(reg, &value)),
            Opcode::AWAIT => Ok(value),
            Opcode::DEBUG => {
                tracing::debug!(value = %value, "debug");
                Ok(value)
            }
            Opcode::THROW_ERROR => Err(match self.deref(reg, &value) {
                Value::Error(e) => e,
                Value::Text(message) => DatexError::Runtime(message),
                other => DatexError::Runtime(other.to_string()),
            }),
            Opcode::FREEZE | Opcode::SEAL => {
                self.require_executable("sealing a pointer")?;
                if let Value::Pointer(id) = value {
                    reg.seal(id)?;
                }
                Ok(value)
            }
            Opcode::HOLD => {
                if let Value::Pointer(id) = value {
                    reg.retain(id)?;
                }
                Ok(value)
            }
            Opcode::SUBSCRIBE => {
                self.require_executable("subscribing")?;
                let id = Self::pointer_arg(&value)?;
                let sender = self
                    .ctx
                    .sender
                    .clone()
                    .ok_or_else(|| DatexError::Permission("anonymous senders cannot subscribe".into()))?;
                let pointer = reg.get(id).ok_or_else(|| missing_pointer(id))?;
                if !reg.is_local_origin(pointer) {
                    return Err(DatexError::Pointer(format!("{} is not the origin of pointer {}", reg.local(), id)));
                }
                reg.add_subscriber(id, sender)?;
                reg.value(id).ok_or_else(|| missing_pointer(id))
            }
            Opcode::UNSUBSCRIBE => {
                self.require_executable("unsubscribing")?;
                let id = Self::pointer_arg(&value)?;
                if let Some(sender) = self.ctx.sender.clone() {
                    reg.remove_subscriber(id, &sender)?;
                }
                Ok(Value::Void)
            }
            Opcode::ORIGIN => {
                let id = Self::pointer_arg(&value)?;
                let origin = match reg.get(id) {
                    Some(p) => p.origin().clone(),
                    None => reg.origin_of(&id).ok_or_else(|| missing_pointer(id))?,
                };
                Ok(Value::Target(Target::Endpoint(origin)))
            }
            Opcode::SUBSCRIBERS => {
                let id = Self::pointer_arg(&value)?;
                let pointer = reg.get(id).ok_or_else(|| missing_pointer(id))?;
                Ok(Value::Array(
                    pointer
                        .subscribers()
                        .map(|e| Value::Target(Target::Endpoint(e.clone())))
                        .collect(),
                ))
            }
            Opcode::CREATE_POINTER => Ok(Value::Pointer(reg.pointer_for(value)?)),
            Opcode::DELETE_POINTER => {
                self.require_executable("deleting a pointer")?;
                reg.delete(Self::pointer_arg(&value)?)?;
                Ok(Value::Void)
            }
            other => Err(DatexError::Runtime(format!("{} is not a unary operator", other))),
        }
    }

    fn child_get(
        &mut self,
        reg: &PointerRegistry,
        parent: Value,
        at: Option<Place>,
        key: Value,
        by_ref: bool,
    ) -> DatexResult<(Value, Option<Place>)> {
        let key = self.deref(reg, &key);
        let value = match &parent {
            Value::Pointer(id) => {
                self.track(*id);
                let pointer = reg.get(*id).ok_or_else(|| missing_pointer(*id))?;
                if key == Value::Wildcard {
                    let values = pointer.keys().iter().map(|k| pointer.get(k)).collect::<DatexResult<Vec<_>>>()?;
                    Value::Iterator(values)
                } else {
                    pointer.get(&key)?
                }
            }
            other if key == Value::Wildcard => {
                let values = other.keys().iter().map(|k| other.child(k)).collect::<DatexResult<Vec<_>>>()?;
                Value::Iterator(values)
            }
            other => other.child(&key)?,
        };

        let place = match (&value, &parent) {
            (Value::Pointer(id), _) => Some(Place::new(PlaceRoot::Pointer(*id))),
            (_, Value::Pointer(id)) => Some(Place {
                root: PlaceRoot::Pointer(*id),
                path: vec![key],
            }),
            _ => at.map(|mut p| {
                p.path.push(key);
                p
            }),
        };

        // primitive pointers read through unless a reference was asked for
        if let Value::Pointer(id) = &value {
            if !by_ref && reg.get(*id).map_or(false, |p| p.is_primitive()) {
                let inner = self.deref(reg, &value);
                return Ok((inner, place));
            }
        }
        Ok((value, place))
    }

    fn child_set(
        &mut self,
        reg: &mut PointerRegistry,
        parent: Value,
        at: Option<Place>,
        key: Value,
        value: Value,
        action: Option<ActionKind>,
    ) -> DatexResult<()> {
        if let Value::Pointer(id) = parent {
            return self.pointer_child_set(reg, id, key, value, action);
        }
        let Some(place) = at else {
            // property of a temporary value
            return Ok(());
        };
        match place.root {
            PlaceRoot::Pointer(id) => {
                self.require_executable("pointer mutation")?;
                let Some((head, rest)) = place.path.split_first() else {
                    return self.pointer_child_set(reg, id, key, value, action);
                };
                let pointer = reg.get(id).ok_or_else(|| missing_pointer(id))?;
                let mut child = pointer.get(head)?;
                set_nested(&mut child, rest, &key, value, action)?;
                reg.set_property(id, head.clone(), child)
            }
            root => {
                let slot = self.slot_mut(&root)?;
                set_nested(slot, &place.path, &key, value, action)
            }
        }
    }

    fn pointer_child_set(
        &mut self,
        reg: &mut PointerRegistry,
        id: PointerId,
        key: Value,
        value: Value,
        action: Option<ActionKind>,
    ) -> DatexResult<()> {
        self.require_executable("pointer mutation")?;
        let current = reg.value(id).ok_or_else(|| missing_pointer(id))?;
        if let Some(action) = action {
            let child = reg.get(id).ok_or_else(|| missing_pointer(id))?.get(&key)?;
            if let Value::Pointer(child_id) = child {
                return self.pointer_action(reg, child_id, action, value);
            }
            let updated = ops::apply_action(action, child, self.deref(reg, &value))?;
            return reg.set_property(id, key, updated);
        }
        if key == Value::Wildcard && value.is_void() {
            return reg.clear(id);
        }
        let splice = match (&key, &value, &current) {
            (Value::Tuple(range), Value::Array(_), Value::Array(_)) => Some(splice_range(range)?),
            _ => None,
        };
        match (splice, value) {
            (Some((start, count)), Value::Array(items)) => reg.splice(id, start, count, items),
            (_, value) => reg.set_property(id, key, value),
        }
    }

    fn pointer_action(&mut self, reg: &mut PointerRegistry, id: PointerId, action: ActionKind, value: Value) -> DatexResult<()> {
        self.require_executable("pointer mutation")?;
        let current = reg.value(id).ok_or_else(|| missing_pointer(id))?;
        match action {
            ActionKind::Add if current.is_compound() => reg.add(id, value),
            ActionKind::Subtract if current.is_compound() => reg.remove(id, value),
            ActionKind::CreatePointer => Err(DatexError::Runtime("cannot create a pointer in place of a pointer".into())),
            _ => {
                let value = self.deref(reg, &value);
                reg.set_value(id, ops::apply_action(action, current, value)?)
            }
        }
    }

    fn assign(&mut self, reg: &mut PointerRegistry, target: AssignTarget, action: Option<ActionKind>, value: Value) -> DatexResult<()> {
        match target {
            AssignTarget::Var(name) => self.assign_slot(reg, PlaceRoot::Var(name), action, value),
            AssignTarget::Internal(name) => self.assign_slot(reg, PlaceRoot::Internal(name), action, value),
            AssignTarget::Reserved(var) => self.assign_slot(reg, PlaceRoot::Reserved(var), action, value),
            AssignTarget::Label(name) => match action {
                None => {
                    let id = match value {
                        Value::Pointer(id) if reg.contains(id) => id,
                        other => reg.pointer_for(other)?,
                    };
                    reg.add_label(id, name)
                }
                Some(action) => {
                    let id = reg
                        .resolve_label(&name)
                        .ok_or_else(|| DatexError::Pointer(format!("label {} does not exist", name)))?;
                    self.pointer_action(reg, id, action, value)
                }
            },
            AssignTarget::Pointer(id) => match action {
                None if reg.contains(id) => reg.set_value(id, value),
                None => {
                    let origin = reg.origin_of(&id);
                    reg.create(
                        value,
                        PointerOptions {
                            id: Some(id),
                            origin,
                            ..Default::default()
                        },
                    )?;
                    Ok(())
                }
                Some(action) => self.pointer_action(reg, id, action, value),
            },
        }
    }

    fn assign_slot(&mut self, reg: &mut PointerRegistry, root: PlaceRoot, action: Option<ActionKind>, value: Value) -> DatexResult<()> {
        let value = match action {
            None => value,
            Some(ActionKind::CreatePointer) => Value::Pointer(reg.pointer_for(value)?),
            Some(action) => {
                let current = match &root {
                    PlaceRoot::Var(name) => self.vars.get(name).cloned().ok_or_else(|| undefined(name))?,
                    other => self.slot_mut(other)?.clone(),
                };
                if let Value::Pointer(id) = current {
                    return self.pointer_action(reg, id, action, value);
                }
                let value = self.deref(reg, &value);
                ops::apply_action(action, current, value)?
            }
        };
        match root {
            PlaceRoot::Var(name) => {
                self.vars.insert(name, value);
            }
            other => *self.slot_mut(&other)? = value,
        }
        Ok(())
    }

    fn block(&mut self, reg: &mut PointerRegistry, def: BlockDef, next: Option<Opcode>) -> DatexResult<Flow> {
        let captures = def
            .captures
            .iter()
            .map(|name| (name.clone(), self.vars.get(name).cloned().unwrap_or_default()))
            .collect();
        let closure = Arc::new(Closure {
            kind: def.kind,
            params: def.params,
            captures,
            body: def.body,
        });
        let call = |function: Arc<Closure>| Suspension::Call {
            function,
            args: Value::Void,
        };
        match closure.kind {
            BlockKind::Scope | BlockKind::Function => self.deliver(reg, Value::Function(closure), None, next),
            BlockKind::Do => {
                self.require_executable("do")?;
                Ok(Flow::Suspend(Resume::Deliver, call(closure)))
            }
            BlockKind::Assert => {
                self.require_executable("assert")?;
                Ok(Flow::Suspend(Resume::Assert, call(closure)))
            }
            BlockKind::Iterator => {
                self.require_executable("iterator")?;
                Ok(Flow::Suspend(Resume::Iterate, call(closure)))
            }
            BlockKind::Transform => {
                self.require_executable("transform")?;
                Ok(Flow::Suspend(Resume::Deliver, Suspension::Transform { closure }))
            }
            BlockKind::Remote => {
                self.require_executable("remote execution")?;
                let (target, _) = self.take_active("remote block")?;
                let receivers = match self.deref(reg, &target) {
                    Value::Filter(cnf) => cnf,
                    Value::Target(t) => Cnf::target(t),
                    other => {
                        return Err(DatexError::Type(format!(
                            "cannot execute remotely on {}",
                            DatexType::of(&other)
                        )));
                    }
                };
                Ok(Flow::Suspend(Resume::Deliver, Suspension::Remote { receivers, closure }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::{Endpoint, EndpointId};
    use datex_pointer::RegistryConfig;
    use datex_wire::InstructionBuilder;

    fn alice() -> Endpoint {
        Endpoint::person("alice")
    }

    fn registry() -> PointerRegistry {
        PointerRegistry::new(alice(), RegistryConfig::default())
    }

    fn run_with(reg: &mut PointerRegistry, ctx: ScopeContext, program: &[u8]) -> DatexResult<Value> {
        let mut machine = ScopeMachine::new(ctx);
        machine.feed(program);
        machine.finish_input();
        match machine.run(reg)? {
            Step::Done(value) => Ok(value),
            other => panic!("unexpected step {:?}", other),
        }
    }

    fn run(program: &[u8]) -> DatexResult<Value> {
        run_with(&mut registry(), ScopeContext::local(alice()), program)
    }

    fn pointer_id(n: u8) -> PointerId {
        PointerId::new_default(EndpointId([n; 12]), [n; 8], 0, n)
    }

    #[test]
    fn test_addition() {
        let mut b = InstructionBuilder::new();
        b.int(1).op(Opcode::ADD).int(2).end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_left_associative_chain() {
        let mut b = InstructionBuilder::new();
        b.int(10).op(Opcode::SUBTRACT).int(2).op(Opcode::SUBTRACT).int(3).end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_assignment_takes_whole_expression() {
        let mut b = InstructionBuilder::new();
        b.set_var("x").unwrap().int(1).op(Opcode::ADD).int(2).close_and_store();
        b.var("x").unwrap().op(Opcode::MULTIPLY).int(2).end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(6));
    }

    #[test]
    fn test_assignment_yields_no_value() {
        let mut b = InstructionBuilder::new();
        b.int(7).close_and_store();
        b.set_var("x").unwrap().int(1).end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_missing_variable() {
        let mut b = InstructionBuilder::new();
        b.var("nope").unwrap().end();
        assert!(matches!(run(b.as_slice()), Err(DatexError::Runtime(_))));
    }

    #[test]
    fn test_property_set_on_variable() {
        let mut b = InstructionBuilder::new();
        b.set_var("x").unwrap().op(Opcode::OBJECT_START);
        b.element_with_key("a").unwrap().int(1);
        b.element_with_key("inner").unwrap().op(Opcode::OBJECT_START).op(Opcode::OBJECT_END);
        b.op(Opcode::OBJECT_END).close_and_store();
        b.var("x").unwrap().child_set().text("b").int(2).close_and_store();
        b.var("x").unwrap().child_get().text("inner").child_set().text("c").int(3).close_and_store();
        b.var("x").unwrap().end();

        let Value::Object(obj) = run(b.as_slice()).unwrap() else {
            panic!("expected object");
        };
        assert_eq!(obj.get("a"), Some(&Value::Int(1)));
        assert_eq!(obj.get("b"), Some(&Value::Int(2)));
        let Some(Value::Object(inner)) = obj.get("inner") else {
            panic!("expected nested object");
        };
        assert_eq!(inner.get("c"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_property_access_binds_before_operator() {
        let mut b = InstructionBuilder::new();
        b.set_var("x").unwrap().op(Opcode::OBJECT_START);
        b.element_with_key("a").unwrap().int(4);
        b.op(Opcode::OBJECT_END).close_and_store();
        b.int(1).op(Opcode::ADD).var("x").unwrap().child_get().text("a").end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_pointer_property_set() {
        let mut reg = registry();
        let handle = reg.create_or_get(Value::Object(Object::new())).unwrap();
        let id = reg.resolve(handle).unwrap().id();

        let mut b = InstructionBuilder::new();
        b.pointer(id).child_set().text("a").int(5).close_and_store();
        b.pointer(id).child_get().text("a").end();
        let result = run_with(&mut reg, ScopeContext::local(alice()), b.as_slice()).unwrap();
        assert_eq!(result, Value::Int(5));
        let Some(Value::Object(obj)) = reg.value(id) else {
            panic!("expected object");
        };
        assert_eq!(obj.get("a"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_set_pointer_creates_with_id() {
        let mut reg = registry();
        let id = pointer_id(3);
        let mut b = InstructionBuilder::new();
        b.set_pointer(id).int(42).close_and_store();
        b.pointer_action(ActionKind::Add, id).int(1).end();
        run_with(&mut reg, ScopeContext::local(alice()), b.as_slice()).unwrap();
        assert_eq!(reg.value(id), Some(Value::Int(43)));
    }

    #[test]
    fn test_pointer_mutation_requires_executable() {
        let mut reg = registry();
        let mut b = InstructionBuilder::new();
        b.set_pointer(pointer_id(3)).int(1).end();
        let result = run_with(&mut reg, ScopeContext::detached(alice()), b.as_slice());
        assert!(matches!(result, Err(DatexError::Permission(_))));

        let mut b = InstructionBuilder::new();
        b.scope_block(BlockKind::Do, &[], &[], &[Opcode::END.to_byte()]).unwrap().end();
        let result = run_with(&mut reg, ScopeContext::detached(alice()), b.as_slice());
        assert!(matches!(result, Err(DatexError::Permission(_))));
    }

    #[test]
    fn test_sender_needs_impersonation() {
        let mut b = InstructionBuilder::new();
        b.set_internal_var("sender").unwrap().int(1).end();
        assert!(matches!(run(b.as_slice()), Err(DatexError::Permission(_))));
    }

    #[test]
    fn test_conditional_jump() {
        let mut b = InstructionBuilder::new();
        let at = b.jump_placeholder(Opcode::JFA);
        b.boolean(false).int(1).close_and_store();
        let target = b.position();
        b.patch_jump(at, target);
        b.int(2).end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(2));
    }

    fn counting_loop(cache_point: bool) -> Vec<u8> {
        let mut b = InstructionBuilder::new();
        if cache_point {
            b.op(Opcode::CACHE_POINT);
        }
        b.set_var("i").unwrap().int(0).close_and_store();
        let top = b.position();
        let exit = b.jump_placeholder(Opcode::JFA);
        b.var("i").unwrap().op(Opcode::LESS).int(3);
        b.var_action(ActionKind::Add, "i").unwrap().int(1).close_and_store();
        b.jump_to(Opcode::JMP, top);
        let end = b.position();
        b.patch_jump(exit, end);
        b.var("i").unwrap().end();
        b.into_vec()
    }

    #[test]
    fn test_loop() {
        assert_eq!(run(&counting_loop(false)).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_backward_jump_needs_cache_point() {
        for (cache_point, ok) in [(false, false), (true, true)] {
            let program = counting_loop(cache_point);
            let split = program.len() - 4;
            let mut reg = registry();
            let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
            machine.feed(&program[..split]);
            assert_eq!(machine.run(&mut reg).unwrap(), Step::NeedMore);
            machine.feed(&program[split..]);
            machine.finish_input();
            assert_eq!(machine.run(&mut reg).is_ok(), ok);
        }
    }

    #[test]
    fn test_casts() {
        let int = DatexType::std(StdType::Int);
        let mut b = InstructionBuilder::new();
        b.type_literal(&int).unwrap().text("42").end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(42));

        // the cast waits for the whole sum
        let mut b = InstructionBuilder::new();
        b.type_literal(&int).unwrap().text("4").op(Opcode::ADD).int(1).end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Int(41));

        let mut b = InstructionBuilder::new();
        b.type_literal(&int).unwrap().end();
        assert_eq!(run(b.as_slice()).unwrap(), Value::Type(int));
    }

    #[test]
    fn test_collections_and_spread() {
        let mut b = InstructionBuilder::new();
        b.set_var("a").unwrap().op(Opcode::ARRAY_START);
        b.element().int(1).element().int(2);
        b.op(Opcode::ARRAY_END).close_and_store();
        b.op(Opcode::ARRAY_START).element().int(0);
        b.element().op(Opcode::EXTEND).var("a").unwrap();
        b.element().int(3).op(Opcode::ARRAY_END).end();
        assert_eq!(
            run(b.as_slice()).unwrap(),
            Value::Array((0..4).map(Value::Int).collect())
        );

        let mut b = InstructionBuilder::new();
        b.op(Opcode::TUPLE_START);
        b.element_with_key("a").unwrap().int(1).element().int(2);
        b.op(Opcode::TUPLE_END).end();
        let Value::Tuple(t) = run(b.as_slice()).unwrap() else {
            panic!("expected tuple");
        };
        assert_eq!(t.get_named("a"), Some(&Value::Int(1)));
        assert_eq!(t.get_index(0), Some(&Value::Int(2)));
    }

    #[test]
    fn test_mismatched_bracket() {
        let mut b = InstructionBuilder::new();
        b.op(Opcode::ARRAY_START).element().int(1).op(Opcode::TUPLE_END).end();
        assert!(matches!(run(b.as_slice()), Err(DatexError::Syntax(_))));

        let mut b = InstructionBuilder::new();
        b.op(Opcode::ARRAY_START).element().int(1).end();
        assert!(matches!(run(b.as_slice()), Err(DatexError::Syntax(_))));
    }

    #[test]
    fn test_unknown_opcode() {
        let Some(byte) = (0u8..=255).find(|b| Opcode::from_byte(*b).is_none()) else {
            return;
        };
        assert!(matches!(run(&[byte]), Err(DatexError::Runtime(_))));
    }

    #[test]
    fn test_remote_pointer_suspends() {
        let mut reg = registry();
        let id = pointer_id(9);
        let mut b = InstructionBuilder::new();
        b.pointer(id).child_get().text("n").end();

        let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
        machine.feed(b.as_slice());
        machine.finish_input();
        assert_eq!(machine.run(&mut reg).unwrap(), Step::Await(Suspension::LoadPointer(id)));

        let mut obj = Object::new();
        obj.set("n", Value::Int(1));
        reg.create(
            Value::Object(obj),
            PointerOptions {
                id: Some(id),
                ..Default::default()
            },
        )
        .unwrap();
        machine.resume(Ok(Value::Void)).unwrap();
        assert_eq!(machine.run(&mut reg).unwrap(), Step::Done(Value::Int(1)));
    }

    #[test]
    fn test_loading_placeholder_suspends() {
        let mut reg = registry();
        let id = pointer_id(8);
        reg.create_placeholder(id, Endpoint::person("bob"));
        let mut b = InstructionBuilder::new();
        b.pointer(id).op(Opcode::ADD).int(1).end();

        let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
        machine.feed(b.as_slice());
        machine.finish_input();
        assert_eq!(machine.run(&mut reg).unwrap(), Step::Await(Suspension::LoadPointer(id)));

        reg.create(
            Value::Int(4),
            PointerOptions {
                id: Some(id),
                origin: Some(Endpoint::person("bob")),
                ..Default::default()
            },
        )
        .unwrap();
        machine.resume(Ok(Value::Pointer(id))).unwrap();
        assert_eq!(machine.run(&mut reg).unwrap(), Step::Done(Value::Int(5)));
    }

    #[test]
    fn test_function_call_suspends() {
        let mut b = InstructionBuilder::new();
        b.scope_block(BlockKind::Function, &["x".to_string()], &[], &[Opcode::END.to_byte()])
            .unwrap();
        b.op(Opcode::TUPLE_START).element().int(1).op(Opcode::TUPLE_END).end();

        let mut reg = registry();
        let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
        machine.feed(b.as_slice());
        machine.finish_input();
        let Step::Await(Suspension::Call { function, args }) = machine.run(&mut reg).unwrap() else {
            panic!("expected a call");
        };
        assert_eq!(function.params, vec!["x".to_string()]);
        assert_eq!(args, Value::Tuple(Tuple::from_values(vec![Value::Int(1)])));

        machine.resume(Ok(Value::Int(10))).unwrap();
        assert_eq!(machine.run(&mut reg).unwrap(), Step::Done(Value::Int(10)));
    }

    #[test]
    fn test_throw_error() {
        let mut b = InstructionBuilder::new();
        b.op(Opcode::THROW_ERROR).text("boom").end();
        assert_eq!(run(b.as_slice()), Err(DatexError::Runtime("boom".into())));
    }

    fn mixed_program() -> Vec<u8> {
        let mut b = InstructionBuilder::new();
        b.set_var("x").unwrap().op(Opcode::OBJECT_START);
        b.element_with_key("a").unwrap().text("hello world");
        b.op(Opcode::OBJECT_END).close_and_store();
        b.var("x").unwrap().child_set().text("b").int(300_000).close_and_store();
        let skip = b.jump_placeholder(Opcode::JMP);
        b.int(99).close_and_store();
        let target = b.position();
        b.patch_jump(skip, target);
        b.var("x").unwrap().child_get().text("b").op(Opcode::ADD).int(1).end();
        b.into_vec()
    }

    #[test]
    fn test_resumes_at_every_split() {
        let program = mixed_program();
        let expected = run(&program).unwrap();
        assert_eq!(expected, Value::Int(300_001));

        for split in 0..=program.len() {
            let mut reg = registry();
            let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
            machine.feed(&program[..split]);
            assert_eq!(machine.run(&mut reg).unwrap(), Step::NeedMore, "split at {}", split);
            machine.feed(&program[split..]);
            machine.finish_input();
            assert_eq!(machine.run(&mut reg).unwrap(), Step::Done(expected.clone()), "split at {}", split);
        }
    }

    #[test]
    fn test_compaction_drops_consumed_input() {
        let program = mixed_program();
        let mut reg = registry();
        let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
        machine.feed(&program[..20]);
        machine.run(&mut reg).unwrap();
        let consumed = machine.position();
        machine.feed(&program[20..]);
        assert_eq!(machine.buffered(), program.len() - consumed);
    }

    #[test]
    fn test_read_tracking() {
        let mut reg = registry();
        let handle = reg.create_or_get(Value::Int(2)).unwrap();
        let id = reg.resolve(handle).unwrap().id();
        let mut b = InstructionBuilder::new();
        b.pointer(id).op(Opcode::MULTIPLY).int(3).end();

        let mut machine = ScopeMachine::new(ScopeContext::local(alice()));
        machine.track_reads();
        machine.feed(b.as_slice());
        machine.finish_input();
        assert_eq!(machine.run(&mut reg).unwrap(), Step::Done(Value::Int(6)));
        assert_eq!(machine.take_reads(), vec![id]);
    }
}
