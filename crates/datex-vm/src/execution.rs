//! Call stack
//!
//! An `Execution` drives a root scope machine together with the machines
//! of the closures it calls. Calls and transforms are resolved here; only
//! pointer loads and remote execution reach the caller.

use std::sync::Arc;

use datex_core::{Closure, DatexError, DatexResult, PointerId, Value};
use datex_pointer::{PointerOptions, PointerRegistry};

use crate::{ScopeContext, ScopeMachine, Step, Suspension};

/// Nested calls deeper than this fail with a runtime error
pub const MAX_CALL_DEPTH: usize = 256;

/// Transform chains longer than this are cut off in one update pass
const MAX_TRANSFORM_ROUNDS: usize = 16;

#[derive(Debug)]
enum Activation {
    Root,
    Call,
    Transform(Arc<Closure>),
}

#[derive(Debug)]
struct Call {
    machine: ScopeMachine,
    activation: Activation,
}

/// A scope and its active calls
#[derive(Debug)]
pub struct Execution {
    stack: Vec<Call>,
}

impl Execution {
    pub fn new(machine: ScopeMachine) -> Self {
        Execution {
            stack: vec![Call {
                machine,
                activation: Activation::Root,
            }],
        }
    }

    pub fn root(&self) -> &ScopeMachine {
        &self.stack[0].machine
    }

    pub fn root_mut(&mut self) -> &mut ScopeMachine {
        &mut self.stack[0].machine
    }

    /// Number of machines on the stack, the root included
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.root_mut().feed(bytes);
    }

    pub fn finish_input(&mut self) {
        self.root_mut().finish_input();
    }

    fn top(&mut self) -> &mut ScopeMachine {
        let last = self.stack.len() - 1;
        &mut self.stack[last].machine
    }

    fn abort(&mut self) {
        self.stack.truncate(1);
    }

    /// Hand the outcome of a surfaced suspension to the machine that raised it
    pub fn resume(&mut self, outcome: DatexResult<Value>) -> DatexResult<()> {
        let result = self.top().resume(outcome);
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Run until the root needs input, a suspension surfaces, or the root finishes
    pub fn run(&mut self, reg: &mut PointerRegistry) -> DatexResult<Step> {
        match self.drive(reg) {
            Ok(step) => Ok(step),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn drive(&mut self, reg: &mut PointerRegistry) -> DatexResult<Step> {
        loop {
            match self.top().run(reg)? {
                Step::Progress => continue,
                Step::NeedMore if self.stack.len() == 1 => return Ok(Step::NeedMore),
                Step::NeedMore => {
                    return Err(DatexError::Syntax("function body ended unexpectedly".into()));
                }
                Step::Done(value) if self.stack.len() == 1 => return Ok(Step::Done(value)),
                Step::Done(value) => {
                    let Some(finished) = self.stack.pop() else {
                        return Err(DatexError::Runtime("empty call stack".into()));
                    };
                    let value = match finished.activation {
                        Activation::Transform(closure) => {
                            let mut machine = finished.machine;
                            let dependencies = machine.take_reads();
                            let value = reg.deref(&value);
                            Value::Pointer(Self::create_transform(reg, closure, value, dependencies)?)
                        }
                        _ => value,
                    };
                    self.top().resume(Ok(value))?;
                }
                Step::Await(Suspension::Call { function, args }) => {
                    let ctx = self.top().context().clone();
                    self.push(ScopeMachine::for_closure(ctx, &function, args), Activation::Call)?;
                }
                Step::Await(Suspension::Transform { closure }) => {
                    let ctx = self.top().context().clone();
                    let mut machine = ScopeMachine::for_closure(ctx, &closure, Value::Void);
                    machine.track_reads();
                    self.push(machine, Activation::Transform(closure))?;
                }
                Step::Await(other) => return Ok(Step::Await(other)),
            }
        }
    }

    fn push(&mut self, machine: ScopeMachine, activation: Activation) -> DatexResult<()> {
        if self.stack.len() >= MAX_CALL_DEPTH {
            return Err(DatexError::Runtime(format!("call depth exceeds {}", MAX_CALL_DEPTH)));
        }
        self.stack.push(Call { machine, activation });
        Ok(())
    }

    fn create_transform(
        reg: &mut PointerRegistry,
        closure: Arc<Closure>,
        value: Value,
        dependencies: Vec<PointerId>,
    ) -> DatexResult<PointerId> {
        let handle = reg.create(value, PointerOptions::default())?;
        let id = reg
            .resolve(handle)
            .map(|p| p.id())
            .ok_or_else(|| DatexError::Pointer("transform pointer vanished".into()))?;
        tracing::debug!(pointer = %id, dependencies = dependencies.len(), "created transform");
        reg.set_transform(id, closure, dependencies)?;
        Ok(id)
    }
}

/// Run a closure to completion in a fresh execution
pub fn call_closure(reg: &mut PointerRegistry, ctx: ScopeContext, closure: &Closure, args: Value) -> DatexResult<Value> {
    let mut execution = Execution::new(ScopeMachine::for_closure(ctx, closure, args));
    match execution.run(reg)? {
        Step::Done(value) => Ok(value),
        Step::Await(suspension) => Err(DatexError::Runtime(format!(
            "closure cannot suspend here: {:?}",
            suspension
        ))),
        _ => Err(DatexError::Syntax("closure body ended unexpectedly".into())),
    }
}

/// Recompute transforms whose dependencies changed; returns the updated pointers
pub fn update_transforms(reg: &mut PointerRegistry, ctx: &ScopeContext) -> DatexResult<Vec<PointerId>> {
    let mut updated = Vec::new();
    for _ in 0..MAX_TRANSFORM_ROUNDS {
        let dirty = reg.take_dirty_transforms();
        if dirty.is_empty() {
            break;
        }
        for id in dirty {
            let Some(closure) = reg.get(id).and_then(|p| p.transform().cloned()) else {
                continue;
            };
            match call_closure(reg, ctx.clone(), &closure, Value::Void) {
                Ok(value) => {
                    let value = reg.deref(&value);
                    reg.recompute(id, value)?;
                    updated.push(id);
                }
                Err(e) => tracing::warn!(pointer = %id, error = %e, "transform failed"),
            }
        }
    }
    Ok(updated)
}
