//! End-to-end scenarios across simulated endpoints
//!
//! Each scenario wires real runtimes through a `SimNetwork`:
//! - remote execution and typed error responses
//! - pointer subscriptions, including the single origin retry
//! - update propagation without echoes
//! - garbage collection of unsubscribed pointers
//! - reassembly of split, shuffled and duplicated scopes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use datex_core::{Cnf, DatexResult, Endpoint, PointerId, Target, Timestamp, Value};
use datex_pointer::PointerOptions;
use datex_runtime::Runtime;

/// Receiver filter naming a single endpoint
pub fn to(runtime: &Runtime) -> Cnf {
    Cnf::target(Target::Endpoint(runtime.endpoint()))
}

/// Pointer held by `origin`, optionally under an explicit id
pub fn share(origin: &Runtime, value: Value, id: Option<PointerId>) -> DatexResult<PointerId> {
    origin.with_registry(|reg| match id {
        Some(id) => {
            reg.create(
                value,
                PointerOptions {
                    id: Some(id),
                    ..Default::default()
                },
            )?;
            Ok(id)
        }
        None => reg.pointer_for(value),
    })
}

/// Count the changes a runtime's registry applies
pub fn count_changes(runtime: &Runtime) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&counter);
    runtime.with_registry(|reg| {
        reg.observe_all(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
    });
    counter
}

pub fn later(runtime: &Runtime, ms: u64) -> Timestamp {
    Timestamp::from_millis(runtime.now().as_millis() + ms)
}

pub fn endpoint(name: &str) -> Endpoint {
    Endpoint::person(name)
}
