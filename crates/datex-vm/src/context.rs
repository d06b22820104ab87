//! Scope context
//!
//! Facts about the block a scope arrived in, plus the permissions the
//! runtime grants it.

use datex_core::{Endpoint, Object, SessionId, Target, Timestamp, Value};

#[derive(Clone, Debug)]
pub struct ScopeContext {
    /// Endpoint executing the scope
    pub local: Endpoint,
    pub sender: Option<Endpoint>,
    pub sid: SessionId,
    /// Calls, remote execution and pointer mutation are allowed
    pub executable: bool,
    /// `#sender` may be reassigned
    pub impersonation: bool,
    pub signed: bool,
    pub encrypted: bool,
    pub timestamp: Timestamp,
}

impl ScopeContext {
    /// Context for code the local endpoint runs itself
    pub fn local(endpoint: Endpoint) -> Self {
        ScopeContext {
            sender: Some(endpoint.clone()),
            local: endpoint,
            sid: SessionId::ZERO,
            executable: true,
            impersonation: false,
            signed: false,
            encrypted: false,
            timestamp: Timestamp::ZERO,
        }
    }

    /// Context for a decode-only scope
    pub fn detached(endpoint: Endpoint) -> Self {
        ScopeContext {
            sender: None,
            executable: false,
            ..ScopeContext::local(endpoint)
        }
    }

    pub fn sender_value(&self) -> Value {
        match &self.sender {
            Some(e) => Value::Target(Target::Endpoint(e.clone())),
            None => Value::Void,
        }
    }

    /// `#meta`
    pub fn meta(&self) -> Value {
        let mut meta = Object::new();
        meta.set("sender", self.sender_value());
        meta.set("timestamp", Value::Int(self.timestamp.as_millis() as i64));
        meta.set("signed", Value::Bool(self.signed));
        meta.set("encrypted", Value::Bool(self.encrypted));
        meta.set("executable", Value::Bool(self.executable));
        Value::Object(meta)
    }
}
