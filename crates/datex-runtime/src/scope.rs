//! Active scopes
//!
//! A scope spans the blocks sharing one (sender, sid). Blocks are fed to
//! the scope's execution strictly in increment order; blocks arriving
//! ahead of their predecessor are parked until the gap closes.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use datex_core::{DatexResult, Endpoint, SessionId, Value};
use datex_vm::{Execution, ScopeContext, ScopeMachine};
use datex_wire::Header;

/// Identity of one scope in the active table
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub sender: Option<Endpoint>,
    pub sid: SessionId,
    /// Replies live apart from requests reusing the same sid
    pub reply: bool,
}

impl ScopeKey {
    pub fn of(header: &Header) -> Self {
        ScopeKey {
            sender: header.sender.as_ref().map(Endpoint::main),
            sid: header.sid,
            reply: header.kind.is_reply(),
        }
    }
}

/// What happens with the result of a finished scope
#[derive(Debug)]
pub enum Reply {
    /// Compile the result (or error) into a RESPONSE
    Respond { to: Endpoint, return_index: u16 },
    /// Settle the outbound request with the same sid
    Resolve,
    /// Nothing on success; an error rejects the outbound request with the same sid
    Reject,
    Silent,
    /// Local execution awaited by a caller
    Channel(oneshot::Sender<DatexResult<Value>>),
}

/// Outcome of offering a block to a scope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accepted {
    /// This many blocks were fed, parked successors included
    Fed(usize),
    Parked,
    Duplicate,
    /// Too many blocks parked already
    Overflow,
}

#[derive(Debug)]
pub struct ActiveScope {
    pub header: Header,
    pub execution: Execution,
    pub reply: Reply,
    /// Waiting for a suspension to be resolved by the network
    pub awaiting: bool,
    next_inc: u16,
    complete: bool,
    parked: BTreeMap<u16, (bool, Vec<u8>)>,
}

impl ActiveScope {
    pub fn new(header: Header, ctx: ScopeContext, reply: Reply) -> Self {
        ActiveScope {
            header,
            execution: Execution::new(ScopeMachine::new(ctx)),
            reply,
            awaiting: false,
            next_inc: 0,
            complete: false,
            parked: BTreeMap::new(),
        }
    }

    /// Scope whose whole program is already known
    pub fn with_program(header: Header, ctx: ScopeContext, reply: Reply, program: &[u8]) -> Self {
        let mut scope = ActiveScope::new(header, ctx, reply);
        scope.accept(0, true, program.to_vec(), 0);
        scope
    }

    pub fn context(&self) -> &ScopeContext {
        self.execution.root().context()
    }

    /// All blocks up to the end of the scope were fed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn next_inc(&self) -> u16 {
        self.next_inc
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn accept(&mut self, inc: u16, last: bool, body: Vec<u8>, max_parked: usize) -> Accepted {
        if self.complete || inc < self.next_inc {
            return Accepted::Duplicate;
        }
        if inc > self.next_inc {
            if self.parked.len() >= max_parked && !self.parked.contains_key(&inc) {
                return Accepted::Overflow;
            }
            self.parked.insert(inc, (last, body));
            return Accepted::Parked;
        }

        self.feed(last, &body);
        let mut fed = 1;
        while !self.complete {
            let Some((last, body)) = self.parked.remove(&self.next_inc) else {
                break;
            };
            self.feed(last, &body);
            fed += 1;
        }
        Accepted::Fed(fed)
    }

    fn feed(&mut self, last: bool, body: &[u8]) {
        self.execution.feed(body);
        match self.next_inc.checked_add(1) {
            Some(next) if !last => self.next_inc = next,
            _ => {
                self.complete = true;
                self.parked.clear();
                self.execution.finish_input();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_pointer::{PointerRegistry, RegistryConfig};
    use datex_vm::Step;
    use datex_wire::{InstructionBuilder, MessageKind, Opcode};

    fn scope() -> ActiveScope {
        let alice = Endpoint::person("alice");
        ActiveScope::new(
            Header::new(SessionId::new(1), MessageKind::Request),
            ScopeContext::local(alice),
            Reply::Silent,
        )
    }

    fn program() -> Vec<u8> {
        let mut b = InstructionBuilder::new();
        b.int(1).op(Opcode::ADD).int(2).op(Opcode::ADD).int(40);
        b.into_vec()
    }

    #[test]
    fn test_blocks_reordered_before_execution() {
        let mut reg = PointerRegistry::new(Endpoint::person("alice"), RegistryConfig::default());
        let bytes = program();
        let parts: Vec<Vec<u8>> = bytes.chunks(2).map(<[u8]>::to_vec).collect();
        let last = parts.len() - 1;

        let mut scope = scope();
        for (inc, part) in parts.iter().enumerate().rev() {
            let accepted = scope.accept(inc as u16, inc == last, part.clone(), 16);
            if inc == 0 {
                assert_eq!(accepted, Accepted::Fed(parts.len()));
            } else {
                assert_eq!(accepted, Accepted::Parked);
            }
        }
        assert!(scope.is_complete());
        assert_eq!(scope.parked(), 0);
        assert_eq!(scope.execution.run(&mut reg).unwrap(), Step::Done(Value::Int(43)));
    }

    #[test]
    fn test_missing_block_stalls_scope() {
        let mut reg = PointerRegistry::new(Endpoint::person("alice"), RegistryConfig::default());
        let bytes = program();
        let (head, tail) = bytes.split_at(3);

        let mut scope = scope();
        assert_eq!(scope.accept(1, true, tail.to_vec(), 16), Accepted::Parked);
        assert_eq!(scope.execution.run(&mut reg).unwrap(), Step::NeedMore);
        assert_eq!(scope.accept(0, false, head.to_vec(), 16), Accepted::Fed(2));
        assert_eq!(scope.execution.run(&mut reg).unwrap(), Step::Done(Value::Int(43)));
    }

    #[test]
    fn test_duplicates_and_overflow() {
        let mut scope = scope();
        assert_eq!(scope.accept(0, false, vec![Opcode::INT_8.to_byte(), 1], 1), Accepted::Fed(1));
        assert_eq!(scope.accept(0, false, vec![Opcode::INT_8.to_byte(), 1], 1), Accepted::Duplicate);
        assert_eq!(scope.accept(3, false, vec![], 1), Accepted::Parked);
        assert_eq!(scope.accept(4, false, vec![], 1), Accepted::Overflow);
        assert_eq!(scope.next_inc(), 1);
    }

    #[test]
    fn test_key_separates_replies() {
        let mut request = Header::new(SessionId::new(9), MessageKind::Request);
        request.sender = Some(Endpoint::person("bob").with_instance("phone"));
        let mut response = request.clone();
        response.kind = MessageKind::Response;

        assert_ne!(ScopeKey::of(&request), ScopeKey::of(&response));
        assert_eq!(ScopeKey::of(&request).sender, Some(Endpoint::person("bob")));
    }
}
