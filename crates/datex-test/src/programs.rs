//! Compiled programs shared by the scenarios and benches

use datex_core::{BlockKind, DatexResult, Endpoint, PointerId, Target, Value};
use datex_pointer::{compile_change, ChangeKind, PointerChange};
use datex_wire::{InstructionBuilder, Opcode};

/// `a + b`
pub fn sum(lhs: i64, rhs: i64) -> Vec<u8> {
    let mut b = InstructionBuilder::new();
    b.int(lhs).op(Opcode::ADD).int(rhs);
    b.into_vec()
}

/// `x = value; <receiver> :: (x * factor)`
pub fn remote_multiply(receiver: &Endpoint, value: i64, factor: i64) -> DatexResult<Vec<u8>> {
    let mut body = InstructionBuilder::new();
    body.var("x")?.op(Opcode::MULTIPLY).int(factor);

    let mut b = InstructionBuilder::new();
    b.set_var("x")?.int(value);
    b.close_and_store();
    b.target(&Target::Endpoint(receiver.clone()))?;
    b.scope_block(BlockKind::Remote, &[], &["x".to_string()], body.as_slice())?;
    Ok(b.into_vec())
}

/// `$id.key`
pub fn read_property(id: PointerId, key: &str) -> Vec<u8> {
    let mut b = InstructionBuilder::new();
    b.pointer(id).child_get().text(key);
    b.into_vec()
}

/// `$id.key = value`
pub fn set_property(id: PointerId, key: &str, value: Value) -> DatexResult<Vec<u8>> {
    compile_change(&PointerChange {
        pointer: id,
        kind: ChangeKind::Set {
            key: Value::text(key),
            value,
        },
    })
}

/// A flat expression of `terms` additions
pub fn long_sum(terms: usize) -> Vec<u8> {
    let mut b = InstructionBuilder::new();
    b.int(0);
    for i in 0..terms {
        b.op(Opcode::ADD).int(i as i64);
    }
    b.into_vec()
}
