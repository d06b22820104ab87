//! Compilation of pointer changes into update programs
//!
//! | change  | program                     |
//! |---------|-----------------------------|
//! | replace | `$id = value`               |
//! | set     | `$id.key = value`           |
//! | delete  | `$id.key = void`            |
//! | add     | `$id += value`              |
//! | remove  | `$id -= value`              |
//! | clear   | `$id.* = void`              |
//! | splice  | `$id.(start, count) = [..]` |

use datex_core::{DatexResult, Tuple, Value};
use datex_wire::{ActionKind, InstructionBuilder, Opcode};

use crate::{ChangeKind, PointerChange};

fn write_change(b: &mut InstructionBuilder, change: &PointerChange) -> DatexResult<()> {
    let id = change.pointer;
    match &change.kind {
        ChangeKind::Replace(value) => {
            b.set_pointer(id).value(value)?;
        }
        ChangeKind::Set { key, value } => {
            b.pointer(id).child_set().value(key)?.value(value)?;
        }
        ChangeKind::Delete { key } => {
            b.pointer(id).child_set().value(key)?.op(Opcode::VOID);
        }
        ChangeKind::Add(value) => {
            b.pointer_action(ActionKind::Add, id).value(value)?;
        }
        ChangeKind::Remove(value) => {
            b.pointer_action(ActionKind::Subtract, id).value(value)?;
        }
        ChangeKind::Clear => {
            b.pointer(id).child_set().op(Opcode::WILDCARD).op(Opcode::VOID);
        }
        ChangeKind::Splice {
            start,
            delete_count,
            items,
        } => {
            let range = Tuple::from_values(vec![Value::Int(*start as i64), Value::Int(*delete_count as i64)]);
            b.pointer(id)
                .child_set()
                .value(&Value::Tuple(range))?
                .value(&Value::Array(items.clone()))?;
        }
    }
    Ok(())
}

/// One change as a complete program
pub fn compile_change(change: &PointerChange) -> DatexResult<Vec<u8>> {
    compile_updates(std::slice::from_ref(change))
}

/// Several changes as consecutive statements
pub fn compile_updates(changes: &[PointerChange]) -> DatexResult<Vec<u8>> {
    let mut b = InstructionBuilder::new();
    for change in changes {
        write_change(&mut b, change)?;
        b.close_and_store();
    }
    Ok(b.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::PointerId;
    use datex_wire::decompile;

    fn id() -> PointerId {
        PointerId::from_bytes([7; 26])
    }

    #[test]
    fn test_set_program() {
        let change = PointerChange {
            pointer: id(),
            kind: ChangeKind::Set {
                key: Value::text("a"),
                value: Value::Int(1),
            },
        };
        let bytes = compile_change(&change).unwrap();
        assert_eq!(bytes[0], Opcode::POINTER.to_byte());
        assert_eq!(&bytes[1..27], &[7; 26]);
        assert_eq!(bytes[27], Opcode::CHILD_SET.to_byte());
        assert_eq!(*bytes.last().unwrap(), Opcode::CLOSE_AND_STORE.to_byte());
    }

    #[test]
    fn test_action_programs() {
        let add = compile_change(&PointerChange {
            pointer: id(),
            kind: ChangeKind::Add(Value::Int(5)),
        })
        .unwrap();
        assert_eq!(&add[..2], &[Opcode::POINTER_ACTION.to_byte(), Opcode::ADD.to_byte()]);

        let remove = compile_change(&PointerChange {
            pointer: id(),
            kind: ChangeKind::Remove(Value::Int(5)),
        })
        .unwrap();
        assert_eq!(remove[1], Opcode::SUBTRACT.to_byte());
    }

    #[test]
    fn test_batch_statements() {
        let changes = vec![
            PointerChange {
                pointer: id(),
                kind: ChangeKind::Clear,
            },
            PointerChange {
                pointer: id(),
                kind: ChangeKind::Replace(Value::text("x")),
            },
        ];
        let text = decompile(&compile_updates(&changes).unwrap());
        assert_eq!(text.matches(';').count(), 2);
        assert!(text.contains("void"));
    }
}
