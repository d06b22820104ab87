//! Value decoding
//!
//! A value stream is an ordinary program run without execution rights.
//! Pointers that are not known locally decode as references; nothing is
//! fetched.

use datex_core::{DatexError, DatexResult, Endpoint, EndpointKind, Value};
use datex_pointer::{PointerRegistry, RegistryConfig};

use crate::{ScopeContext, ScopeMachine, Step, Suspension};

/// Decode a complete value stream, resolving pointers against `reg`
pub fn decode(bytes: &[u8], reg: &mut PointerRegistry) -> DatexResult<Value> {
    let mut machine = ScopeMachine::new(ScopeContext::detached(reg.local().clone()));
    machine.feed(bytes);
    machine.finish_input();
    loop {
        match machine.run(reg)? {
            Step::Done(value) => return Ok(value),
            // an unknown pointer stays a reference
            Step::Await(Suspension::LoadPointer(_)) => machine.resume(Ok(Value::Void))?,
            Step::Await(Suspension::Remote { .. }) => {
                return Err(DatexError::Network("remote execution while decoding".into()));
            }
            Step::Await(other) => {
                return Err(DatexError::Permission(format!("{:?} while decoding", other)));
            }
            Step::NeedMore | Step::Progress => {
                return Err(DatexError::Syntax("value stream ended unexpectedly".into()));
            }
        }
    }
}

/// Decode without any pointer context
pub fn decode_detached(bytes: &[u8]) -> DatexResult<Value> {
    let local = Endpoint::new(EndpointKind::Id, "local");
    let mut reg = PointerRegistry::new(local, RegistryConfig::default());
    decode(bytes, &mut reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::{to_normal_form, Cnf, FilterExpr, Object, PointerId, Target, Tuple};
    use datex_pointer::{compile_change, compile_updates, ChangeKind, PointerChange, PointerOptions};
    use datex_wire::{encode_value, InstructionBuilder, Opcode};
    use proptest::prelude::*;

    fn endpoint() -> impl Strategy<Value = Endpoint> {
        ("[a-z]{1,6}", proptest::option::of("[a-z0-9]{1,6}")).prop_map(|(name, instance)| {
            let endpoint = Endpoint::person(name);
            match instance {
                Some(instance) => endpoint.with_instance(instance),
                None => endpoint,
            }
        })
    }

    fn target() -> impl Strategy<Value = Target> {
        prop_oneof![
            endpoint().prop_map(Target::Endpoint),
            any::<[u8; 8]>().prop_map(|instance| {
                Target::Pointer(PointerId::new_default(Endpoint::person("alice").id(), instance, 7, 1))
            }),
        ]
    }

    fn filter() -> impl Strategy<Value = Cnf> {
        let literal = (endpoint(), any::<bool>()).prop_map(|(e, negated)| {
            let expr = FilterExpr::target(e);
            if negated {
                expr.not()
            } else {
                expr
            }
        });
        literal
            .prop_recursive(2, 8, 2, |inner| {
                prop_oneof![
                    (inner.clone(), inner.clone()).prop_map(|(a, b)| a.and(b)),
                    (inner.clone(), inner).prop_map(|(a, b)| a.or(b)),
                ]
            })
            .prop_map(|expr| to_normal_form(&expr))
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Int),
            (-1.0e12f64..1.0e12).prop_map(Value::Float),
            (-1.0e6f64..1.0e6).prop_map(Value::Unit),
            any::<bool>().prop_map(Value::Bool),
            "[a-z ]{0,12}".prop_map(Value::Text),
            "[\"\\\\\n\t'$@ a-z\u{e9}\u{1F600}]{0,300}".prop_map(Value::Text),
            Just(Value::Null),
            proptest::collection::vec(any::<u8>(), 0..8).prop_map(Value::Buffer),
            target().prop_map(Value::Target),
            filter().prop_map(Value::Filter),
        ]
    }

    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner.clone(), 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
                proptest::collection::vec(inner, 0..4).prop_map(|v| Value::Tuple(Tuple::from_values(v))),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_decode_encoded(v in value()) {
            let bytes = encode_value(&v).unwrap();
            prop_assert_eq!(decode_detached(&bytes).unwrap(), v);
        }

        #[test]
        fn test_decode_encoded_leaf(v in prop_oneof![leaf(), Just(Value::Void)]) {
            let bytes = encode_value(&v).unwrap();
            prop_assert_eq!(decode_detached(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn test_oversized_operators_fail_cleanly() {
        let mut b = InstructionBuilder::new();
        b.text("ab").op(Opcode::MULTIPLY).int(i64::MAX);
        assert!(matches!(decode_detached(&b.into_vec()), Err(DatexError::Value(_))));

        let mut b = InstructionBuilder::new();
        b.int(0).op(Opcode::RANGE).int(i64::MAX);
        assert!(matches!(decode_detached(&b.into_vec()), Err(DatexError::Value(_))));
    }

    #[test]
    fn test_unknown_pointer_stays_reference() {
        let id = PointerId::from_bytes([4; 26]);
        let bytes = encode_value(&Value::Array(vec![Value::Pointer(id)])).unwrap();
        assert_eq!(decode_detached(&bytes).unwrap(), Value::Array(vec![Value::Pointer(id)]));
    }

    #[test]
    fn test_decode_refuses_mutation() {
        let id = PointerId::from_bytes([4; 26]);
        let program = compile_change(&PointerChange {
            pointer: id,
            kind: ChangeKind::Replace(Value::Int(1)),
        })
        .unwrap();
        assert!(matches!(decode_detached(&program), Err(DatexError::Permission(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let bytes = encode_value(&Value::text("hello")).unwrap();
        assert!(matches!(
            decode_detached(&bytes[..bytes.len() - 1]),
            Err(DatexError::Syntax(_))
        ));
    }

    #[test]
    fn test_update_program_applies() {
        let alice = Endpoint::person("alice");
        let mut replica = PointerRegistry::new(Endpoint::person("bob"), RegistryConfig::default());
        let id = PointerId::from_bytes([9; 26]);
        replica
            .create(
                Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
                PointerOptions {
                    id: Some(id),
                    origin: Some(alice.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        let program = compile_updates(&[
            PointerChange {
                pointer: id,
                kind: ChangeKind::Splice {
                    start: 1,
                    delete_count: 1,
                    items: vec![Value::Int(20), Value::Int(21)],
                },
            },
            PointerChange {
                pointer: id,
                kind: ChangeKind::Add(Value::Int(4)),
            },
        ])
        .unwrap();

        let mut ctx = ScopeContext::local(Endpoint::person("bob"));
        ctx.sender = Some(alice);
        let mut machine = ScopeMachine::new(ctx);
        machine.feed(&program);
        machine.finish_input();
        assert!(matches!(machine.run(&mut replica).unwrap(), Step::Done(_)));
        assert_eq!(
            replica.value(id),
            Some(Value::Array(vec![
                Value::Int(1),
                Value::Int(20),
                Value::Int(21),
                Value::Int(3),
                Value::Int(4)
            ]))
        );

        let clear = compile_change(&PointerChange {
            pointer: id,
            kind: ChangeKind::Clear,
        })
        .unwrap();
        let mut machine = ScopeMachine::new(ScopeContext::local(Endpoint::person("bob")));
        machine.feed(&clear);
        machine.finish_input();
        machine.run(&mut replica).unwrap();
        assert_eq!(replica.value(id), Some(Value::Array(Vec::new())));
    }

    #[test]
    fn test_object_property_update() {
        let mut reg = PointerRegistry::new(Endpoint::person("bob"), RegistryConfig::default());
        let id = reg.pointer_for(Value::Object(Object::new())).unwrap();
        let program = compile_change(&PointerChange {
            pointer: id,
            kind: ChangeKind::Set {
                key: Value::text("name"),
                value: Value::text("bob"),
            },
        })
        .unwrap();
        let mut machine = ScopeMachine::new(ScopeContext::local(Endpoint::person("bob")));
        machine.feed(&program);
        machine.finish_input();
        machine.run(&mut reg).unwrap();
        let Some(Value::Object(obj)) = reg.value(id) else {
            panic!("expected object");
        };
        assert_eq!(obj.get("name"), Some(&Value::text("bob")));
        assert_eq!(decode(&encode_value(&Value::Pointer(id)).unwrap(), &mut reg).unwrap(), Value::Pointer(id));
    }
}
