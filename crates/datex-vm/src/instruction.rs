//! Instruction decoding
//!
//! `read_instruction` turns one opcode and its operands into an
//! `Instruction` without side effects. A short read surfaces as
//! `DatexError::BufferTooShort`; the caller rewinds to the opcode and
//! retries once more bytes are buffered.

use std::sync::Arc;

use datex_core::{BlockKind, DatexError, DatexResult, DatexType, PointerId, Value};
use datex_wire::{block_kind_for, read_filter, read_target, ActionKind, ByteReader, Opcode, VarName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bracket {
    Array,
    Object,
    Tuple,
    Record,
    Subscope,
}

/// How a named slot is used
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Get,
    Set,
    Action(ActionKind),
}

/// Reserved `#` variables
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reserved {
    Result,
    SubResult,
    Root,
    Origin,
    Sender,
    Current,
    Encrypted,
    Signed,
    Timestamp,
    Meta,
    Static,
    This,
    Remote,
    It,
    Iter,
}

impl Reserved {
    /// Reserved variables that accept assignment
    pub fn is_settable(self) -> bool {
        matches!(
            self,
            Reserved::Result | Reserved::SubResult | Reserved::Root | Reserved::Origin | Reserved::Remote | Reserved::It | Reserved::Iter
        )
    }
}

/// Embedded sub-program
#[derive(Clone, Debug, PartialEq)]
pub struct BlockDef {
    pub kind: BlockKind,
    pub params: Vec<String>,
    pub captures: Vec<String>,
    pub body: Arc<[u8]>,
}

/// One decoded opcode with its operands
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    End,
    CloseAndStore,
    Return,
    /// Self-contained literal
    Value(Value),
    Type(DatexType),
    Open(Bracket),
    Close(Bracket),
    Element(Option<String>),
    Reserved(Reserved, Access),
    Var(VarName, Access),
    Internal(VarName, Access),
    Label(VarName, Access),
    Pointer(PointerId, Access),
    ChildGet { by_ref: bool },
    ChildSet,
    ChildAction(ActionKind),
    Jump { condition: Option<bool>, target: u32 },
    Binary(Opcode),
    Unary(Opcode),
    Block(BlockDef),
    CachePoint,
    CacheReset,
    Spread,
}

fn action(r: &mut ByteReader<'_>) -> DatexResult<ActionKind> {
    let b = r.u8()?;
    ActionKind::from_byte(b).ok_or_else(|| DatexError::Syntax(format!("invalid action specifier 0x{:02x}", b)))
}

fn names(r: &mut ByteReader<'_>) -> DatexResult<Vec<String>> {
    let count = r.u8()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(VarName::read(r)?.to_string());
    }
    Ok(out)
}

fn block(r: &mut ByteReader<'_>, kind: BlockKind) -> DatexResult<BlockDef> {
    let params = names(r)?;
    let captures = names(r)?;
    let len = r.u32()? as usize;
    let body = Arc::from(r.bytes(len)?);
    Ok(BlockDef {
        kind,
        params,
        captures,
        body,
    })
}

fn reserved(op: Opcode) -> Option<(Reserved, Option<u8>)> {
    // (variable, position in its get/set/action triple)
    Some(match op {
        Opcode::VAR_RESULT => (Reserved::Result, Some(0)),
        Opcode::SET_VAR_RESULT => (Reserved::Result, Some(1)),
        Opcode::VAR_RESULT_ACTION => (Reserved::Result, Some(2)),
        Opcode::VAR_SUB_RESULT => (Reserved::SubResult, Some(0)),
        Opcode::SET_VAR_SUB_RESULT => (Reserved::SubResult, Some(1)),
        Opcode::VAR_SUB_RESULT_ACTION => (Reserved::SubResult, Some(2)),
        Opcode::VAR_ROOT => (Reserved::Root, Some(0)),
        Opcode::SET_VAR_ROOT => (Reserved::Root, Some(1)),
        Opcode::VAR_ROOT_ACTION => (Reserved::Root, Some(2)),
        Opcode::VAR_ORIGIN => (Reserved::Origin, Some(0)),
        Opcode::SET_VAR_ORIGIN => (Reserved::Origin, Some(1)),
        Opcode::VAR_ORIGIN_ACTION => (Reserved::Origin, Some(2)),
        Opcode::VAR_REMOTE => (Reserved::Remote, Some(0)),
        Opcode::SET_VAR_REMOTE => (Reserved::Remote, Some(1)),
        Opcode::VAR_REMOTE_ACTION => (Reserved::Remote, Some(2)),
        Opcode::VAR_IT => (Reserved::It, Some(0)),
        Opcode::SET_VAR_IT => (Reserved::It, Some(1)),
        Opcode::VAR_IT_ACTION => (Reserved::It, Some(2)),
        Opcode::VAR_ITER => (Reserved::Iter, Some(0)),
        Opcode::SET_VAR_ITER => (Reserved::Iter, Some(1)),
        Opcode::VAR_ITER_ACTION => (Reserved::Iter, Some(2)),
        Opcode::VAR_SENDER => (Reserved::Sender, None),
        Opcode::VAR_CURRENT => (Reserved::Current, None),
        Opcode::VAR_ENCRYPTED => (Reserved::Encrypted, None),
        Opcode::VAR_SIGNED => (Reserved::Signed, None),
        Opcode::VAR_TIMESTAMP => (Reserved::Timestamp, None),
        Opcode::VAR_META => (Reserved::Meta, None),
        Opcode::VAR_STATIC => (Reserved::Static, None),
        Opcode::VAR_THIS => (Reserved::This, None),
        _ => return None,
    })
}

/// Read the operands of `op`; `r` is positioned after the opcode byte
pub fn read_instruction(r: &mut ByteReader<'_>, op: Opcode) -> DatexResult<Instruction> {
    if let Some((var, slot)) = reserved(op) {
        let access = match slot {
            Some(1) => Access::Set,
            Some(2) => Access::Action(action(r)?),
            _ => Access::Get,
        };
        return Ok(Instruction::Reserved(var, access));
    }
    if op.is_std_type() {
        let name = op.std_type_name().unwrap_or("Any");
        return Ok(Instruction::Type(DatexType::new("std", name)));
    }
    if op.is_target() {
        return Ok(Instruction::Value(Value::Target(read_target(r, op.to_byte())?)));
    }
    if let Some(kind) = block_kind_for(op) {
        let next = r.u8()?;
        if next != Opcode::SCOPE_BLOCK.to_byte() {
            return Err(DatexError::Syntax(format!("{} must be followed by a scope block", op)));
        }
        return Ok(Instruction::Block(block(r, kind)?));
    }
    if op.is_binary_operator() || op == Opcode::MATCHES {
        return Ok(Instruction::Binary(op));
    }

    let instruction = match op {
        Opcode::END => Instruction::End,
        Opcode::CLOSE_AND_STORE => Instruction::CloseAndStore,
        Opcode::RETURN => Instruction::Return,

        Opcode::SHORT_STRING => Instruction::Value(Value::Text(r.short_text()?)),
        Opcode::STRING => Instruction::Value(Value::Text(r.long_text()?)),
        Opcode::INT_8 => Instruction::Value(Value::Int(r.i8()? as i64)),
        Opcode::INT_16 => Instruction::Value(Value::Int(r.i16()? as i64)),
        Opcode::INT_32 => Instruction::Value(Value::Int(r.i32()? as i64)),
        Opcode::INT_64 => Instruction::Value(Value::Int(r.i64()?)),
        Opcode::FLOAT_64 => Instruction::Value(Value::Float(r.f64()?)),
        Opcode::FLOAT_AS_INT => Instruction::Value(Value::Float(r.i32()? as f64)),
        Opcode::UNIT => Instruction::Value(Value::Unit(r.f64()?)),
        Opcode::BUFFER => {
            let len = r.u32()? as usize;
            Instruction::Value(Value::Buffer(r.bytes(len)?.to_vec()))
        }
        Opcode::TRUE => Instruction::Value(Value::Bool(true)),
        Opcode::FALSE => Instruction::Value(Value::Bool(false)),
        Opcode::NULL => Instruction::Value(Value::Null),
        Opcode::VOID => Instruction::Value(Value::Void),
        Opcode::WILDCARD => Instruction::Value(Value::Wildcard),
        Opcode::FILTER => Instruction::Value(Value::Filter(read_filter(r)?)),
        Opcode::TYPE => {
            let ns_len = r.u8()? as usize;
            let name_len = r.u8()? as usize;
            let ns = r.text(ns_len)?;
            let name = r.text(name_len)?;
            Instruction::Type(DatexType::new(ns, name))
        }
        Opcode::SCOPE_BLOCK => Instruction::Block(block(r, BlockKind::Scope)?),

        Opcode::ARRAY_START => Instruction::Open(Bracket::Array),
        Opcode::ARRAY_END => Instruction::Close(Bracket::Array),
        Opcode::OBJECT_START => Instruction::Open(Bracket::Object),
        Opcode::OBJECT_END => Instruction::Close(Bracket::Object),
        Opcode::TUPLE_START => Instruction::Open(Bracket::Tuple),
        Opcode::TUPLE_END => Instruction::Close(Bracket::Tuple),
        Opcode::RECORD_START => Instruction::Open(Bracket::Record),
        Opcode::RECORD_END => Instruction::Close(Bracket::Record),
        Opcode::SUBSCOPE_START => Instruction::Open(Bracket::Subscope),
        Opcode::SUBSCOPE_END => Instruction::Close(Bracket::Subscope),
        Opcode::ELEMENT => Instruction::Element(None),
        Opcode::ELEMENT_WITH_KEY => Instruction::Element(Some(r.short_text()?)),

        Opcode::VAR => Instruction::Var(VarName::read(r)?, Access::Get),
        Opcode::SET_VAR => Instruction::Var(VarName::read(r)?, Access::Set),
        Opcode::VAR_ACTION => {
            let a = action(r)?;
            Instruction::Var(VarName::read(r)?, Access::Action(a))
        }
        Opcode::INTERNAL_VAR => Instruction::Internal(VarName::read(r)?, Access::Get),
        Opcode::SET_INTERNAL_VAR => Instruction::Internal(VarName::read(r)?, Access::Set),
        Opcode::INTERNAL_VAR_ACTION => {
            let a = action(r)?;
            Instruction::Internal(VarName::read(r)?, Access::Action(a))
        }
        Opcode::LABEL => Instruction::Label(VarName::read(r)?, Access::Get),
        Opcode::SET_LABEL => Instruction::Label(VarName::read(r)?, Access::Set),
        Opcode::LABEL_ACTION => {
            let a = action(r)?;
            Instruction::Label(VarName::read(r)?, Access::Action(a))
        }
        Opcode::POINTER => Instruction::Pointer(r.pointer_id()?, Access::Get),
        Opcode::SET_POINTER => Instruction::Pointer(r.pointer_id()?, Access::Set),
        Opcode::POINTER_ACTION => {
            let a = action(r)?;
            Instruction::Pointer(r.pointer_id()?, Access::Action(a))
        }

        Opcode::CHILD_GET => Instruction::ChildGet { by_ref: false },
        Opcode::CHILD_GET_REF => Instruction::ChildGet { by_ref: true },
        Opcode::CHILD_SET => Instruction::ChildSet,
        Opcode::CHILD_ACTION => Instruction::ChildAction(action(r)?),

        Opcode::JMP => Instruction::Jump {
            condition: None,
            target: r.u32()?,
        },
        Opcode::JTR => Instruction::Jump {
            condition: Some(true),
            target: r.u32()?,
        },
        Opcode::JFA => Instruction::Jump {
            condition: Some(false),
            target: r.u32()?,
        },

        Opcode::NOT
        | Opcode::COUNT
        | Opcode::KEYS
        | Opcode::GET_TYPE
        | Opcode::THROW_ERROR
        | Opcode::FREEZE
        | Opcode::SEAL
        | Opcode::DEBUG
        | Opcode::SUBSCRIBE
        | Opcode::UNSUBSCRIBE
        | Opcode::VALUE
        | Opcode::ORIGIN
        | Opcode::SUBSCRIBERS
        | Opcode::CREATE_POINTER
        | Opcode::DELETE_POINTER
        | Opcode::HOLD
        | Opcode::AWAIT => Instruction::Unary(op),

        Opcode::CACHE_POINT => Instruction::CachePoint,
        Opcode::CACHE_RESET => Instruction::CacheReset,
        Opcode::EXTEND => Instruction::Spread,

        other => return Err(DatexError::Runtime(format!("unsupported opcode {}", other))),
    };
    Ok(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::{Endpoint, Target};
    use datex_wire::InstructionBuilder;

    fn read(bytes: &[u8]) -> DatexResult<Instruction> {
        let mut r = ByteReader::new(bytes);
        let op = Opcode::from_byte(r.u8()?).unwrap();
        read_instruction(&mut r, op)
    }

    #[test]
    fn test_literals() {
        assert_eq!(read(&[0xc1, 0xff]).unwrap(), Instruction::Value(Value::Int(-1)));
        assert_eq!(read(&[0xce, 1, b'x']).unwrap(), Instruction::Value(Value::text("x")));
        assert_eq!(read(&[0xcd, 3, 0, 0, 0]).unwrap(), Instruction::Value(Value::Float(3.0)));
    }

    #[test]
    fn test_short_reads_are_incomplete() {
        for bytes in [&[0xc4, 1, 2][..], &[0xce, 5, b'a'][..], &[0xb6, 1][..], &[0xa5, 0, 0][..]] {
            assert!(read(bytes).unwrap_err().is_incomplete(), "{:?}", bytes);
        }
    }

    #[test]
    fn test_named_access() {
        let mut b = InstructionBuilder::new();
        b.var_action(ActionKind::Add, "x").unwrap();
        assert_eq!(
            read(b.as_slice()).unwrap(),
            Instruction::Var(VarName::Named("x".into()), Access::Action(ActionKind::Add))
        );
        assert_eq!(
            read(&[Opcode::SET_VAR_RESULT.to_byte()]).unwrap(),
            Instruction::Reserved(Reserved::Result, Access::Set)
        );
    }

    #[test]
    fn test_types_and_targets() {
        assert_eq!(read(&[0x11]).unwrap(), Instruction::Type(DatexType::new("std", "Int")));
        let mut b = InstructionBuilder::new();
        b.target(&Target::Endpoint(Endpoint::person("bob"))).unwrap();
        assert_eq!(
            read(b.as_slice()).unwrap(),
            Instruction::Value(Value::Target(Target::Endpoint(Endpoint::person("bob"))))
        );
    }

    #[test]
    fn test_blocks() {
        let mut b = InstructionBuilder::new();
        b.scope_block(BlockKind::Do, &[], &["y".into()], &[0xc6]).unwrap();
        let Instruction::Block(def) = read(b.as_slice()).unwrap() else {
            panic!("expected block");
        };
        assert_eq!(def.kind, BlockKind::Do);
        assert_eq!(def.captures, vec!["y".to_string()]);
        assert_eq!(&def.body[..], &[0xc6]);

        assert!(matches!(read(&[Opcode::DO.to_byte(), 0xc6]), Err(DatexError::Syntax(_))));
    }

    #[test]
    fn test_unsupported_opcode() {
        assert!(matches!(read(&[Opcode::URL.to_byte()]), Err(DatexError::Runtime(_))));
    }
}
