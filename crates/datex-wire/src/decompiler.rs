//! Debug decompiler
//!
//! Renders an opcode stream as readable text for diagnostics. Output is
//! not meant to be parsed back.

use std::fmt::Write;

use datex_core::{DatexResult, Value};

use crate::{block_kind_for, read_filter, read_target, ActionKind, ByteReader, Opcode, VarName};

/// Render a body; truncated or malformed input is marked inline
pub fn decompile(body: &[u8]) -> String {
    let mut out = String::new();
    let mut r = ByteReader::new(body);
    while !r.is_empty() {
        let at = r.position();
        let b = match r.u8() {
            Ok(b) => b,
            Err(_) => break,
        };
        let Some(op) = Opcode::from_byte(b) else {
            let _ = write!(out, "<invalid 0x{:02x} at {}>", b, at);
            break;
        };
        match render(op, &mut r) {
            Ok(text) => {
                if !out.is_empty() && !text.starts_with(';') {
                    out.push(' ');
                }
                out.push_str(&text);
            }
            Err(_) => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str("<truncated>");
                break;
            }
        }
    }
    out
}

fn action(r: &mut ByteReader<'_>) -> DatexResult<&'static str> {
    let b = r.u8()?;
    Ok(ActionKind::from_byte(b).map(ActionKind::symbol).unwrap_or("?="))
}

fn render(op: Opcode, r: &mut ByteReader<'_>) -> DatexResult<String> {
    let text = match op {
        Opcode::END => "end".to_string(),
        Opcode::CLOSE_AND_STORE => ";".to_string(),
        Opcode::SHORT_STRING => Value::Text(r.short_text()?).to_string(),
        Opcode::STRING => Value::Text(r.long_text()?).to_string(),
        Opcode::INT_8 => r.i8()?.to_string(),
        Opcode::INT_16 => r.i16()?.to_string(),
        Opcode::INT_32 => r.i32()?.to_string(),
        Opcode::INT_64 => r.i64()?.to_string(),
        Opcode::FLOAT_64 => Value::Float(r.f64()?).to_string(),
        Opcode::FLOAT_AS_INT => Value::Float(r.i32()? as f64).to_string(),
        Opcode::UNIT => Value::Unit(r.f64()?).to_string(),
        Opcode::BUFFER => {
            let len = r.u32()? as usize;
            Value::Buffer(r.bytes(len)?.to_vec()).to_string()
        }
        Opcode::TRUE => "true".to_string(),
        Opcode::FALSE => "false".to_string(),
        Opcode::NULL => "null".to_string(),
        Opcode::VOID => "void".to_string(),
        Opcode::WILDCARD => "*".to_string(),
        Opcode::POINTER => r.pointer_id()?.to_string(),
        Opcode::SET_POINTER => format!("{} =", r.pointer_id()?),
        Opcode::POINTER_ACTION => {
            let a = action(r)?;
            format!("{} {}", r.pointer_id()?, a)
        }
        Opcode::VAR | Opcode::INTERNAL_VAR | Opcode::LABEL => {
            let prefix = sigil(op);
            format!("{}{}", prefix, VarName::read(r)?)
        }
        Opcode::SET_VAR | Opcode::SET_INTERNAL_VAR | Opcode::SET_LABEL => {
            format!("{}{} =", sigil(op), VarName::read(r)?)
        }
        Opcode::VAR_ACTION | Opcode::INTERNAL_VAR_ACTION | Opcode::LABEL_ACTION => {
            let a = action(r)?;
            format!("{}{} {}", sigil(op), VarName::read(r)?, a)
        }
        Opcode::CHILD_ACTION => format!(". {}", action(r)?),
        Opcode::ELEMENT_WITH_KEY => format!("{}:", r.short_text()?),
        Opcode::JMP | Opcode::JTR | Opcode::JFA => {
            format!("{} {}", op.mnemonic().to_lowercase(), r.u32()?)
        }
        Opcode::TYPE => {
            let ns_len = r.u8()? as usize;
            let name_len = r.u8()? as usize;
            let ns = r.text(ns_len)?;
            let name = r.text(name_len)?;
            if ns.is_empty() || ns == "std" {
                format!("<{}>", name)
            } else {
                format!("<{}:{}>", ns, name)
            }
        }
        Opcode::FILTER => read_filter(r)?.to_string(),
        Opcode::SCOPE_BLOCK => {
            let mut params = Vec::new();
            for _ in 0..r.u8()? {
                params.push(VarName::read(r)?.to_string());
            }
            let mut captures = Vec::new();
            for _ in 0..r.u8()? {
                captures.push(VarName::read(r)?.to_string());
            }
            let len = r.u32()? as usize;
            let body = r.bytes(len)?;
            let mut s = format!("({})", params.join(", "));
            if !captures.is_empty() {
                let _ = write!(s, " [{}]", captures.join(", "));
            }
            let _ = write!(s, " {{{}}}", decompile(body));
            s
        }
        op if op.is_target() => read_target(r, op.to_byte())?.to_string(),
        op if op.is_std_type() => format!("<{}>", op.std_type_name().unwrap_or("?")),
        op if block_kind_for(op).is_some() => op.mnemonic().to_lowercase(),
        op => symbol(op).map(str::to_string).unwrap_or_else(|| op.mnemonic().to_lowercase()),
    };
    Ok(text)
}

fn sigil(op: Opcode) -> &'static str {
    match op {
        Opcode::INTERNAL_VAR | Opcode::SET_INTERNAL_VAR | Opcode::INTERNAL_VAR_ACTION => "#",
        Opcode::LABEL | Opcode::SET_LABEL | Opcode::LABEL_ACTION => "$",
        _ => "",
    }
}

fn symbol(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::ADD => "+",
        Opcode::SUBTRACT => "-",
        Opcode::MULTIPLY => "*",
        Opcode::DIVIDE => "/",
        Opcode::AND => "&",
        Opcode::OR => "|",
        Opcode::NOT => "!",
        Opcode::EQUAL => "===",
        Opcode::NOT_EQUAL => "!==",
        Opcode::EQUAL_VALUE => "==",
        Opcode::NOT_EQUAL_VALUE => "!=",
        Opcode::GREATER => ">",
        Opcode::LESS => "<",
        Opcode::GREATER_EQUAL => ">=",
        Opcode::LESS_EQUAL => "<=",
        Opcode::RANGE => "..",
        Opcode::EXTEND => "...",
        Opcode::CHILD_GET => ".",
        Opcode::CHILD_GET_REF => "->",
        Opcode::CHILD_SET => ". =",
        Opcode::ARRAY_START => "[",
        Opcode::ARRAY_END => "]",
        Opcode::OBJECT_START => "{",
        Opcode::OBJECT_END => "}",
        Opcode::TUPLE_START | Opcode::SUBSCOPE_START | Opcode::RECORD_START => "(",
        Opcode::TUPLE_END | Opcode::SUBSCOPE_END | Opcode::RECORD_END => ")",
        Opcode::ELEMENT => ",",
        Opcode::CREATE_POINTER => "$$",
        Opcode::THROW_ERROR => "!!",
        Opcode::VAR_RESULT => "#result",
        Opcode::SET_VAR_RESULT => "#result =",
        Opcode::VAR_SENDER => "#sender",
        Opcode::VAR_CURRENT => "#current",
        Opcode::VAR_TIMESTAMP => "#timestamp",
        Opcode::VAR_META => "#meta",
        Opcode::VAR_IT => "#it",
        Opcode::VAR_ITER => "#iter",
        Opcode::VAR_ORIGIN => "#origin",
        Opcode::VAR_REMOTE => "#remote",
        Opcode::VAR_ROOT => "#root",
        Opcode::VAR_THIS => "#this",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode_value, InstructionBuilder};
    use datex_core::{BlockKind, Endpoint, Target};

    #[test]
    fn test_infix_program() {
        let mut b = InstructionBuilder::new();
        b.int(1).op(Opcode::ADD).int(2).close_and_store();
        assert_eq!(decompile(b.as_slice()), "1 + 2;");
    }

    #[test]
    fn test_compound_values() {
        let v = Value::Array(vec![Value::text("a"), Value::Bool(false)]);
        assert_eq!(decompile(&encode_value(&v).unwrap()), "[ , \"a\" , false ]");
    }

    #[test]
    fn test_targets_and_blocks() {
        let mut b = InstructionBuilder::new();
        b.target(&Target::Endpoint(Endpoint::person("bob"))).unwrap();
        b.scope_block(BlockKind::Function, &["x".into()], &[], &[0xb0, 1, b'x']).unwrap();
        assert_eq!(decompile(b.as_slice()), "@bob function (x) {x}");
    }

    #[test]
    fn test_truncated_and_invalid() {
        assert_eq!(decompile(&[0xc1]), "<truncated>");
        assert_eq!(decompile(&[0xc6, 0xc1]), "true <truncated>");
        assert_eq!(decompile(&[0xf3]), "<invalid 0xf3 at 0>");
    }
}
