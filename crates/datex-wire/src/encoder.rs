//! Value encoding and instruction building
//!
//! `InstructionBuilder` appends single instructions to a growing body;
//! `encode_value` serializes a complete value with the narrowest encodings.

use bytes::{BufMut, BytesMut};
use datex_core::{
    trim_trailing_void, BlockKind, Closure, Cnf, DatexError, DatexResult, DatexType, PointerId, Target, Value,
};

use crate::{write_filter, write_target, ActionKind, ByteReader, Opcode};

/// Variable operand: a short name or a numeric slot
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VarName {
    Named(String),
    Id(u16),
}

impl VarName {
    pub fn write<B: BufMut>(&self, buf: &mut B) -> DatexResult<()> {
        match self {
            VarName::Named(name) => {
                if name.is_empty() || name.len() > u8::MAX as usize {
                    return Err(DatexError::Compiler(format!("invalid variable name {:?}", name)));
                }
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            VarName::Id(id) => {
                buf.put_u8(0);
                buf.put_u16_le(*id);
            }
        }
        Ok(())
    }

    pub fn read(r: &mut ByteReader<'_>) -> DatexResult<Self> {
        let start = r.position();
        let len = r.u8()?;
        let out = if len == 0 {
            r.u16().map(VarName::Id)
        } else {
            r.text(len as usize).map(VarName::Named)
        };
        if out.is_err() {
            r.set_position(start);
        }
        out
    }
}

impl std::fmt::Display for VarName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarName::Named(n) => f.write_str(n),
            VarName::Id(id) => write!(f, "_{}", id),
        }
    }
}

impl From<&str> for VarName {
    fn from(s: &str) -> Self {
        VarName::Named(s.to_string())
    }
}

impl From<String> for VarName {
    fn from(s: String) -> Self {
        VarName::Named(s)
    }
}

/// Opcode prefix for a scope block kind
pub fn block_kind_opcode(kind: BlockKind) -> Option<Opcode> {
    match kind {
        BlockKind::Scope => None,
        BlockKind::Function => Some(Opcode::FUNCTION),
        BlockKind::Do => Some(Opcode::DO),
        BlockKind::Assert => Some(Opcode::ASSERT),
        BlockKind::Remote => Some(Opcode::REMOTE),
        BlockKind::Iterator => Some(Opcode::ITERATOR),
        BlockKind::Transform => Some(Opcode::TRANSFORM),
    }
}

pub fn block_kind_for(op: Opcode) -> Option<BlockKind> {
    match op {
        Opcode::FUNCTION => Some(BlockKind::Function),
        Opcode::DO => Some(BlockKind::Do),
        Opcode::ASSERT => Some(BlockKind::Assert),
        Opcode::REMOTE => Some(BlockKind::Remote),
        Opcode::ITERATOR => Some(BlockKind::Iterator),
        Opcode::TRANSFORM => Some(BlockKind::Transform),
        _ => None,
    }
}

/// Appends instructions to a scope body
#[derive(Clone, Debug, Default)]
pub struct InstructionBuilder {
    buf: BytesMut,
}

impl InstructionBuilder {
    pub fn new() -> Self {
        InstructionBuilder::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        InstructionBuilder {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Current end of the body, usable as a jump target
    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.buf.put_u8(op.to_byte());
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.op(Opcode::END)
    }

    /// `;`
    pub fn close_and_store(&mut self) -> &mut Self {
        self.op(Opcode::CLOSE_AND_STORE)
    }

    pub fn value(&mut self, value: &Value) -> DatexResult<&mut Self> {
        self.insert_value(value)?;
        Ok(self)
    }

    pub fn int(&mut self, i: i64) -> &mut Self {
        if let Ok(v) = i8::try_from(i) {
            self.op(Opcode::INT_8).buf.put_i8(v);
        } else if let Ok(v) = i16::try_from(i) {
            self.op(Opcode::INT_16).buf.put_i16_le(v);
        } else if let Ok(v) = i32::try_from(i) {
            self.op(Opcode::INT_32).buf.put_i32_le(v);
        } else {
            self.op(Opcode::INT_64).buf.put_i64_le(i);
        }
        self
    }

    pub fn float(&mut self, f: f64) -> &mut Self {
        let integral = f.is_finite()
            && f.fract() == 0.0
            && f >= i32::MIN as f64
            && f <= i32::MAX as f64
            && !(f == 0.0 && f.is_sign_negative());
        if integral {
            self.op(Opcode::FLOAT_AS_INT).buf.put_i32_le(f as i32);
        } else {
            self.op(Opcode::FLOAT_64).buf.put_f64_le(f);
        }
        self
    }

    pub fn text(&mut self, s: &str) -> &mut Self {
        if s.len() < 256 {
            self.op(Opcode::SHORT_STRING).buf.put_u8(s.len() as u8);
        } else {
            self.op(Opcode::STRING).buf.put_u32_le(s.len() as u32);
        }
        self.buf.put_slice(s.as_bytes());
        self
    }

    pub fn buffer(&mut self, b: &[u8]) -> &mut Self {
        self.op(Opcode::BUFFER).buf.put_u32_le(b.len() as u32);
        self.buf.put_slice(b);
        self
    }

    pub fn boolean(&mut self, b: bool) -> &mut Self {
        self.op(if b { Opcode::TRUE } else { Opcode::FALSE })
    }

    pub fn unit(&mut self, u: f64) -> &mut Self {
        self.op(Opcode::UNIT).buf.put_f64_le(u);
        self
    }

    pub fn type_literal(&mut self, t: &DatexType) -> DatexResult<&mut Self> {
        if t.std_type().is_some() {
            if let Some(op) = Opcode::for_std_type(&t.name) {
                return Ok(self.op(op));
            }
        }
        if t.namespace.len() > u8::MAX as usize || t.name.len() > u8::MAX as usize {
            return Err(DatexError::Compiler(format!("type name too long: {}", t)));
        }
        self.op(Opcode::TYPE);
        self.buf.put_u8(t.namespace.len() as u8);
        self.buf.put_u8(t.name.len() as u8);
        self.buf.put_slice(t.namespace.as_bytes());
        self.buf.put_slice(t.name.as_bytes());
        Ok(self)
    }

    pub fn target(&mut self, t: &Target) -> DatexResult<&mut Self> {
        match t {
            Target::Endpoint(_) => write_target(&mut self.buf, t)?,
            // a bare pointer target is written as `<Target> $id`
            Target::Pointer(id) => {
                self.type_literal(&DatexType::std(datex_core::StdType::Target))?;
                self.pointer(*id);
            }
        }
        Ok(self)
    }

    pub fn filter(&mut self, cnf: &Cnf) -> DatexResult<&mut Self> {
        self.op(Opcode::FILTER);
        write_filter(&mut self.buf, cnf)?;
        Ok(self)
    }

    pub fn pointer(&mut self, id: PointerId) -> &mut Self {
        self.op(Opcode::POINTER).buf.put_slice(&id.to_bytes());
        self
    }

    /// `$id = ` - the value follows
    pub fn set_pointer(&mut self, id: PointerId) -> &mut Self {
        self.op(Opcode::SET_POINTER).buf.put_slice(&id.to_bytes());
        self
    }

    /// `$id += ` and friends - the value follows
    pub fn pointer_action(&mut self, action: ActionKind, id: PointerId) -> &mut Self {
        self.op(Opcode::POINTER_ACTION).buf.put_u8(action.to_byte());
        self.buf.put_slice(&id.to_bytes());
        self
    }

    fn named(&mut self, op: Opcode, action: Option<ActionKind>, name: &VarName) -> DatexResult<&mut Self> {
        self.op(op);
        if let Some(action) = action {
            self.buf.put_u8(action.to_byte());
        }
        name.write(&mut self.buf)?;
        Ok(self)
    }

    pub fn var(&mut self, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::VAR, None, &name.into())
    }

    pub fn set_var(&mut self, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::SET_VAR, None, &name.into())
    }

    pub fn var_action(&mut self, action: ActionKind, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::VAR_ACTION, Some(action), &name.into())
    }

    pub fn internal_var(&mut self, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::INTERNAL_VAR, None, &name.into())
    }

    pub fn set_internal_var(&mut self, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::SET_INTERNAL_VAR, None, &name.into())
    }

    pub fn label(&mut self, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::LABEL, None, &name.into())
    }

    pub fn set_label(&mut self, name: impl Into<VarName>) -> DatexResult<&mut Self> {
        self.named(Opcode::SET_LABEL, None, &name.into())
    }

    /// `.key` - the key follows
    pub fn child_get(&mut self) -> &mut Self {
        self.op(Opcode::CHILD_GET)
    }

    /// `.key = ` - key and value follow
    pub fn child_set(&mut self) -> &mut Self {
        self.op(Opcode::CHILD_SET)
    }

    pub fn child_action(&mut self, action: ActionKind) -> &mut Self {
        self.op(Opcode::CHILD_ACTION).buf.put_u8(action.to_byte());
        self
    }

    pub fn element(&mut self) -> &mut Self {
        self.op(Opcode::ELEMENT)
    }

    pub fn element_with_key(&mut self, key: &str) -> DatexResult<&mut Self> {
        if key.len() > u8::MAX as usize {
            return Err(DatexError::Value(format!("key too long: {} bytes", key.len())));
        }
        self.op(Opcode::ELEMENT_WITH_KEY).buf.put_u8(key.len() as u8);
        self.buf.put_slice(key.as_bytes());
        Ok(self)
    }

    /// Jump with a placeholder target; returns the operand offset for `patch_jump`
    pub fn jump_placeholder(&mut self, op: Opcode) -> usize {
        self.op(op);
        let at = self.buf.len();
        self.buf.put_u32_le(0);
        at
    }

    pub fn patch_jump(&mut self, operand_at: usize, target: usize) {
        self.buf[operand_at..operand_at + 4].copy_from_slice(&(target as u32).to_le_bytes());
    }

    pub fn jump_to(&mut self, op: Opcode, target: usize) -> &mut Self {
        self.op(op).buf.put_u32_le(target as u32);
        self
    }

    /// Embedded sub-program with parameter and capture names
    pub fn scope_block(
        &mut self,
        kind: BlockKind,
        params: &[String],
        captures: &[String],
        body: &[u8],
    ) -> DatexResult<&mut Self> {
        if params.len() > u8::MAX as usize || captures.len() > u8::MAX as usize {
            return Err(DatexError::Compiler("too many block parameters".into()));
        }
        if let Some(op) = block_kind_opcode(kind) {
            self.op(op);
        }
        self.op(Opcode::SCOPE_BLOCK);
        for list in [params, captures] {
            self.buf.put_u8(list.len() as u8);
            for name in list {
                VarName::Named(name.clone()).write(&mut self.buf)?;
            }
        }
        self.buf.put_u32_le(body.len() as u32);
        self.buf.put_slice(body);
        Ok(self)
    }

    fn closure(&mut self, c: &Closure) -> DatexResult<()> {
        let captures: Vec<String> = c.captures.iter().map(|(n, _)| n.clone()).collect();
        self.scope_block(c.kind, &c.params, &captures, &c.body)?;
        Ok(())
    }

    fn error_value(&mut self, e: &DatexError) -> DatexResult<()> {
        self.type_literal(&DatexType::std(datex_core::StdType::Error))?;
        self.op(Opcode::TUPLE_START);
        self.element().int(e.kind().to_byte() as i64);
        self.element().text(&e.message());
        self.element().op(Opcode::ARRAY_START);
        for hop in e.trace() {
            self.element().op(Opcode::TUPLE_START);
            self.element().text(&hop.endpoint);
            self.element().text(&hop.location);
            self.op(Opcode::TUPLE_END);
        }
        self.op(Opcode::ARRAY_END);
        self.op(Opcode::TUPLE_END);
        Ok(())
    }

    /// Append a complete value
    pub fn insert_value(&mut self, value: &Value) -> DatexResult<()> {
        match value {
            Value::Void => {
                self.op(Opcode::VOID);
            }
            Value::Null => {
                self.op(Opcode::NULL);
            }
            Value::Bool(b) => {
                self.boolean(*b);
            }
            Value::Int(i) => {
                self.int(*i);
            }
            Value::Float(f) => {
                self.float(*f);
            }
            Value::Text(s) => {
                self.text(s);
            }
            Value::Buffer(b) => {
                self.buffer(b);
            }
            Value::Unit(u) => {
                self.unit(*u);
            }
            Value::Type(t) => {
                self.type_literal(t)?;
            }
            Value::Target(t) => {
                self.target(t)?;
            }
            Value::Filter(cnf) => {
                self.filter(cnf)?;
            }
            Value::Array(items) => self.sequence(Opcode::ARRAY_START, Opcode::ARRAY_END, items)?,
            Value::Iterator(items) => {
                self.type_literal(&DatexType::std(datex_core::StdType::Iterator))?;
                self.sequence(Opcode::ARRAY_START, Opcode::ARRAY_END, items)?;
            }
            Value::Object(obj) => {
                self.op(Opcode::OBJECT_START);
                for (k, v) in obj.iter() {
                    self.element_with_key(k)?;
                    self.insert_value(v)?;
                }
                self.op(Opcode::OBJECT_END);
            }
            Value::Tuple(t) => {
                self.op(Opcode::TUPLE_START);
                for (k, v) in &t.entries {
                    match k {
                        Some(k) => {
                            self.element_with_key(k)?;
                        }
                        None => {
                            self.element();
                        }
                    }
                    self.insert_value(v)?;
                }
                self.op(Opcode::TUPLE_END);
            }
            Value::Pointer(id) => {
                self.pointer(*id);
            }
            Value::Function(c) => self.closure(c)?,
            Value::Error(e) => self.error_value(e)?,
            Value::Wildcard => {
                self.op(Opcode::WILDCARD);
            }
        }
        Ok(())
    }

    fn sequence(&mut self, start: Opcode, end: Opcode, items: &[Value]) -> DatexResult<()> {
        let mut items = items.to_vec();
        trim_trailing_void(&mut items);
        self.op(start);
        for v in &items {
            self.element();
            self.insert_value(v)?;
        }
        self.op(end);
        Ok(())
    }
}

/// Encode a value as a complete body (without END)
pub fn encode_value(value: &Value) -> DatexResult<Vec<u8>> {
    let mut b = InstructionBuilder::new();
    b.insert_value(value)?;
    Ok(b.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::Object;

    #[test]
    fn test_narrowest_ints() {
        assert_eq!(encode_value(&Value::Int(5)).unwrap(), vec![0xc1, 5]);
        assert_eq!(encode_value(&Value::Int(300)).unwrap()[0], Opcode::INT_16.to_byte());
        assert_eq!(encode_value(&Value::Int(70_000)).unwrap()[0], Opcode::INT_32.to_byte());
        assert_eq!(encode_value(&Value::Int(i64::MAX)).unwrap().len(), 9);
    }

    #[test]
    fn test_float_as_int() {
        assert_eq!(encode_value(&Value::Float(2.0)).unwrap(), vec![0xcd, 2, 0, 0, 0]);
        assert_eq!(encode_value(&Value::Float(-0.0)).unwrap()[0], Opcode::FLOAT_64.to_byte());
        assert_eq!(encode_value(&Value::Float(0.5)).unwrap()[0], Opcode::FLOAT_64.to_byte());
        assert_eq!(encode_value(&Value::Float(1e12)).unwrap()[0], Opcode::FLOAT_64.to_byte());
    }

    #[test]
    fn test_string_widths() {
        assert_eq!(encode_value(&Value::text("hi")).unwrap(), vec![0xce, 2, b'h', b'i']);
        let long = "x".repeat(300);
        let bytes = encode_value(&Value::text(long)).unwrap();
        assert_eq!(bytes[0], Opcode::STRING.to_byte());
        assert_eq!(&bytes[1..5], &300u32.to_le_bytes());
    }

    #[test]
    fn test_array_trims_trailing_void() {
        let v = Value::Array(vec![Value::Int(1), Value::Void, Value::Void]);
        assert_eq!(encode_value(&v).unwrap(), vec![0xe0, 0xe9, 0xc1, 1, 0xe1]);
    }

    #[test]
    fn test_object_keys() {
        let mut obj = Object::new();
        obj.set("a", Value::Bool(true));
        assert_eq!(
            encode_value(&Value::Object(obj)).unwrap(),
            vec![0xe2, 0xe8, 1, b'a', 0xc6, 0xe3]
        );
    }

    #[test]
    fn test_jump_patching() {
        let mut b = InstructionBuilder::new();
        let at = b.jump_placeholder(Opcode::JMP);
        b.int(1);
        let target = b.position();
        b.patch_jump(at, target);
        assert_eq!(b.as_slice(), &[0xa5, 7, 0, 0, 0, 0xc1, 1]);
    }

    #[test]
    fn test_scope_block_layout() {
        let mut b = InstructionBuilder::new();
        b.scope_block(BlockKind::Function, &["x".into()], &[], &[0xc6]).unwrap();
        assert_eq!(b.as_slice(), &[0x72, 0xcb, 1, 1, b'x', 0, 1, 0, 0, 0, 0xc6]);
    }

    #[test]
    fn test_var_name_forms() {
        let mut buf = Vec::new();
        VarName::Id(513).write(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 1, 2]);
        assert_eq!(VarName::read(&mut ByteReader::new(&buf)).unwrap(), VarName::Id(513));
        assert!(VarName::Named(String::new()).write(&mut buf).is_err());
    }
}
