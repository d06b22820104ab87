//! Opcode table
//!
//! Byte values are part of the wire contract and must never change.

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $byte:literal,)*) => {
        /// Body instruction
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name = $byte,)*
        }

        impl Opcode {
            pub fn from_byte(b: u8) -> Option<Self> {
                match b {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            #[inline]
            pub fn to_byte(self) -> u8 {
                self as u8
            }

            /// Upper-case mnemonic used by the decompiler
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    END = 0x00,

    STD_TYPE_STRING = 0x10,
    STD_TYPE_INT = 0x11,
    STD_TYPE_FLOAT = 0x12,
    STD_TYPE_BOOLEAN = 0x13,
    STD_TYPE_NULL = 0x14,
    STD_TYPE_VOID = 0x15,
    STD_TYPE_BUFFER = 0x16,
    STD_TYPE_CODE_BLOCK = 0x17,
    STD_TYPE_UNIT = 0x18,
    STD_TYPE_FILTER = 0x19,
    STD_TYPE_ARRAY = 0x1a,
    STD_TYPE_OBJECT = 0x1b,
    STD_TYPE_SET = 0x1c,
    STD_TYPE_MAP = 0x1d,
    STD_TYPE_TUPLE = 0x1e,
    STD_TYPE_RECORD = 0x1f,
    STD_TYPE_FUNCTION = 0x20,
    STD_TYPE_STREAM = 0x21,
    STD_TYPE_ANY = 0x22,
    STD_TYPE_ASSERTION = 0x23,
    STD_TYPE_TASK = 0x24,
    STD_TYPE_ITERATOR = 0x25,

    VAR_RESULT = 0x30,
    SET_VAR_RESULT = 0x31,
    VAR_RESULT_ACTION = 0x32,
    VAR_SUB_RESULT = 0x33,
    SET_VAR_SUB_RESULT = 0x34,
    VAR_SUB_RESULT_ACTION = 0x35,
    VAR_ROOT = 0x36,
    SET_VAR_ROOT = 0x37,
    VAR_ROOT_ACTION = 0x38,
    VAR_ORIGIN = 0x39,
    SET_VAR_ORIGIN = 0x3a,
    VAR_ORIGIN_ACTION = 0x3b,
    VAR_SENDER = 0x3c,
    VAR_CURRENT = 0x3d,
    VAR_ENCRYPTED = 0x3e,
    VAR_SIGNED = 0x3f,
    VAR_TIMESTAMP = 0x40,
    VAR_META = 0x41,
    VAR_STATIC = 0x42,
    VAR_THIS = 0x43,
    VAR_REMOTE = 0x44,
    SET_VAR_REMOTE = 0x45,
    VAR_REMOTE_ACTION = 0x46,
    VAR_IT = 0x47,
    SET_VAR_IT = 0x48,
    VAR_IT_ACTION = 0x49,
    VAR_ITER = 0x4a,
    SET_VAR_ITER = 0x4b,
    VAR_ITER_ACTION = 0x4c,

    /// Keep the scope buffer from here on for back-references
    CACHE_POINT = 0x50,
    CACHE_RESET = 0x51,
    URL = 0x52,
    TEMPLATE = 0x53,
    EXTENDS = 0x54,
    IMPLEMENTS = 0x55,
    MATCHES = 0x56,
    DEBUG = 0x57,
    REQUEST = 0x58,
    ASSERT = 0x59,
    ITERATOR = 0x5a,
    ITERATION = 0x5b,

    FREEZE = 0x60,
    SEAL = 0x61,
    HAS = 0x62,
    KEYS = 0x63,
    JFA = 0x66,
    TRANSFORM = 0x67,
    OBSERVE = 0x68,
    DO = 0x69,
    AWAIT = 0x70,
    HOLD = 0x71,
    FUNCTION = 0x72,

    CLOSE_AND_STORE = 0xa0,
    SUBSCOPE_START = 0xa1,
    SUBSCOPE_END = 0xa2,
    /// Identity equality
    EQUAL = 0xa3,
    RETURN = 0xa4,
    JMP = 0xa5,
    JTR = 0xa6,
    EQUAL_VALUE = 0xa7,
    NOT_EQUAL_VALUE = 0xa8,
    GREATER = 0xa9,
    LESS = 0xaa,
    GREATER_EQUAL = 0xab,
    LESS_EQUAL = 0xac,
    COUNT = 0xad,
    ABOUT = 0xae,
    WILDCARD = 0xaf,

    VAR = 0xb0,
    SET_VAR = 0xb1,
    VAR_ACTION = 0xb2,
    INTERNAL_VAR = 0xb3,
    SET_INTERNAL_VAR = 0xb4,
    INTERNAL_VAR_ACTION = 0xb5,
    POINTER = 0xb6,
    SET_POINTER = 0xb7,
    POINTER_ACTION = 0xb8,
    CREATE_POINTER = 0xb9,
    DELETE_POINTER = 0xba,
    SUBSCRIBE = 0xbb,
    UNSUBSCRIBE = 0xbc,
    VALUE = 0xbd,
    ORIGIN = 0xbe,
    SUBSCRIBERS = 0xbf,

    STRING = 0xc0,
    INT_8 = 0xc1,
    INT_16 = 0xc2,
    INT_32 = 0xc3,
    INT_64 = 0xc4,
    FLOAT_64 = 0xc5,
    TRUE = 0xc6,
    FALSE = 0xc7,
    NULL = 0xc8,
    VOID = 0xc9,
    BUFFER = 0xca,
    SCOPE_BLOCK = 0xcb,
    UNIT = 0xcc,
    FLOAT_AS_INT = 0xcd,
    SHORT_STRING = 0xce,

    PERSON_ALIAS = 0xd0,
    PERSON_ALIAS_WILDCARD = 0xd1,
    INSTITUTION_ALIAS = 0xd2,
    INSTITUTION_ALIAS_WILDCARD = 0xd3,
    BOT = 0xd4,
    BOT_WILDCARD = 0xd5,
    ENDPOINT = 0xd6,
    ENDPOINT_WILDCARD = 0xd7,
    SYNC = 0xd8,
    STOP_SYNC = 0xd9,
    LABEL = 0xda,
    SET_LABEL = 0xdb,
    LABEL_ACTION = 0xdc,
    STOP_STREAM = 0xdd,
    FILTER = 0xde,
    NOT_EQUAL = 0xdf,

    ARRAY_START = 0xe0,
    ARRAY_END = 0xe1,
    OBJECT_START = 0xe2,
    OBJECT_END = 0xe3,
    TUPLE_START = 0xe4,
    TUPLE_END = 0xe5,
    RECORD_START = 0xe6,
    RECORD_END = 0xe7,
    ELEMENT_WITH_KEY = 0xe8,
    ELEMENT = 0xe9,
    AND = 0xea,
    OR = 0xeb,
    NOT = 0xec,
    STREAM = 0xed,
    EXTENDED_TYPE = 0xee,
    CHILD_GET_REF = 0xef,
    CHILD_GET = 0xf0,
    CHILD_SET = 0xf1,
    CHILD_ACTION = 0xf2,
    THROW_ERROR = 0xf4,
    GET_TYPE = 0xf5,
    REMOTE = 0xf6,
    KEY_PERMISSION = 0xf7,
    ADD = 0xf8,
    SUBTRACT = 0xfa,
    MULTIPLY = 0xfb,
    DIVIDE = 0xfc,
    RANGE = 0xfd,
    EXTEND = 0xfe,
    TYPE = 0xff,
}

impl Opcode {
    /// Short codes for the standard types, in table order
    const STD_TYPES: [(Opcode, &'static str); 22] = [
        (Opcode::STD_TYPE_STRING, "String"),
        (Opcode::STD_TYPE_INT, "Int"),
        (Opcode::STD_TYPE_FLOAT, "Float"),
        (Opcode::STD_TYPE_BOOLEAN, "Boolean"),
        (Opcode::STD_TYPE_NULL, "Null"),
        (Opcode::STD_TYPE_VOID, "Void"),
        (Opcode::STD_TYPE_BUFFER, "Buffer"),
        (Opcode::STD_TYPE_CODE_BLOCK, "Datex"),
        (Opcode::STD_TYPE_UNIT, "Unit"),
        (Opcode::STD_TYPE_FILTER, "Filter"),
        (Opcode::STD_TYPE_ARRAY, "Array"),
        (Opcode::STD_TYPE_OBJECT, "Object"),
        (Opcode::STD_TYPE_SET, "Set"),
        (Opcode::STD_TYPE_MAP, "Map"),
        (Opcode::STD_TYPE_TUPLE, "Tuple"),
        (Opcode::STD_TYPE_RECORD, "Record"),
        (Opcode::STD_TYPE_FUNCTION, "Function"),
        (Opcode::STD_TYPE_STREAM, "Stream"),
        (Opcode::STD_TYPE_ANY, "Any"),
        (Opcode::STD_TYPE_ASSERTION, "Assertion"),
        (Opcode::STD_TYPE_TASK, "Task"),
        (Opcode::STD_TYPE_ITERATOR, "Iterator"),
    ];

    /// Standard type name of a short type code
    pub fn std_type_name(self) -> Option<&'static str> {
        Self::STD_TYPES
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, name)| *name)
    }

    /// Short type code for a standard type name
    pub fn for_std_type(name: &str) -> Option<Opcode> {
        Self::STD_TYPES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(op, _)| *op)
    }

    #[inline]
    pub fn is_std_type(self) -> bool {
        (0x10..=0x25).contains(&(self as u8))
    }

    #[inline]
    pub fn is_target(self) -> bool {
        (0xd0..=0xd7).contains(&(self as u8))
    }

    /// Infix operators that combine the active value with the next one
    pub fn is_binary_operator(self) -> bool {
        matches!(
            self,
            Opcode::ADD
                | Opcode::SUBTRACT
                | Opcode::MULTIPLY
                | Opcode::DIVIDE
                | Opcode::AND
                | Opcode::OR
                | Opcode::EQUAL
                | Opcode::NOT_EQUAL
                | Opcode::EQUAL_VALUE
                | Opcode::NOT_EQUAL_VALUE
                | Opcode::GREATER
                | Opcode::LESS
                | Opcode::GREATER_EQUAL
                | Opcode::LESS_EQUAL
                | Opcode::RANGE
                | Opcode::HAS
        )
    }

    /// Access opcodes before which a pending cast is deferred
    pub fn defers_cast(self) -> bool {
        matches!(self, Opcode::CHILD_GET | Opcode::CHILD_GET_REF) || self.is_binary_operator()
    }

    /// Scope block prefixes
    pub fn is_block_kind(self) -> bool {
        matches!(
            self,
            Opcode::FUNCTION
                | Opcode::DO
                | Opcode::ASSERT
                | Opcode::REMOTE
                | Opcode::ITERATOR
                | Opcode::TRANSFORM
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Compound-assignment specifier following an action opcode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
    /// `$=` - assign a new pointer wrapping the value
    CreatePointer,
}

impl ActionKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match Opcode::from_byte(b)? {
            Opcode::ADD => Some(ActionKind::Add),
            Opcode::SUBTRACT => Some(ActionKind::Subtract),
            Opcode::MULTIPLY => Some(ActionKind::Multiply),
            Opcode::DIVIDE => Some(ActionKind::Divide),
            Opcode::AND => Some(ActionKind::And),
            Opcode::OR => Some(ActionKind::Or),
            Opcode::CREATE_POINTER => Some(ActionKind::CreatePointer),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.opcode().to_byte()
    }

    pub fn opcode(self) -> Opcode {
        match self {
            ActionKind::Add => Opcode::ADD,
            ActionKind::Subtract => Opcode::SUBTRACT,
            ActionKind::Multiply => Opcode::MULTIPLY,
            ActionKind::Divide => Opcode::DIVIDE,
            ActionKind::And => Opcode::AND,
            ActionKind::Or => Opcode::OR,
            ActionKind::CreatePointer => Opcode::CREATE_POINTER,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ActionKind::Add => "+=",
            ActionKind::Subtract => "-=",
            ActionKind::Multiply => "*=",
            ActionKind::Divide => "/=",
            ActionKind::And => "&=",
            ActionKind::Or => "|=",
            ActionKind::CreatePointer => "$=",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_roundtrip() {
        for b in 0..=255u8 {
            if let Some(op) = Opcode::from_byte(b) {
                assert_eq!(op.to_byte(), b);
            }
        }
    }

    #[test]
    fn test_fixed_values() {
        assert_eq!(Opcode::END.to_byte(), 0x00);
        assert_eq!(Opcode::JFA.to_byte(), 0x66);
        assert_eq!(Opcode::SHORT_STRING.to_byte(), 0xce);
        assert_eq!(Opcode::TYPE.to_byte(), 0xff);
        assert_eq!(Opcode::from_byte(0xf3), None);
        assert_eq!(Opcode::from_byte(0xf9), None);
    }

    #[test]
    fn test_std_type_codes() {
        assert_eq!(Opcode::for_std_type("Int"), Some(Opcode::STD_TYPE_INT));
        assert_eq!(Opcode::STD_TYPE_ITERATOR.std_type_name(), Some("Iterator"));
        assert!(Opcode::STD_TYPE_ANY.is_std_type());
        assert_eq!(Opcode::for_std_type("Pointer"), None);
    }

    #[test]
    fn test_action_specifiers() {
        let b = ActionKind::Subtract.to_byte();
        assert_eq!(ActionKind::from_byte(b), Some(ActionKind::Subtract));
        assert_eq!(ActionKind::from_byte(Opcode::END.to_byte()), None);
    }
}
