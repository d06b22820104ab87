//! Error types for DATEX

use std::fmt;

use thiserror::Error;

/// Error family, stable across the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    Syntax = 1,
    Compiler = 2,
    Pointer = 3,
    Value = 4,
    Permission = 5,
    Type = 6,
    Network = 7,
    Runtime = 8,
    Security = 9,
    Assertion = 10,
}

impl ErrorKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ErrorKind::Syntax),
            2 => Some(ErrorKind::Compiler),
            3 => Some(ErrorKind::Pointer),
            4 => Some(ErrorKind::Value),
            5 => Some(ErrorKind::Permission),
            6 => Some(ErrorKind::Type),
            7 => Some(ErrorKind::Network),
            8 => Some(ErrorKind::Runtime),
            9 => Some(ErrorKind::Security),
            10 => Some(ErrorKind::Assertion),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Compiler => "CompilerError",
            ErrorKind::Pointer => "PointerError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::Assertion => "AssertionError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One hop of a distributed error trace: the endpoint that rethrew and
/// where (`sid:instruction`) the error passed through it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceHop {
    pub endpoint: String,
    pub location: String,
}

impl fmt::Display for TraceHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.location)
    }
}

/// Core DATEX errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatexError {
    /// Malformed opcode stream
    #[error("SyntaxError: {0}")]
    Syntax(String),

    #[error("CompilerError: {0}")]
    Compiler(String),

    /// Missing, already allocated or unauthorized pointer operation
    #[error("PointerError: {0}")]
    Pointer(String),

    /// Shape, key or type violation
    #[error("ValueError: {0}")]
    Value(String),

    #[error("PermissionError: {0}")]
    Permission(String),

    /// Cast failure or argument mismatch
    #[error("TypeError: {0}")]
    Type(String),

    /// No transport, no receivers, too many redirects, timeouts
    #[error("NetworkError: {0}")]
    Network(String),

    /// Interpreter fault
    #[error("RuntimeError: {0}")]
    Runtime(String),

    /// Bad magic, signature or decryption
    #[error("SecurityError: {0}")]
    Security(String),

    #[error("AssertionError: {0}")]
    Assertion(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// An error annotated with the hops it travelled through
    #[error("{error}")]
    Traced {
        error: Box<DatexError>,
        trace: Vec<TraceHop>,
    },
}

impl DatexError {
    /// Rebuild an error from its wire kind and message
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Syntax => DatexError::Syntax(message),
            ErrorKind::Compiler => DatexError::Compiler(message),
            ErrorKind::Pointer => DatexError::Pointer(message),
            ErrorKind::Value => DatexError::Value(message),
            ErrorKind::Permission => DatexError::Permission(message),
            ErrorKind::Type => DatexError::Type(message),
            ErrorKind::Network => DatexError::Network(message),
            ErrorKind::Runtime => DatexError::Runtime(message),
            ErrorKind::Security => DatexError::Security(message),
            ErrorKind::Assertion => DatexError::Assertion(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DatexError::Syntax(_) | DatexError::BufferTooShort { .. } => ErrorKind::Syntax,
            DatexError::Compiler(_) => ErrorKind::Compiler,
            DatexError::Pointer(_) => ErrorKind::Pointer,
            DatexError::Value(_) => ErrorKind::Value,
            DatexError::Permission(_) => ErrorKind::Permission,
            DatexError::Type(_) => ErrorKind::Type,
            DatexError::Network(_) => ErrorKind::Network,
            DatexError::Runtime(_) => ErrorKind::Runtime,
            DatexError::Security(_) => ErrorKind::Security,
            DatexError::Assertion(_) => ErrorKind::Assertion,
            DatexError::Traced { error, .. } => error.kind(),
        }
    }

    /// Message without the kind prefix
    pub fn message(&self) -> String {
        match self {
            DatexError::Syntax(m)
            | DatexError::Compiler(m)
            | DatexError::Pointer(m)
            | DatexError::Value(m)
            | DatexError::Permission(m)
            | DatexError::Type(m)
            | DatexError::Network(m)
            | DatexError::Runtime(m)
            | DatexError::Security(m)
            | DatexError::Assertion(m) => m.clone(),
            DatexError::BufferTooShort { expected, actual } => {
                format!("expected {} bytes, got {}", expected, actual)
            }
            DatexError::Traced { error, .. } => error.message(),
        }
    }

    pub fn trace(&self) -> &[TraceHop] {
        match self {
            DatexError::Traced { trace, .. } => trace,
            _ => &[],
        }
    }

    /// Append a hop to the trace
    pub fn with_hop(self, hop: TraceHop) -> Self {
        match self {
            DatexError::Traced { error, mut trace } => {
                trace.push(hop);
                DatexError::Traced { error, trace }
            }
            other => DatexError::Traced {
                error: Box::new(other),
                trace: vec![hop],
            },
        }
    }

    /// Whether the error only signals that more input is needed
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DatexError::BufferTooShort { .. })
    }

    /// The underlying error with any trace stripped
    pub fn root(&self) -> &DatexError {
        match self {
            DatexError::Traced { error, .. } => error.root(),
            other => other,
        }
    }
}

/// Result type for DATEX operations
pub type DatexResult<T> = Result<T, DatexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for b in 1..=10u8 {
            let kind = ErrorKind::from_byte(b).unwrap();
            assert_eq!(kind.to_byte(), b);
        }
        assert!(ErrorKind::from_byte(0).is_none());
        assert!(ErrorKind::from_byte(11).is_none());
    }

    #[test]
    fn test_from_kind_preserves_message() {
        let err = DatexError::from_kind(ErrorKind::Pointer, "gone");
        assert_eq!(err, DatexError::Pointer("gone".into()));
        assert_eq!(err.to_string(), "PointerError: gone");
    }

    #[test]
    fn test_trace_accumulates() {
        let err = DatexError::Value("bad key".into())
            .with_hop(TraceHop {
                endpoint: "@a".into(),
                location: "1:4".into(),
            })
            .with_hop(TraceHop {
                endpoint: "@b".into(),
                location: "7:0".into(),
            });

        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.trace().len(), 2);
        assert_eq!(err.message(), "bad key");
        assert_eq!(err.root(), &DatexError::Value("bad key".into()));
    }
}
