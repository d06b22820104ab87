//! Identity types for DATEX
//!
//! Pointer ids are fixed-size so they can be embedded in headers and
//! opcode streams without a length prefix.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::{DatexError, DatexResult};

/// Size of every pointer id on the wire
pub const POINTER_ID_SIZE: usize = 26;

/// Significant bytes of a static pointer id
pub const STATIC_POINTER_ID_SIZE: usize = 18;

/// Size of an endpoint fingerprint
pub const ENDPOINT_ID_SIZE: usize = 12;

/// Pointer id namespace, stored in the first id byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PointerKind {
    /// All-zero id
    Anonymous = 0,
    /// Random id allocated by the origin endpoint
    Default = 1,
    /// Address-derived id
    Ipv6 = 2,
    /// Static per-endpoint id
    Static = 3,
    Public = 5,
    /// Externally anchored id
    Blockchain = 0xBC,
}

impl PointerKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PointerKind::Anonymous),
            1 => Some(PointerKind::Default),
            2 => Some(PointerKind::Ipv6),
            3 => Some(PointerKind::Static),
            5 => Some(PointerKind::Public),
            0xBC => Some(PointerKind::Blockchain),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Endpoint fingerprint - truncated hash of the endpoint name
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EndpointId(pub [u8; ENDPOINT_ID_SIZE]);

impl EndpointId {
    pub const ZERO: EndpointId = EndpointId([0; ENDPOINT_ID_SIZE]);

    /// Derive from a canonical endpoint name (first 12 bytes of SHA-256)
    pub fn from_name(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        let hash = hasher.finalize();
        let mut id = [0u8; ENDPOINT_ID_SIZE];
        id.copy_from_slice(&hash[..ENDPOINT_ID_SIZE]);
        EndpointId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; ENDPOINT_ID_SIZE] {
        self.0
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

/// Globally addressable pointer id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointerId(pub [u8; POINTER_ID_SIZE]);

impl PointerId {
    pub const ANONYMOUS: PointerId = PointerId([0; POINTER_ID_SIZE]);

    /// Default id layout: kind, endpoint, random instance, timestamp, counter
    pub fn new_default(endpoint: EndpointId, instance: [u8; 8], timestamp_secs: u32, counter: u8) -> Self {
        let mut id = [0u8; POINTER_ID_SIZE];
        id[0] = PointerKind::Default.to_byte();
        id[1..13].copy_from_slice(&endpoint.0);
        id[13..21].copy_from_slice(&instance);
        id[21..25].copy_from_slice(&timestamp_secs.to_le_bytes());
        id[25] = counter;
        PointerId(id)
    }

    /// Static id: kind, endpoint, 5-byte suffix
    pub fn new_static(endpoint: EndpointId, suffix: [u8; 5]) -> Self {
        let mut id = [0u8; POINTER_ID_SIZE];
        id[0] = PointerKind::Static.to_byte();
        id[1..13].copy_from_slice(&endpoint.0);
        id[13..18].copy_from_slice(&suffix);
        PointerId(id)
    }

    /// Externally anchored id (blockchain transaction reference)
    pub fn new_anchored(anchor: &[u8]) -> Self {
        let mut id = [0u8; POINTER_ID_SIZE];
        id[0] = PointerKind::Blockchain.to_byte();
        let len = anchor.len().min(POINTER_ID_SIZE - 1);
        id[1..1 + len].copy_from_slice(&anchor[..len]);
        PointerId(id)
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; POINTER_ID_SIZE]) -> Self {
        PointerId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> DatexResult<Self> {
        if bytes.len() < POINTER_ID_SIZE {
            return Err(DatexError::BufferTooShort {
                expected: POINTER_ID_SIZE,
                actual: bytes.len(),
            });
        }
        let mut id = [0u8; POINTER_ID_SIZE];
        id.copy_from_slice(&bytes[..POINTER_ID_SIZE]);
        Ok(PointerId(id))
    }

    /// Parse from `$`-prefixed or bare hex
    pub fn from_hex(s: &str) -> DatexResult<Self> {
        let s = s.strip_prefix('$').unwrap_or(s);
        if s.len() > POINTER_ID_SIZE * 2 || s.len() % 2 != 0 {
            return Err(DatexError::Value(format!("invalid pointer id: {}", s)));
        }
        let mut id = [0u8; POINTER_ID_SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk)
                .map_err(|_| DatexError::Value(format!("invalid pointer id: {}", s)))?;
            id[i] = u8::from_str_radix(text, 16)
                .map_err(|_| DatexError::Value(format!("invalid pointer id: {}", s)))?;
        }
        Ok(PointerId(id))
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; POINTER_ID_SIZE] {
        self.0
    }

    /// Namespace of this id, `None` for unknown kind bytes
    pub fn kind(&self) -> Option<PointerKind> {
        if self.is_anonymous() {
            return Some(PointerKind::Anonymous);
        }
        PointerKind::from_byte(self.0[0])
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.0[0] == PointerKind::Static.to_byte()
    }

    #[inline]
    pub fn is_anchored(&self) -> bool {
        self.0[0] == PointerKind::Blockchain.to_byte()
    }

    /// Endpoint that allocated the id, for default and static ids
    pub fn endpoint(&self) -> Option<EndpointId> {
        match self.kind() {
            Some(PointerKind::Default) | Some(PointerKind::Static) => {
                let mut e = [0u8; ENDPOINT_ID_SIZE];
                e.copy_from_slice(&self.0[1..13]);
                Some(EndpointId(e))
            }
            _ => None,
        }
    }

    /// Creation time in seconds since the protocol epoch (default ids only)
    pub fn timestamp_secs(&self) -> Option<u32> {
        match self.kind() {
            Some(PointerKind::Default) => {
                Some(u32::from_le_bytes([self.0[21], self.0[22], self.0[23], self.0[24]]))
            }
            _ => None,
        }
    }

    fn significant_len(&self) -> usize {
        if self.is_static() {
            STATIC_POINTER_ID_SIZE
        } else {
            POINTER_ID_SIZE
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Debug for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointer(")?;
        write_hex(f, &self.0[..self.significant_len()])?;
        write!(f, ")")
    }
}

impl fmt::Display for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        write_hex(f, &self.0[..self.significant_len()])
    }
}

/// Session identity - correlates request and response blocks
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    pub const ZERO: SessionId = SessionId(0);

    #[inline]
    pub fn new(id: u32) -> Self {
        SessionId(id)
    }

    #[inline]
    pub fn next(self) -> Self {
        SessionId(self.0.wrapping_add(1).max(1))
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        SessionId(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pointer_layout() {
        let endpoint = EndpointId::from_name("@alice");
        let id = PointerId::new_default(endpoint, [7; 8], 1234, 9);

        assert_eq!(id.kind(), Some(PointerKind::Default));
        assert_eq!(id.endpoint(), Some(endpoint));
        assert_eq!(id.timestamp_secs(), Some(1234));
        assert_eq!(id.0[25], 9);
        assert!(!id.is_anonymous());
    }

    #[test]
    fn test_static_pointer_display_is_short() {
        let id = PointerId::new_static(EndpointId::from_name("@bob"), [1, 2, 3, 4, 5]);
        assert!(id.is_static());
        // '$' + 18 bytes of hex
        assert_eq!(id.to_string().len(), 1 + STATIC_POINTER_ID_SIZE * 2);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = PointerId::new_default(EndpointId::from_name("@x"), [0xAB; 8], 42, 1);
        let parsed = PointerId::from_hex(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert!(PointerId::from_hex("$zz").is_err());
    }

    #[test]
    fn test_anonymous() {
        assert!(PointerId::ANONYMOUS.is_anonymous());
        assert_eq!(PointerId::ANONYMOUS.kind(), Some(PointerKind::Anonymous));
        assert!(PointerId::ANONYMOUS.endpoint().is_none());
    }

    #[test]
    fn test_endpoint_id_deterministic() {
        assert_eq!(EndpointId::from_name("@alice"), EndpointId::from_name("@alice"));
        assert_ne!(EndpointId::from_name("@alice"), EndpointId::from_name("@bob"));
    }

    #[test]
    fn test_session_id_next_skips_zero() {
        assert_eq!(SessionId(u32::MAX).next(), SessionId(1));
        assert_eq!(SessionId(5).next(), SessionId(6));
    }
}
