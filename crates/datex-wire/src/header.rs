//! Block header for the DATEX wire protocol
//!
//! Layout (all integers little endian):
//! - Bytes 0-1: Magic (0x01 0x64)
//! - Byte 2: Version
//! - Bytes 3-4: Block size, header included
//! - Byte 5: TTL
//! - Byte 6: Priority
//! - Byte 7: Signed/encrypted tri-state
//! - Sender target (type 0 = anonymous)
//! - Receiver section length (u16, 0 = none, 0xFFFF = flood) + section
//! - Signature (64 bytes, only if signed)
//! - Session id (u32), return index (u16), block increment (u16)
//! - Message kind, flags, timestamp (u64)
//! - IV (16 bytes, only if encrypted)
//!
//! The signature covers everything from the session id to the end of the
//! block, so relays may rewrite the TTL without breaking it.

use bytes::BufMut;
use datex_core::{Cnf, DatexError, DatexResult, Endpoint, SessionId, Target, Timestamp};

use crate::{
    read_clause_table, read_sender, read_target, write_clause_table, write_sender, write_target, BlockFlags,
    ByteReader, MessageKind, SecurityMode,
};

pub const MAGIC: [u8; 2] = [0x01, 0x64];

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

pub const DEFAULT_TTL: u8 = 64;

/// Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

pub const IV_SIZE: usize = 16;

/// Ephemeral X25519 public key + sealed session key
pub const KEY_BLOB_SIZE: usize = 80;

/// Receiver length sentinel for flooding
pub const RECEIVERS_FLOOD: u16 = 0xFFFF;

/// Offset of the TTL byte
const TTL_OFFSET: usize = 5;

/// Offset of the block size field
const BLOCK_SIZE_OFFSET: usize = 3;

pub type KeyBlob = [u8; KEY_BLOB_SIZE];

/// Receiver filter with optional per-target key blobs
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverFilter {
    pub cnf: Cnf,
    pub keys: Vec<(Target, KeyBlob)>,
}

/// Receiver field of a header
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Receivers {
    #[default]
    None,
    /// Broadcast relayed up to the TTL
    Flood,
    Filter(ReceiverFilter),
}

impl Receivers {
    pub fn to(cnf: Cnf) -> Self {
        Receivers::Filter(ReceiverFilter { cnf, keys: Vec::new() })
    }

    pub fn endpoint(endpoint: Endpoint) -> Self {
        Receivers::to(Cnf::target(Target::Endpoint(endpoint)))
    }

    #[inline]
    pub fn is_flood(&self) -> bool {
        matches!(self, Receivers::Flood)
    }

    pub fn filter(&self) -> Option<&Cnf> {
        match self {
            Receivers::Filter(f) => Some(&f.cnf),
            _ => None,
        }
    }

    /// Key blob addressed to an endpoint
    pub fn key_for(&self, endpoint: &Endpoint) -> Option<&KeyBlob> {
        let Receivers::Filter(f) = self else {
            return None;
        };
        let candidate = Target::Endpoint(endpoint.clone());
        f.keys
            .iter()
            .find(|(t, _)| t.matches(&candidate))
            .map(|(_, blob)| blob)
    }

    fn write_section(&self) -> DatexResult<Option<Vec<u8>>> {
        let Receivers::Filter(f) = self else {
            return Ok(None);
        };
        let targets = f.cnf.targets();
        if targets.len() > i8::MAX as usize {
            return Err(DatexError::Value(format!("too many receivers: {}", targets.len())));
        }

        let mut sec = Vec::new();
        sec.put_u8(targets.len() as u8);
        for t in &targets {
            write_target(&mut sec, t)?;
            match f.keys.iter().find(|(k, _)| k == t) {
                Some((_, blob)) => {
                    sec.put_u8(1);
                    sec.put_slice(blob);
                }
                None => sec.put_u8(0),
            }
        }

        write_clause_table(&mut sec, &f.cnf, &targets)?;

        if sec.len() >= RECEIVERS_FLOOD as usize {
            return Err(DatexError::Value("receiver section too large".into()));
        }
        Ok(Some(sec))
    }

    fn read_section(r: &mut ByteReader<'_>) -> DatexResult<Self> {
        let count = r.u8()? as usize;
        let mut targets = Vec::with_capacity(count);
        let mut keys = Vec::new();
        for _ in 0..count {
            let b = r.u8()?;
            let target = read_target(r, b)?;
            if r.u8()? != 0 {
                keys.push((target.clone(), r.array::<KEY_BLOB_SIZE>()?));
            }
            targets.push(target);
        }

        let cnf = read_clause_table(r, &targets)?;
        Ok(Receivers::Filter(ReceiverFilter { cnf, keys }))
    }
}

/// Byte offsets inside a serialized header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderLayout {
    pub signature_offset: Option<usize>,
    /// First byte covered by the signature
    pub signed_from: usize,
    pub iv_offset: Option<usize>,
    pub body_offset: usize,
}

/// Parsed block header
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub version: u8,
    /// Total block size, header included
    pub block_size: u16,
    pub ttl: u8,
    pub priority: u8,
    pub security: SecurityMode,
    /// None for anonymous blocks
    pub sender: Option<Endpoint>,
    pub receivers: Receivers,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
    pub sid: SessionId,
    pub return_index: u16,
    /// Position of this block within its scope
    pub inc: u16,
    pub kind: MessageKind,
    pub flags: BlockFlags,
    pub timestamp: Timestamp,
    pub iv: Option<[u8; IV_SIZE]>,
}

impl Header {
    /// Create a new header with default values
    pub fn new(sid: SessionId, kind: MessageKind) -> Self {
        Header {
            version: PROTOCOL_VERSION,
            block_size: 0,
            ttl: DEFAULT_TTL,
            priority: 0,
            security: SecurityMode::None,
            sender: None,
            receivers: Receivers::None,
            signature: None,
            sid,
            return_index: 0,
            inc: 0,
            kind,
            flags: BlockFlags::NONE,
            timestamp: Timestamp::ZERO,
            iv: None,
        }
    }

    /// Parse a header; any malformed or truncated input is a SecurityError
    pub fn parse(buf: &[u8]) -> DatexResult<(Self, HeaderLayout)> {
        Header::parse_inner(buf).map_err(|e| match e {
            DatexError::BufferTooShort { expected, actual } => DatexError::Security(format!(
                "truncated header: expected {} bytes, got {}",
                expected, actual
            )),
            DatexError::Security(m) => DatexError::Security(m),
            other => DatexError::Security(format!("invalid header: {}", other.message())),
        })
    }

    fn parse_inner(buf: &[u8]) -> DatexResult<(Self, HeaderLayout)> {
        let mut r = ByteReader::new(buf);

        if r.array::<2>()? != MAGIC {
            return Err(DatexError::Security("bad magic number".into()));
        }
        let version = r.u8()?;
        let block_size = r.u16()?;
        let ttl = r.u8()?;
        let priority = r.u8()?;
        let sec_byte = r.u8()?;
        let security = SecurityMode::from_byte(sec_byte)
            .ok_or_else(|| DatexError::Security(format!("invalid security mode {}", sec_byte)))?;

        let sender = read_sender(&mut r)?;

        let receivers = match r.u16()? {
            0 => Receivers::None,
            RECEIVERS_FLOOD => Receivers::Flood,
            len => {
                let section = r.bytes(len as usize)?;
                let mut sr = ByteReader::new(section);
                let receivers = Receivers::read_section(&mut sr)?;
                if !sr.is_empty() {
                    return Err(DatexError::Security("trailing bytes in receiver section".into()));
                }
                receivers
            }
        };

        let (signature, signature_offset) = if security.is_signed() {
            let at = r.position();
            (Some(r.array::<SIGNATURE_SIZE>()?), Some(at))
        } else {
            (None, None)
        };
        let signed_from = r.position();

        let sid = SessionId::new(r.u32()?);
        let return_index = r.u16()?;
        let inc = r.u16()?;
        let kind_byte = r.u8()?;
        let kind = MessageKind::from_byte(kind_byte)
            .ok_or_else(|| DatexError::Security(format!("unknown message kind {}", kind_byte)))?;
        let flags = BlockFlags::new(r.u8()?);
        let timestamp = Timestamp::from_millis(r.u64()?);

        let (iv, iv_offset) = if security.is_encrypted() {
            let at = r.position();
            (Some(r.array::<IV_SIZE>()?), Some(at))
        } else {
            (None, None)
        };
        let body_offset = r.position();

        if (block_size as usize) < body_offset || block_size as usize > buf.len() {
            return Err(DatexError::Security(format!(
                "block size {} does not fit buffer of {} bytes",
                block_size,
                buf.len()
            )));
        }

        Ok((
            Header {
                version,
                block_size,
                ttl,
                priority,
                security,
                sender,
                receivers,
                signature,
                sid,
                return_index,
                inc,
                kind,
                flags,
                timestamp,
                iv,
            },
            HeaderLayout {
                signature_offset,
                signed_from,
                iv_offset,
                body_offset,
            },
        ))
    }

    /// Serialize the header; a missing signature or IV is zero-filled
    pub fn write<B: BufMut>(&self, buf: &mut B) -> DatexResult<HeaderLayout> {
        let mut out = Vec::with_capacity(64);
        out.put_slice(&MAGIC);
        out.put_u8(self.version);
        out.put_u16_le(self.block_size);
        out.put_u8(self.ttl);
        out.put_u8(self.priority);
        out.put_u8(self.security.to_byte());
        write_sender(&mut out, self.sender.as_ref())?;

        match &self.receivers {
            Receivers::None => out.put_u16_le(0),
            Receivers::Flood => out.put_u16_le(RECEIVERS_FLOOD),
            filter => {
                let sec = filter.write_section()?.unwrap_or_default();
                out.put_u16_le(sec.len() as u16);
                out.put_slice(&sec);
            }
        }

        let signature_offset = if self.security.is_signed() {
            let at = out.len();
            out.put_slice(&self.signature.unwrap_or([0u8; SIGNATURE_SIZE]));
            Some(at)
        } else {
            None
        };
        let signed_from = out.len();

        out.put_u32_le(self.sid.0);
        out.put_u16_le(self.return_index);
        out.put_u16_le(self.inc);
        out.put_u8(self.kind.to_byte());
        out.put_u8(self.flags.0);
        out.put_u64_le(self.timestamp.as_millis());

        let iv_offset = if self.security.is_encrypted() {
            let at = out.len();
            out.put_slice(&self.iv.unwrap_or([0u8; IV_SIZE]));
            Some(at)
        } else {
            None
        };
        let body_offset = out.len();

        buf.put_slice(&out);
        Ok(HeaderLayout {
            signature_offset,
            signed_from,
            iv_offset,
            body_offset,
        })
    }

    /// Serialize header to a new Vec
    pub fn to_bytes(&self) -> DatexResult<(Vec<u8>, HeaderLayout)> {
        let mut buf = Vec::new();
        let layout = self.write(&mut buf)?;
        Ok((buf, layout))
    }

    /// Serialized header length
    pub fn serialized_size(&self) -> DatexResult<usize> {
        Ok(self.to_bytes()?.1.body_offset)
    }

    /// Whether the receivers explicitly include `endpoint`
    pub fn is_addressed_to(&self, endpoint: &Endpoint) -> bool {
        match &self.receivers {
            Receivers::None | Receivers::Flood => true,
            Receivers::Filter(f) => f.cnf.test(&[Target::Endpoint(endpoint.clone())]),
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Header::new(SessionId::ZERO, MessageKind::Request)
    }
}

/// Rewrite the TTL of a serialized block in place
pub fn patch_ttl(block: &mut [u8], ttl: u8) -> DatexResult<()> {
    if block.len() <= TTL_OFFSET {
        return Err(DatexError::BufferTooShort {
            expected: TTL_OFFSET + 1,
            actual: block.len(),
        });
    }
    block[TTL_OFFSET] = ttl;
    Ok(())
}

/// Rewrite the block size field of a serialized block in place
pub fn patch_block_size(block: &mut [u8], size: u16) -> DatexResult<()> {
    if block.len() < BLOCK_SIZE_OFFSET + 2 {
        return Err(DatexError::BufferTooShort {
            expected: BLOCK_SIZE_OFFSET + 2,
            actual: block.len(),
        });
    }
    block[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 2].copy_from_slice(&size.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::{to_normal_form, FilterExpr};

    fn sample() -> Header {
        let mut header = Header::new(SessionId::new(0xDEADBEEF), MessageKind::Response);
        header.ttl = 7;
        header.priority = 2;
        header.sender = Some(Endpoint::person("alice").with_instance("laptop"));
        header.return_index = 3;
        header.inc = 9;
        header.flags.set_executable(true);
        header.flags.set_end_of_scope(true);
        header.timestamp = Timestamp::from_millis(123_456_789);
        header
    }

    fn roundtrip(mut header: Header) -> Header {
        let (mut bytes, layout) = header.to_bytes().unwrap();
        let size = bytes.len() as u16;
        patch_block_size(&mut bytes, size).unwrap();
        header.block_size = size;
        let (parsed, parsed_layout) = Header::parse(&bytes).unwrap();
        assert_eq!(parsed_layout, layout);
        assert_eq!(parsed, header);
        parsed
    }

    #[test]
    fn test_header_roundtrip() {
        roundtrip(sample());
    }

    #[test]
    fn test_flood_and_anonymous() {
        let mut header = sample();
        header.sender = None;
        header.receivers = Receivers::Flood;
        assert!(roundtrip(header).receivers.is_flood());
    }

    #[test]
    fn test_receiver_filter_roundtrip() {
        let a = Target::Endpoint(Endpoint::person("a"));
        let b = Target::Endpoint(Endpoint::person("b"));
        let c = Target::Endpoint(Endpoint::person("c"));
        let cnf = to_normal_form(
            &FilterExpr::target(a.clone())
                .or(FilterExpr::target(b))
                .and(FilterExpr::target(c.clone()).not()),
        );

        let mut header = sample();
        header.receivers = Receivers::Filter(ReceiverFilter {
            cnf: cnf.clone(),
            keys: vec![(a.clone(), [7u8; KEY_BLOB_SIZE])],
        });
        let parsed = roundtrip(header);
        assert_eq!(parsed.receivers.filter(), Some(&cnf));
        assert_eq!(parsed.receivers.key_for(&Endpoint::person("a")), Some(&[7u8; KEY_BLOB_SIZE]));
        assert!(parsed.is_addressed_to(&Endpoint::person("a")));
        assert!(!parsed.is_addressed_to(&Endpoint::person("c")));
    }

    #[test]
    fn test_signed_encrypted_layout() {
        let mut header = sample();
        header.security = SecurityMode::SignedEncrypted;
        header.signature = Some([1u8; SIGNATURE_SIZE]);
        header.iv = Some([2u8; IV_SIZE]);
        let (bytes, layout) = header.to_bytes().unwrap();
        let sig_at = layout.signature_offset.unwrap();
        assert_eq!(layout.signed_from, sig_at + SIGNATURE_SIZE);
        assert_eq!(&bytes[layout.iv_offset.unwrap()..layout.body_offset], &[2u8; IV_SIZE]);
        roundtrip(header);
    }

    #[test]
    fn test_bad_magic() {
        let (mut bytes, _) = sample().to_bytes().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(Header::parse(&bytes), Err(DatexError::Security(_))));
    }

    #[test]
    fn test_truncated_is_security_error() {
        let (bytes, _) = sample().to_bytes().unwrap();
        for len in [0, 1, 5, bytes.len() - 1] {
            assert!(matches!(Header::parse(&bytes[..len]), Err(DatexError::Security(_))));
        }
    }

    #[test]
    fn test_patch_ttl() {
        let mut header = sample();
        let (mut bytes, _) = header.to_bytes().unwrap();
        let size = bytes.len() as u16;
        patch_block_size(&mut bytes, size).unwrap();
        patch_ttl(&mut bytes, 1).unwrap();
        header.ttl = 1;
        header.block_size = size;
        assert_eq!(Header::parse(&bytes).unwrap().0, header);
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_never_panics(tail in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let mut bytes = MAGIC.to_vec();
            bytes.extend_from_slice(&tail);
            let _ = Header::parse(&bytes);
        }
    }
}
