//! Complete blocks and scope splitting
//!
//! Block = Header + Body. A scope body larger than the maximum block size
//! is split into consecutive blocks with increasing increments; only the
//! last one carries `end_of_scope`.

use datex_core::{DatexError, DatexResult, Endpoint, SessionId, Timestamp, Value};

use crate::{encode_value, patch_block_size, BlockFlags, Header, HeaderLayout, MessageKind, Receivers, SecurityMode, DEFAULT_TTL};

/// AEAD tag appended to encrypted bodies
pub const AUTH_TAG_SIZE: usize = 16;

/// Maximum block size representable in the header
pub const MAX_BLOCK_SIZE: usize = u16::MAX as usize;

/// Per-block outbound options
#[derive(Clone, Debug)]
pub struct BlockOptions {
    pub kind: MessageKind,
    pub sid: SessionId,
    pub return_index: u16,
    pub ttl: u8,
    pub priority: u8,
    pub receivers: Receivers,
    pub sign: bool,
    pub encrypt: bool,
    pub executable: bool,
    pub end_of_scope: bool,
    pub timestamp: Timestamp,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            kind: MessageKind::Request,
            sid: SessionId::ZERO,
            return_index: 0,
            ttl: DEFAULT_TTL,
            priority: 0,
            receivers: Receivers::None,
            sign: false,
            encrypt: false,
            executable: false,
            end_of_scope: true,
            timestamp: Timestamp::ZERO,
        }
    }
}

impl BlockOptions {
    /// Header for one block of a scope
    pub fn header(&self, sender: Option<&Endpoint>, inc: u16, last: bool) -> Header {
        let mut flags = BlockFlags::NONE;
        flags.set_executable(self.executable);
        flags.set_end_of_scope(self.end_of_scope && last);
        Header {
            ttl: self.ttl,
            priority: self.priority,
            security: SecurityMode::new(self.sign, self.encrypt),
            sender: sender.cloned(),
            receivers: self.receivers.clone(),
            return_index: self.return_index,
            inc,
            flags,
            timestamp: self.timestamp,
            ..Header::new(self.sid, self.kind)
        }
    }
}

/// One wire block
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub header: Header,
    /// Body bytes, still encrypted if the header says so
    pub body: Vec<u8>,
}

impl Block {
    pub fn new(header: Header, body: Vec<u8>) -> Self {
        Block { header, body }
    }

    /// Parse a block without verification or decryption
    pub fn parse(buf: &[u8]) -> DatexResult<(Self, HeaderLayout)> {
        let (header, layout) = Header::parse(buf)?;
        let body = buf[layout.body_offset..header.block_size as usize].to_vec();
        Ok((Block { header, body }, layout))
    }

    /// Serialize with the block size filled in
    pub fn to_bytes(&self) -> DatexResult<(Vec<u8>, HeaderLayout)> {
        let (mut bytes, layout) = self.header.to_bytes()?;
        bytes.extend_from_slice(&self.body);
        if bytes.len() > MAX_BLOCK_SIZE {
            return Err(DatexError::Value(format!(
                "block too large: {} > {}",
                bytes.len(),
                MAX_BLOCK_SIZE
            )));
        }
        let size = bytes.len() as u16;
        patch_block_size(&mut bytes, size)?;
        Ok((bytes, layout))
    }
}

/// Split a scope body into blocks no larger than `max_block_size`
pub fn split_scope(
    sender: Option<&Endpoint>,
    options: &BlockOptions,
    body: &[u8],
    max_block_size: usize,
) -> DatexResult<Vec<Block>> {
    let max_block_size = max_block_size.min(MAX_BLOCK_SIZE);
    let header_size = options.header(sender, 0, true).serialized_size()?;
    let overhead = header_size + if options.encrypt { AUTH_TAG_SIZE } else { 0 };
    if overhead >= max_block_size {
        return Err(DatexError::Value(format!(
            "header of {} bytes leaves no room in {} byte blocks",
            overhead, max_block_size
        )));
    }
    let chunk = max_block_size - overhead;

    let chunks: Vec<&[u8]> = if body.is_empty() {
        vec![body]
    } else {
        body.chunks(chunk).collect()
    };
    if chunks.len() > u16::MAX as usize + 1 {
        return Err(DatexError::Value("scope needs too many blocks".into()));
    }

    let last = chunks.len() - 1;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(inc, part)| Block::new(options.header(sender, inc as u16, inc == last), part.to_vec()))
        .collect())
}

/// Encode a value and split it into unsigned, unencrypted blocks
pub fn encode_blocks(
    value: &Value,
    sender: Option<&Endpoint>,
    options: &BlockOptions,
    max_block_size: usize,
) -> DatexResult<Vec<Vec<u8>>> {
    let body = encode_value(value)?;
    split_scope(sender, options, &body, max_block_size)?
        .iter()
        .map(|b| b.to_bytes().map(|(bytes, _)| bytes))
        .collect()
}
