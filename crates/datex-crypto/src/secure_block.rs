//! Signing and encryption of wire blocks
//!
//! Signatures cover everything from the session id to the end of the
//! block, so relays may rewrite the TTL without breaking them. Encrypted
//! bodies use the sender's session key; recipients learn that key from the
//! blob addressed to them in the receiver section.

use std::sync::Arc;

use thiserror::Error;

use datex_core::{DatexError, DatexResult, Endpoint, Target};
use datex_wire::{Block, Header, HeaderLayout, Receivers, SIGNATURE_SIZE};

use crate::{generate_iv, nonce_from_iv, AeadCipher, KeyStore, KEY_SIZE};

/// A block that failed to open, with whatever header could be read
#[derive(Debug, Error)]
#[error("{error}")]
pub struct OpenError {
    pub header: Option<Box<Header>>,
    pub error: DatexError,
}

impl OpenError {
    fn new(header: &Header, error: DatexError) -> Self {
        OpenError {
            header: Some(Box::new(header.clone())),
            error,
        }
    }
}

/// A verified block with a plaintext body
#[derive(Clone, Debug)]
pub struct OpenedBlock {
    pub header: Header,
    pub layout: HeaderLayout,
    pub body: Vec<u8>,
}

fn body_aad(header: &Header) -> [u8; 6] {
    let mut aad = [0u8; 6];
    aad[..4].copy_from_slice(&header.sid.0.to_le_bytes());
    aad[4..].copy_from_slice(&header.inc.to_le_bytes());
    aad
}

/// Block security of one local endpoint
#[derive(Clone, Debug)]
pub struct BlockSecurity {
    endpoint: Endpoint,
    keys: Arc<KeyStore>,
}

impl BlockSecurity {
    pub fn new(endpoint: Endpoint, keys: Arc<KeyStore>) -> Self {
        BlockSecurity { endpoint, keys }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Add a session key blob for every endpoint receiver lacking one
    pub fn attach_keys(&self, receivers: &mut Receivers) -> DatexResult<()> {
        let Receivers::Filter(filter) = receivers else {
            return Err(DatexError::Security(
                "encrypted blocks need explicit receivers".into(),
            ));
        };
        for target in filter.cnf.targets() {
            let Target::Endpoint(endpoint) = &target else {
                continue;
            };
            if filter.keys.iter().any(|(t, _)| *t == target) {
                continue;
            }
            let blob = self.keys.wrap_for(endpoint)?;
            filter.keys.push((target.clone(), blob));
        }
        Ok(())
    }

    fn session_key(&self, sender: &Endpoint) -> Option<[u8; KEY_SIZE]> {
        if sender.main() == self.endpoint.main() {
            return Some(*self.keys.local_session_key());
        }
        self.keys.session_key_of(sender)
    }

    /// Encrypt and sign a block as its header requests
    pub fn seal(&self, mut block: Block) -> DatexResult<Vec<u8>> {
        if block.header.security.is_encrypted() {
            let iv = generate_iv();
            let cipher = AeadCipher::new(self.keys.local_session_key());
            block.body = cipher.encrypt(&nonce_from_iv(&iv), &body_aad(&block.header), &block.body)?;
            block.header.iv = Some(iv);
        }

        block.header.signature = None;
        let (mut bytes, layout) = block.to_bytes()?;
        if let Some(at) = layout.signature_offset {
            let signature = self.keys.identity().sign(&bytes[layout.signed_from..]);
            bytes[at..at + SIGNATURE_SIZE].copy_from_slice(&signature);
        }
        Ok(bytes)
    }

    /// Parse, verify and decrypt a serialized block
    pub fn open(&self, bytes: &[u8]) -> Result<OpenedBlock, OpenError> {
        let (block, layout) = Block::parse(bytes).map_err(|error| OpenError { header: None, error })?;
        let Block { header, mut body } = block;

        if let Some(signature) = &header.signature {
            let Some(sender) = &header.sender else {
                return Err(OpenError::new(&header, DatexError::Security("signed block without sender".into())));
            };
            let Some(public) = self.keys.identity_of(sender) else {
                return Err(OpenError::new(
                    &header,
                    DatexError::Security(format!("no verification key known for {}", sender)),
                ));
            };
            let signed = &bytes[layout.signed_from..header.block_size as usize];
            if !public.verify(signed, signature) {
                tracing::warn!(sender = %sender, sid = %header.sid, "invalid block signature");
                return Err(OpenError::new(&header, DatexError::Security("invalid signature".into())));
            }
        }

        if let Some(iv) = &header.iv {
            let Some(sender) = &header.sender else {
                return Err(OpenError::new(&header, DatexError::Security("encrypted block without sender".into())));
            };
            if let Some(blob) = header.receivers.key_for(&self.endpoint) {
                self.keys
                    .unwrap_from(sender, blob)
                    .map_err(|e| OpenError::new(&header, e))?;
            }
            let Some(key) = self.session_key(sender) else {
                return Err(OpenError::new(
                    &header,
                    DatexError::Security(format!("no session key for {}", sender)),
                ));
            };
            body = AeadCipher::new(&key)
                .decrypt(&nonce_from_iv(iv), &body_aad(&header), &body)
                .map_err(|e| OpenError::new(&header, e))?;
        }

        Ok(OpenedBlock { header, layout, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datex_core::SessionId;
    use datex_wire::{patch_ttl, BlockOptions};

    use crate::Identity;

    fn pair() -> (BlockSecurity, BlockSecurity) {
        let alice = BlockSecurity::new(Endpoint::person("alice"), Arc::new(KeyStore::new(Identity::generate())));
        let bob = BlockSecurity::new(Endpoint::person("bob"), Arc::new(KeyStore::new(Identity::generate())));
        alice.keys().register_identity(bob.endpoint(), bob.keys().identity().public());
        bob.keys().register_identity(alice.endpoint(), alice.keys().identity().public());
        (alice, bob)
    }

    fn block(alice: &BlockSecurity, sign: bool, encrypt: bool) -> Block {
        let options = BlockOptions {
            sid: SessionId::new(7),
            receivers: Receivers::endpoint(Endpoint::person("bob")),
            sign,
            encrypt,
            ..BlockOptions::default()
        };
        Block::new(options.header(Some(alice.endpoint()), 0, true), vec![0xc1, 42])
    }

    #[test]
    fn test_signed_block() {
        let (alice, bob) = pair();
        let bytes = alice.seal(block(&alice, true, false)).unwrap();
        let opened = bob.open(&bytes).unwrap();
        assert_eq!(opened.body, vec![0xc1, 42]);
        assert!(opened.header.signature.is_some());
    }

    #[test]
    fn test_ttl_patch_keeps_signature_valid() {
        let (alice, bob) = pair();
        let mut bytes = alice.seal(block(&alice, true, false)).unwrap();
        patch_ttl(&mut bytes, 3).unwrap();
        assert_eq!(bob.open(&bytes).unwrap().header.ttl, 3);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (alice, bob) = pair();
        let mut bytes = alice.seal(block(&alice, true, false)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = bob.open(&bytes).unwrap_err();
        assert!(matches!(err.error, DatexError::Security(_)));
        assert_eq!(err.header.unwrap().sid, SessionId::new(7));
    }

    #[test]
    fn test_unknown_signer_rejected() {
        let (alice, _) = pair();
        let carol = BlockSecurity::new(Endpoint::person("carol"), Arc::new(KeyStore::new(Identity::generate())));
        let bytes = alice.seal(block(&alice, true, false)).unwrap();
        assert!(carol.open(&bytes).is_err());
    }

    #[test]
    fn test_encrypted_block() {
        let (alice, bob) = pair();
        let mut b = block(&alice, true, true);
        alice.attach_keys(&mut b.header.receivers).unwrap();
        let bytes = alice.seal(b).unwrap();
        assert!(!bytes.ends_with(&[0xc1, 42]));

        let opened = bob.open(&bytes).unwrap();
        assert_eq!(opened.body, vec![0xc1, 42]);
        // the session key is remembered for later blocks without blobs
        assert!(bob.keys().session_key_of(alice.endpoint()).is_some());
    }

    #[test]
    fn test_encrypted_without_key_fails() {
        let (alice, bob) = pair();
        let bytes = alice.seal(block(&alice, false, true)).unwrap();
        assert!(matches!(bob.open(&bytes).unwrap_err().error, DatexError::Security(_)));
    }

    #[test]
    fn test_attach_keys_needs_receivers() {
        let (alice, _) = pair();
        assert!(alice.attach_keys(&mut Receivers::Flood).is_err());
    }
}
