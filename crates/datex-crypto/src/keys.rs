//! Key store: known endpoint identities and session keys
//!
//! Each endpoint encrypts its outbound bodies with one symmetric session
//! key. The key travels inside the receiver section as an 80-byte blob per
//! recipient: an ephemeral X25519 public key followed by the session key
//! sealed under a key derived from the ephemeral/recipient agreement.

use std::collections::HashMap;

use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use datex_core::{DatexError, DatexResult, Endpoint};
use datex_wire::{KeyBlob, KEY_BLOB_SIZE};

use crate::{AeadCipher, Identity, PublicIdentity, KEY_SIZE, NONCE_SIZE};

const KEY_WRAP_INFO: &[u8] = b"DATEX_KEY_WRAP_v1";

fn wrap_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> DatexResult<[u8; KEY_SIZE]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(KEY_WRAP_INFO, &mut key)
        .map_err(|_| DatexError::Security("key derivation failed".into()))?;
    Ok(key)
}

/// Shared key material of the local endpoint
pub struct KeyStore {
    identity: Identity,
    local_session_key: [u8; KEY_SIZE],
    /// Announced public identities by main endpoint
    identities: RwLock<HashMap<Endpoint, PublicIdentity>>,
    /// Session keys received from senders
    session_keys: RwLock<HashMap<Endpoint, [u8; KEY_SIZE]>>,
}

impl KeyStore {
    pub fn new(identity: Identity) -> Self {
        let mut local_session_key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut local_session_key);
        KeyStore {
            identity,
            local_session_key,
            identities: RwLock::new(HashMap::new()),
            session_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_session_key(&self) -> &[u8; KEY_SIZE] {
        &self.local_session_key
    }

    /// Remember the announced keys of an endpoint
    pub fn register_identity(&self, endpoint: &Endpoint, public: PublicIdentity) {
        self.identities.write().insert(endpoint.main(), public);
    }

    pub fn identity_of(&self, endpoint: &Endpoint) -> Option<PublicIdentity> {
        self.identities.read().get(&endpoint.main()).cloned()
    }

    pub fn session_key_of(&self, sender: &Endpoint) -> Option<[u8; KEY_SIZE]> {
        self.session_keys.read().get(&sender.main()).copied()
    }

    /// Seal the local session key for one recipient
    pub fn wrap_for(&self, recipient: &Endpoint) -> DatexResult<KeyBlob> {
        let public = self.identity_of(recipient).ok_or_else(|| {
            DatexError::Security(format!("no exchange key known for {}", recipient))
        })?;
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(public.exchange_key()).to_bytes();
        let key = wrap_key(&shared, &ephemeral_public, public.exchange_key())?;

        let sealed = AeadCipher::new(&key).encrypt(&[0u8; NONCE_SIZE], &[], &self.local_session_key)?;
        let mut blob = [0u8; KEY_BLOB_SIZE];
        blob[..32].copy_from_slice(ephemeral_public.as_bytes());
        blob[32..].copy_from_slice(&sealed);
        Ok(blob)
    }

    /// Open a blob addressed to us and register the sender's session key
    pub fn unwrap_from(&self, sender: &Endpoint, blob: &KeyBlob) -> DatexResult<()> {
        let mut eph = [0u8; 32];
        eph.copy_from_slice(&blob[..32]);
        let ephemeral_public = PublicKey::from(eph);
        let own_public = self.identity.public();
        let shared = self.identity.agree(&ephemeral_public);
        let key = wrap_key(&shared, &ephemeral_public, own_public.exchange_key())?;

        let opened = AeadCipher::new(&key).decrypt(&[0u8; NONCE_SIZE], &[], &blob[32..])?;
        let mut session_key = [0u8; KEY_SIZE];
        if opened.len() != KEY_SIZE {
            return Err(DatexError::Security("invalid session key length".into()));
        }
        session_key.copy_from_slice(&opened);
        self.session_keys.write().insert(sender.main(), session_key);
        tracing::debug!(sender = %sender, "registered session key");
        Ok(())
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("identities", &self.identities.read().len())
            .field("session_keys", &self.session_keys.read().len())
            .finish_non_exhaustive()
    }
}
