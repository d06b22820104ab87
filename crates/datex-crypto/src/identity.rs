//! Endpoint identities using Ed25519 (signing) and X25519 (key exchange)

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use datex_core::{DatexError, DatexResult};

/// Size of a serialized public identity
pub const PUBLIC_IDENTITY_SIZE: usize = 64;

/// Secret keys of the local endpoint
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Identity {
            signing_key: SigningKey::generate(&mut OsRng),
            exchange_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore from secret key bytes
    pub fn from_bytes(signing: &[u8; 32], exchange: [u8; 32]) -> Self {
        Identity {
            signing_key: SigningKey::from_bytes(signing),
            exchange_secret: StaticSecret::from(exchange),
        }
    }

    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            verifying_key: self.signing_key.verifying_key(),
            exchange_key: PublicKey::from(&self.exchange_secret),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Diffie-Hellman with a peer's exchange key
    pub fn agree(&self, peer: &PublicKey) -> [u8; 32] {
        self.exchange_secret.diffie_hellman(peer).to_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Public keys of an endpoint, announced in HELLO blocks
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
    exchange_key: PublicKey,
}

impl PublicIdentity {
    /// Parse `verifying key (32) || exchange key (32)`
    pub fn from_bytes(bytes: &[u8]) -> DatexResult<Self> {
        if bytes.len() != PUBLIC_IDENTITY_SIZE {
            return Err(DatexError::Security(format!(
                "public identity must be {} bytes, got {}",
                PUBLIC_IDENTITY_SIZE,
                bytes.len()
            )));
        }
        let mut verify = [0u8; 32];
        verify.copy_from_slice(&bytes[..32]);
        let mut exchange = [0u8; 32];
        exchange.copy_from_slice(&bytes[32..]);
        let verifying_key = VerifyingKey::from_bytes(&verify)
            .map_err(|_| DatexError::Security("invalid verifying key".into()))?;
        Ok(PublicIdentity {
            verifying_key,
            exchange_key: PublicKey::from(exchange),
        })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_IDENTITY_SIZE] {
        let mut out = [0u8; PUBLIC_IDENTITY_SIZE];
        out[..32].copy_from_slice(self.verifying_key.as_bytes());
        out[32..].copy_from_slice(self.exchange_key.as_bytes());
        out
    }

    pub fn exchange_key(&self) -> &PublicKey {
        &self.exchange_key
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.verifying_key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.verifying_key.as_bytes();
        write!(f, "PublicIdentity({:02x}{:02x}{:02x}{:02x}..)", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}
