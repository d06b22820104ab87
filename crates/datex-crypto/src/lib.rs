//! DATEX Crypto - Signing, encryption and key exchange for blocks
//!
//! Provides the security services consumed by the block codec:
//! - Endpoint identities (Ed25519 signing, X25519 key exchange)
//! - Body encryption (ChaCha20-Poly1305)
//! - Per-recipient session key blobs
//! - Sealing and opening complete blocks

pub mod aead;
pub mod identity;
pub mod keys;
pub mod secure_block;

pub use aead::*;
pub use identity::*;
pub use keys::*;
pub use secure_block::*;
