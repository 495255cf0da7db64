//! Cryptographic building blocks: the multicast AEAD wrapper, HMAC helpers,
//! session key derivation and the server's signing identity.

use thiserror::Error;

pub mod aead;
pub mod identity;
pub mod kdf;
pub mod mac;

pub use aead::{derive_message_iv, AeadContext, IV_LEN, KEY_LEN, TAG_LEN};
pub use identity::ServerIdentity;
pub use kdf::SessionKeys;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no key loaded")]
    NoKey,
    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),
    #[error("invalid iv length {0}")]
    InvalidIvLength(usize),
    #[error("refusing to seal an empty plaintext")]
    EmptyPlaintext,
    #[error("seal failed")]
    Seal,
    #[error("authentication failed")]
    Open,
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("identity: {0}")]
    Identity(String),
    #[error("entropy source: {0}")]
    Entropy(String),
}
