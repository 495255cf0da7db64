//! AEAD wrapper used for multicast broadcasts.
//!
//! XChaCha20-Poly1305 with a 256-bit key. Callers supply a 128-bit IV which
//! fills the leading bytes of the 192-bit nonce; the remaining bytes are zero.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};

use super::CryptoError;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const NONCE_LEN: usize = 24;

/// Cipher context holding at most one key at a time.
#[derive(Default)]
pub struct AeadContext {
    cipher: Option<XChaCha20Poly1305>,
}

impl std::fmt::Debug for AeadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadContext")
            .field("loaded", &self.cipher.is_some())
            .finish()
    }
}

impl AeadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current cipher state with one keyed by `key`.
    pub fn load_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        self.cipher = None;
        let cipher = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seals `plaintext`, returning ciphertext with the tag appended.
    pub fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NoKey)?;
        let nonce = expand_iv(iv)?;
        cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)
    }

    /// Opens `ciphertext`. Any tampering yields `CryptoError::Open` and no output.
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NoKey)?;
        let nonce = expand_iv(iv)?;
        cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}

fn expand_iv(iv: &[u8]) -> Result<[u8; NONCE_LEN], CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..IV_LEN].copy_from_slice(iv);
    Ok(nonce)
}

/// Per-message IV: `sequence` XORed into the last 8 bytes of the key's IV.
pub fn derive_message_iv(base: &[u8; IV_LEN], sequence: u64) -> [u8; IV_LEN] {
    let mut iv = *base;
    for (slot, byte) in iv[IV_LEN - 8..].iter_mut().zip(sequence.to_be_bytes()) {
        *slot ^= byte;
    }
    iv
}
