//! Protected record format.
//!
//! `content_type:u8 || sequence:u64 || ciphertext`. The 9-byte prefix is bound
//! as associated data, and the nonce is the direction IV with the sequence
//! XORed into its trailing 8 bytes.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce, XChaCha20Poly1305, XNonce};

use crate::crypto::kdf::{DirectionKeys, RECORD_IV_LEN};
use crate::crypto::CryptoError;
use crate::handshake::CipherSuite;

pub const RECORD_HEADER_LEN: usize = 9;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Alert = 0x15,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x15 => Some(ContentType::Alert),
            0x16 => Some(ContentType::Handshake),
            0x17 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

enum RecordCipher {
    ChaCha(ChaCha20Poly1305),
    XChaCha(XChaCha20Poly1305),
}

/// Seals or opens the records of one direction.
pub struct RecordProtection {
    cipher: RecordCipher,
    iv: [u8; RECORD_IV_LEN],
    nonce_len: usize,
}

impl RecordProtection {
    pub fn new(suite: CipherSuite, keys: &DirectionKeys) -> Result<Self, CryptoError> {
        let cipher = match suite {
            CipherSuite::ChaCha20Poly1305Sha256 => RecordCipher::ChaCha(
                ChaCha20Poly1305::new_from_slice(&keys.key)
                    .map_err(|_| CryptoError::InvalidKeyLength(keys.key.len()))?,
            ),
            CipherSuite::XChaCha20Poly1305Sha256 => RecordCipher::XChaCha(
                XChaCha20Poly1305::new_from_slice(&keys.key)
                    .map_err(|_| CryptoError::InvalidKeyLength(keys.key.len()))?,
            ),
        };
        Ok(Self {
            cipher,
            iv: keys.iv,
            nonce_len: suite.nonce_len(),
        })
    }

    fn nonce(&self, sequence: u64) -> [u8; RECORD_IV_LEN] {
        let mut nonce = self.iv;
        let tail = &mut nonce[self.nonce_len - 8..self.nonce_len];
        for (slot, byte) in tail.iter_mut().zip(sequence.to_be_bytes()) {
            *slot ^= byte;
        }
        nonce
    }

    /// Produces the complete record datagram.
    pub fn seal(&self, content: ContentType, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + plaintext.len() + 16);
        record.push(content as u8);
        record.extend_from_slice(&sequence.to_be_bytes());
        let nonce = self.nonce(sequence);
        let payload = Payload {
            msg: plaintext,
            aad: &record[..RECORD_HEADER_LEN],
        };
        let sealed = match &self.cipher {
            RecordCipher::ChaCha(c) => c.encrypt(Nonce::from_slice(&nonce[..12]), payload),
            RecordCipher::XChaCha(c) => c.encrypt(XNonce::from_slice(&nonce), payload),
        }
        .map_err(|_| CryptoError::Seal)?;
        record.extend_from_slice(&sealed);
        Ok(record)
    }

    /// Opens a record datagram, returning its type, sequence and plaintext.
    pub fn open(&self, record: &[u8]) -> Result<(ContentType, u64, Vec<u8>), CryptoError> {
        if record.len() < RECORD_HEADER_LEN {
            return Err(CryptoError::Open);
        }
        let content = ContentType::from_u8(record[0]).ok_or(CryptoError::Open)?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&record[1..RECORD_HEADER_LEN]);
        let sequence = u64::from_be_bytes(seq);
        let nonce = self.nonce(sequence);
        let payload = Payload {
            msg: &record[RECORD_HEADER_LEN..],
            aad: &record[..RECORD_HEADER_LEN],
        };
        let plaintext = match &self.cipher {
            RecordCipher::ChaCha(c) => c.decrypt(Nonce::from_slice(&nonce[..12]), payload),
            RecordCipher::XChaCha(c) => c.decrypt(XNonce::from_slice(&nonce), payload),
        }
        .map_err(|_| CryptoError::Open)?;
        Ok((content, sequence, plaintext))
    }
}
