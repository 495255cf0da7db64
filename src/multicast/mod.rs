//! Group synchronization: rotating key material and encrypted broadcasts.
//!
//! A broadcast is a [`MulticastHeader`] followed by `sequence:u64` and the
//! AEAD ciphertext of a CBOR [`SyncOutput`]. The IV for each message is the
//! key's IV with the sequence folded into its trailing bytes.

pub mod keystore;
pub mod syncer;

pub use keystore::{KeyRecord, KeyStore};
pub use syncer::{RekeyCallback, Syncer, SyncerError, WorkItem};

use crate::crypto::{derive_message_iv, AeadContext, CryptoError, IV_LEN};
use crate::messages::{self, multicast::SyncOutput};
use crate::wire::{decode_multicast, MulticastHeader, WireError};

/// Node-side decoding of a sync broadcast sealed under `key` / `iv`.
pub fn open_sync_broadcast(
    datagram: &[u8],
    key: &[u8],
    iv: &[u8; IV_LEN],
) -> Result<(MulticastHeader, SyncOutput), SyncerError> {
    let (header, body) = decode_multicast(datagram)?;
    if body.len() < 8 {
        return Err(WireError::Truncated {
            needed: 8,
            actual: body.len(),
        }
        .into());
    }
    let (sequence, ciphertext) = body.split_at(8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(sequence);
    let message_iv = derive_message_iv(iv, u64::from_be_bytes(raw));

    let mut aead = AeadContext::new();
    aead.load_key(key)?;
    let plaintext = aead.decrypt(ciphertext, &message_iv)?;
    let output = messages::decode(&plaintext)?;
    Ok((header, output))
}
