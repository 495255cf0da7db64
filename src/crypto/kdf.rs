//! HKDF-SHA256 expansion of the handshake's shared secret into per-direction
//! record keys.

use hkdf::Hkdf;
use sha2::Sha256;

use super::CryptoError;

pub const RECORD_KEY_LEN: usize = 32;
/// Large enough for the widest supported record nonce.
pub const RECORD_IV_LEN: usize = 24;
pub const FINISHED_KEY_LEN: usize = 32;

/// Key material for one direction of a session.
#[derive(Clone)]
pub struct DirectionKeys {
    pub key: [u8; RECORD_KEY_LEN],
    pub iv: [u8; RECORD_IV_LEN],
    pub finished: [u8; FINISHED_KEY_LEN],
}

/// Both directions of a session, as seen from either side.
#[derive(Clone)]
pub struct SessionKeys {
    pub client: DirectionKeys,
    pub server: DirectionKeys,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

impl SessionKeys {
    /// Derives session keys; `suite` binds the output to the negotiated cipher.
    pub fn derive(
        shared_secret: &[u8],
        client_random: &[u8],
        server_random: &[u8],
        suite: &str,
    ) -> Result<Self, CryptoError> {
        let mut salt = Vec::with_capacity(client_random.len() + server_random.len());
        salt.extend_from_slice(client_random);
        salt.extend_from_slice(server_random);
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
        Ok(Self {
            client: expand(&hk, "client", suite)?,
            server: expand(&hk, "server", suite)?,
        })
    }
}

fn expand(hk: &Hkdf<Sha256>, role: &str, suite: &str) -> Result<DirectionKeys, CryptoError> {
    let mut keys = DirectionKeys {
        key: [0u8; RECORD_KEY_LEN],
        iv: [0u8; RECORD_IV_LEN],
        finished: [0u8; FINISHED_KEY_LEN],
    };
    for (label, out) in [
        ("key", &mut keys.key[..]),
        ("iv", &mut keys.iv[..]),
        ("finished", &mut keys.finished[..]),
    ] {
        let info = format!("pixelnet {role} {label} {suite}");
        hk.expand(info.as_bytes(), out)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_and_directions_differ() {
        let a = SessionKeys::derive(&[7u8; 32], &[1u8; 32], &[2u8; 32], "suite").unwrap();
        let b = SessionKeys::derive(&[7u8; 32], &[1u8; 32], &[2u8; 32], "suite").unwrap();
        assert_eq!(a.client.key, b.client.key);
        assert_eq!(a.server.iv, b.server.iv);
        assert_ne!(a.client.key, a.server.key);
        assert_ne!(a.client.finished, a.server.finished);
    }

    #[test]
    fn suite_and_randoms_change_the_output() {
        let base = SessionKeys::derive(&[7u8; 32], &[1u8; 32], &[2u8; 32], "a").unwrap();
        let other_suite = SessionKeys::derive(&[7u8; 32], &[1u8; 32], &[2u8; 32], "b").unwrap();
        let other_random = SessionKeys::derive(&[7u8; 32], &[3u8; 32], &[2u8; 32], "a").unwrap();
        assert_ne!(base.client.key, other_suite.client.key);
        assert_ne!(base.client.key, other_random.client.key);
    }
}
