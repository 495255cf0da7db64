use std::net::SocketAddr;

use rand_core::{OsRng, RngCore};

use crate::crypto::mac::{hmac_sha256, verify_hmac_sha256, MAC_LEN};
use crate::crypto::CryptoError;

pub const COOKIE_LEN: usize = MAC_LEN;

/// Stateless cookie issuer: HMAC-SHA256 over the peer's address and port.
///
/// The secret lives as long as the listener; nothing per-peer is stored, so an
/// unauthenticated peer cannot make the listener allocate anything.
pub struct CookieJar {
    secret: [u8; 32],
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieJar { .. }")
    }
}

impl CookieJar {
    /// Generates a fresh per-process secret.
    pub fn new() -> Result<Self, CryptoError> {
        let mut secret = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| CryptoError::Entropy(format!("cookie secret: {e}")))?;
        Ok(Self { secret })
    }

    pub fn with_secret(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    pub fn issue(&self, peer: &SocketAddr) -> Result<[u8; COOKIE_LEN], CryptoError> {
        let (ip, port) = peer_bytes(peer);
        hmac_sha256(&self.secret, &[&ip, &port])
    }

    pub fn verify(&self, peer: &SocketAddr, cookie: &[u8]) -> bool {
        let (ip, port) = peer_bytes(peer);
        verify_hmac_sha256(&self.secret, &[&ip, &port], cookie)
    }
}

fn peer_bytes(peer: &SocketAddr) -> (Vec<u8>, [u8; 2]) {
    let ip = match peer {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    (ip, peer.port().to_be_bytes())
}
