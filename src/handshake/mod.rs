//! Datagram security handshake.
//!
//! ```text
//! Node                                   Listener socket
//!   │── ClientHello ───────────────────────▶│  no cookie: nothing allocated
//!   │◀───────────────── HelloVerifyRequest ─│  HMAC(secret, peer addr)
//!   │── ClientHello + cookie ──────────────▶│
//!   │                               per-client socket
//!   │◀──────────── ServerHello (signed) ────│  X25519 share, suite, certs
//!   │══ Finished (encrypted) ══════════════▶│
//!   │◀═════════════ Finished (encrypted) ═══│  session established
//! ```
//!
//! Handshake datagrams are CBOR encoded. Everything after the ServerHello is a
//! protected record (see [`crate::session::record`]).

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::session::SessionError;

pub mod client;
pub mod cookie;
pub mod server;
pub mod transport;

pub use client::{connect, ClientOptions};
pub use cookie::CookieJar;
pub use server::ServerHandshake;

pub const HANDSHAKE_VERSION: u8 = 1;
pub const RANDOM_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no common cipher suite")]
    NoCommonSuite,
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::Transport(err.to_string())
    }
}

impl From<SessionError> for HandshakeError {
    fn from(err: SessionError) -> Self {
        HandshakeError::Transport(err.to_string())
    }
}

/// Record protection negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    #[serde(rename = "CHACHA20-POLY1305-SHA256")]
    ChaCha20Poly1305Sha256,
    #[serde(rename = "XCHACHA20-POLY1305-SHA256")]
    XChaCha20Poly1305Sha256,
}

impl CipherSuite {
    pub const ALL: [CipherSuite; 2] = [
        CipherSuite::ChaCha20Poly1305Sha256,
        CipherSuite::XChaCha20Poly1305Sha256,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::ChaCha20Poly1305Sha256 => "CHACHA20-POLY1305-SHA256",
            CipherSuite::XChaCha20Poly1305Sha256 => "XCHACHA20-POLY1305-SHA256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|suite| suite.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            CipherSuite::ChaCha20Poly1305Sha256 => 12,
            CipherSuite::XChaCha20Poly1305Sha256 => 24,
        }
    }
}

/// First suite in the server's preference order that the node also offers.
pub fn negotiate(preference: &[CipherSuite], offered: &[CipherSuite]) -> Option<CipherSuite> {
    preference
        .iter()
        .copied()
        .find(|suite| offered.contains(suite))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub version: u8,
    #[serde(with = "serde_bytes")]
    pub random: Vec<u8>,
    pub cookie: Option<ByteBuf>,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub suites: Vec<CipherSuite>,
}

impl ClientHello {
    /// Structural checks that are cheap enough to run before the cookie.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.version != HANDSHAKE_VERSION {
            return Err(HandshakeError::Protocol(format!(
                "unsupported handshake version {}",
                self.version
            )));
        }
        if self.random.len() != RANDOM_LEN {
            return Err(HandshakeError::Protocol("client random has wrong length".into()));
        }
        if self.public_key.len() != PUBLIC_KEY_LEN {
            return Err(HandshakeError::Protocol("client key share has wrong length".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloVerifyRequest {
    #[serde(with = "serde_bytes")]
    pub cookie: Vec<u8>,
}

/// Signed part of the server hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHelloBody {
    pub version: u8,
    #[serde(with = "serde_bytes")]
    pub random: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub suite: CipherSuite,
    pub certificates: Vec<ByteBuf>,
}

/// `body` holds the CBOR bytes of a [`ServerHelloBody`] exactly as signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    HelloVerifyRequest(HelloVerifyRequest),
    ServerHello(ServerHello),
}

/// Hash binding the exact client hello datagram to the server hello body.
pub fn transcript_hash(client_hello: &[u8], server_hello_body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"pixelnet handshake v1");
    hasher.update((client_hello.len() as u32).to_be_bytes());
    hasher.update(client_hello);
    hasher.update((server_hello_body.len() as u32).to_be_bytes());
    hasher.update(server_hello_body);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub(crate) const CLIENT_FINISHED_LABEL: &[u8] = b"client finished";
pub(crate) const SERVER_FINISHED_LABEL: &[u8] = b"server finished";

/// Finished record payload proving possession of the direction's keys.
pub(crate) fn finished_mac(
    finished_key: &[u8],
    label: &[u8],
    transcript: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    crate::crypto::mac::hmac_sha256(finished_key, &[label, transcript])
}

pub(crate) fn verify_finished(
    finished_key: &[u8],
    label: &[u8],
    transcript: &[u8; 32],
    received: &[u8],
) -> bool {
    crate::crypto::mac::verify_hmac_sha256(finished_key, &[label, transcript], received)
}

/// Waits for the peer's Finished record on a freshly keyed session.
pub(crate) fn await_finished(
    session: &crate::session::SecureSession,
    deadline: std::time::Instant,
    what: &'static str,
) -> Result<Vec<u8>, HandshakeError> {
    use crate::session::ContentType;
    use std::time::{Duration, Instant};

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeError::Timeout(what));
        }
        session.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
        match session.recv_record()? {
            Some((ContentType::Handshake, payload)) => return Ok(payload),
            Some((ContentType::Alert, _)) => {
                return Err(HandshakeError::Protocol(format!("peer aborted before {}", what)))
            }
            Some((ContentType::ApplicationData, _)) => {
                return Err(HandshakeError::Protocol(format!(
                    "application data before {}",
                    what
                )))
            }
            None => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_is_bound_to_label_and_transcript() {
        let transcript = transcript_hash(b"hello", b"body");
        let mac = finished_mac(&[4u8; 32], CLIENT_FINISHED_LABEL, &transcript).unwrap();
        assert!(verify_finished(&[4u8; 32], CLIENT_FINISHED_LABEL, &transcript, &mac));
        assert!(!verify_finished(&[4u8; 32], SERVER_FINISHED_LABEL, &transcript, &mac));
        let other = transcript_hash(b"hello", b"other");
        assert!(!verify_finished(&[4u8; 32], CLIENT_FINISHED_LABEL, &other, &mac));
    }

    #[test]
    fn suite_names_parse_case_insensitively() {
        assert_eq!(
            CipherSuite::from_name("xchacha20-poly1305-sha256"),
            Some(CipherSuite::XChaCha20Poly1305Sha256)
        );
        assert_eq!(CipherSuite::from_name("AES128-SHA"), None);
    }

    #[test]
    fn negotiation_follows_server_preference() {
        let server = [
            CipherSuite::XChaCha20Poly1305Sha256,
            CipherSuite::ChaCha20Poly1305Sha256,
        ];
        let offered = [
            CipherSuite::ChaCha20Poly1305Sha256,
            CipherSuite::XChaCha20Poly1305Sha256,
        ];
        assert_eq!(
            negotiate(&server, &offered),
            Some(CipherSuite::XChaCha20Poly1305Sha256)
        );
        assert_eq!(
            negotiate(&[CipherSuite::ChaCha20Poly1305Sha256], &offered[1..]),
            None
        );
    }

    #[test]
    fn client_hello_validation_checks_lengths() {
        let mut hello = ClientHello {
            version: HANDSHAKE_VERSION,
            random: vec![0; RANDOM_LEN],
            cookie: None,
            public_key: vec![0; PUBLIC_KEY_LEN],
            suites: CipherSuite::ALL.to_vec(),
        };
        assert!(hello.validate().is_ok());
        hello.random.pop();
        assert!(hello.validate().is_err());
    }

    #[test]
    fn transcript_depends_on_both_halves() {
        let a = transcript_hash(b"hello", b"body");
        assert_ne!(a, transcript_hash(b"hellob", b"ody"));
        assert_ne!(a, transcript_hash(b"hello", b"bodY"));
    }
}
