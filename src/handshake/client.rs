//! Node side of the handshake.
//!
//! Used by node firmware simulators and by the integration tests; the server
//! never calls into this module.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use rand::{rngs::OsRng, RngCore};
use serde_bytes::ByteBuf;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::transport::{unspecified_for, CborUdpTransport, Inbound};
use super::{
    await_finished, finished_mac, transcript_hash, verify_finished, CipherSuite, ClientHello,
    HandshakeError, HandshakeMessage, ServerHello, ServerHelloBody, CLIENT_FINISHED_LABEL,
    HANDSHAKE_VERSION, PUBLIC_KEY_LEN, RANDOM_LEN, SERVER_FINISHED_LABEL,
};
use crate::crypto::identity::verify_signature;
use crate::crypto::{CryptoError, SessionKeys};
use crate::session::{ContentType, Role, SecureSession};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Offered in order of preference; the server decides.
    pub suites: Vec<CipherSuite>,
    /// Wait per hello attempt, and for the server's Finished.
    pub timeout: Duration,
    pub retries: u32,
    /// Pinned server signing key. Without one any signed hello is accepted.
    pub server_key: Option<VerifyingKey>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            suites: CipherSuite::ALL.to_vec(),
            timeout: Duration::from_secs(2),
            retries: 3,
            server_key: None,
        }
    }
}

impl ClientOptions {
    pub fn with_server_key(mut self, key: VerifyingKey) -> Self {
        self.server_key = Some(key);
        self
    }

    pub fn with_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.suites = suites;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Opens a secure session to the listener at `server`.
///
/// Handles the cookie round trip, then connects to the per-client address the
/// server hello arrives from.
pub fn connect(server: SocketAddr, options: &ClientOptions) -> Result<SecureSession, HandshakeError> {
    if options.suites.is_empty() {
        return Err(HandshakeError::NoCommonSuite);
    }
    let socket = UdpSocket::bind(unspecified_for(&server))?;
    let transport = CborUdpTransport::new(&socket);

    let mut client_random = vec![0u8; RANDOM_LEN];
    OsRng
        .try_fill_bytes(&mut client_random)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let mut hello = ClientHello {
        version: HANDSHAKE_VERSION,
        random: client_random.clone(),
        cookie: None,
        public_key: public.as_bytes().to_vec(),
        suites: options.suites.clone(),
    };

    let mut attempts = 0u32;
    let (server_hello, hello_raw, session_peer) = loop {
        let hello_raw = transport.send_to(&HandshakeMessage::ClientHello(hello.clone()), server)?;
        let deadline = Instant::now() + options.timeout;
        match wait_for_reply(&transport, deadline) {
            Ok(Inbound {
                message: HandshakeMessage::HelloVerifyRequest(verify),
                peer,
                ..
            }) if peer == server => {
                if hello.cookie.is_some() {
                    tracing::debug!(%server, "cookie re-issued");
                }
                hello.cookie = Some(ByteBuf::from(verify.cookie));
            }
            Ok(Inbound {
                message: HandshakeMessage::ServerHello(server_hello),
                peer,
                ..
            }) if hello.cookie.is_some() => break (server_hello, hello_raw, peer),
            Ok(other) => {
                tracing::debug!(peer = %other.peer, "ignoring unexpected handshake datagram");
            }
            Err(HandshakeError::Timeout(_)) => {
                attempts += 1;
                if attempts > options.retries {
                    return Err(HandshakeError::Timeout("server hello"));
                }
                tracing::debug!(%server, attempt = attempts, "retransmitting client hello");
            }
            Err(err) => return Err(err),
        }
    };

    let (suite, server_random, server_share, transcript) =
        check_server_hello(&server_hello, &hello_raw, options)?;

    let shared = secret.diffie_hellman(&server_share);
    if !shared.was_contributory() {
        return Err(HandshakeError::Authentication(
            "server key share is not contributory".into(),
        ));
    }
    let keys = SessionKeys::derive(shared.as_bytes(), &client_random, &server_random, suite.name())?;

    socket.connect(session_peer)?;
    let session = SecureSession::establish(socket, session_peer, suite, Role::Client, &keys)?;
    let ours = finished_mac(&keys.client.finished, CLIENT_FINISHED_LABEL, &transcript)?;
    session.send_record(ContentType::Handshake, &ours)?;

    let finished = await_finished(&session, Instant::now() + options.timeout, "server finished")?;
    if !verify_finished(&keys.server.finished, SERVER_FINISHED_LABEL, &transcript, &finished) {
        return Err(HandshakeError::Authentication("server finished mismatch".into()));
    }
    session.set_read_timeout(None)?;
    tracing::debug!(%server, peer = %session_peer, suite = suite.name(), "session established");
    Ok(session)
}

fn wait_for_reply(transport: &CborUdpTransport<'_>, deadline: Instant) -> Result<Inbound, HandshakeError> {
    transport.recv_until(deadline, "handshake reply")
}

fn check_server_hello(
    hello: &ServerHello,
    client_hello_raw: &[u8],
    options: &ClientOptions,
) -> Result<(CipherSuite, Vec<u8>, PublicKey, [u8; 32]), HandshakeError> {
    let body: ServerHelloBody = serde_cbor::from_slice(&hello.body)
        .map_err(|e| HandshakeError::Protocol(format!("decode server hello: {}", e)))?;
    if body.version != HANDSHAKE_VERSION {
        return Err(HandshakeError::Protocol(format!(
            "unsupported handshake version {}",
            body.version
        )));
    }
    if !options.suites.contains(&body.suite) {
        return Err(HandshakeError::Protocol(format!(
            "server chose unoffered suite {}",
            body.suite.name()
        )));
    }
    if body.random.len() != RANDOM_LEN || body.public_key.len() != PUBLIC_KEY_LEN {
        return Err(HandshakeError::Protocol("server hello field has wrong length".into()));
    }

    let transcript = transcript_hash(client_hello_raw, &hello.body);
    match &options.server_key {
        Some(key) => {
            if !verify_signature(key, &transcript, &hello.signature) {
                return Err(HandshakeError::Authentication(
                    "server hello signature invalid".into(),
                ));
            }
        }
        None => tracing::warn!("no pinned server key; accepting unverified server hello"),
    }

    let mut share = [0u8; PUBLIC_KEY_LEN];
    share.copy_from_slice(&body.public_key);
    Ok((body.suite, body.random, PublicKey::from(share), transcript))
}
