use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{rngs::OsRng, RngCore};
use serde_bytes::ByteBuf;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::transport::{bind_datagram, CborUdpTransport};
use super::{
    await_finished, finished_mac, negotiate, transcript_hash, verify_finished, CipherSuite,
    ClientHello, HandshakeError, HandshakeMessage, ServerHello, ServerHelloBody,
    CLIENT_FINISHED_LABEL, HANDSHAKE_VERSION, PUBLIC_KEY_LEN, RANDOM_LEN, SERVER_FINISHED_LABEL,
};
use crate::crypto::{CryptoError, ServerIdentity, SessionKeys};
use crate::session::{ContentType, Role, SecureSession};

/// Server half of the handshake, run once a client hello carried a valid cookie.
///
/// # Guarantees
/// - The returned session has verified the node's Finished record.
/// - No per-client socket outlives a failed handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    identity: Arc<ServerIdentity>,
    suites: Vec<CipherSuite>,
    timeout: Duration,
}

impl ServerHandshake {
    pub fn new(identity: Arc<ServerIdentity>, suites: Vec<CipherSuite>, timeout: Duration) -> Self {
        Self {
            identity,
            suites,
            timeout,
        }
    }

    pub fn suites(&self) -> &[CipherSuite] {
        &self.suites
    }

    /// Binds a per-client socket on `local_ip`, answers with a signed server
    /// hello and waits for the node's Finished.
    ///
    /// `client_hello_raw` must be the exact datagram `hello` was decoded from.
    pub fn accept(
        &self,
        local_ip: IpAddr,
        peer: SocketAddr,
        hello: &ClientHello,
        client_hello_raw: &[u8],
    ) -> Result<SecureSession, HandshakeError> {
        hello.validate()?;
        let suite = negotiate(&self.suites, &hello.suites).ok_or(HandshakeError::NoCommonSuite)?;
        let deadline = Instant::now() + self.timeout;

        let mut client_share = [0u8; PUBLIC_KEY_LEN];
        client_share.copy_from_slice(&hello.public_key);
        let client_share = PublicKey::from(client_share);

        let socket = bind_datagram(SocketAddr::new(local_ip, 0))?;
        socket.connect(peer)?;

        let mut server_random = vec![0u8; RANDOM_LEN];
        OsRng
            .try_fill_bytes(&mut server_random)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let body = ServerHelloBody {
            version: HANDSHAKE_VERSION,
            random: server_random.clone(),
            public_key: public.as_bytes().to_vec(),
            suite,
            certificates: self
                .identity
                .certificates()
                .iter()
                .cloned()
                .map(ByteBuf::from)
                .collect(),
        };
        let body_raw = serde_cbor::to_vec(&body)
            .map_err(|e| HandshakeError::Protocol(format!("encode server hello: {}", e)))?;
        let transcript = transcript_hash(client_hello_raw, &body_raw);
        let signature = self.identity.sign(&transcript);

        CborUdpTransport::new(&socket).send(&HandshakeMessage::ServerHello(ServerHello {
            body: body_raw,
            signature: signature.to_vec(),
        }))?;

        let shared = secret.diffie_hellman(&client_share);
        if !shared.was_contributory() {
            return Err(HandshakeError::Authentication(
                "client key share is not contributory".into(),
            ));
        }
        let keys = SessionKeys::derive(shared.as_bytes(), &hello.random, &server_random, suite.name())?;
        let session = SecureSession::establish(socket, peer, suite, Role::Server, &keys)?;

        let finished = await_finished(&session, deadline, "client finished")?;
        if !verify_finished(&keys.client.finished, CLIENT_FINISHED_LABEL, &transcript, &finished) {
            return Err(HandshakeError::Authentication("client finished mismatch".into()));
        }
        let ours = finished_mac(&keys.server.finished, SERVER_FINISHED_LABEL, &transcript)?;
        session.send_record(ContentType::Handshake, &ours)?;

        tracing::debug!(peer = %peer, suite = suite.name(), "handshake complete");
        Ok(session)
    }
}
