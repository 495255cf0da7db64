#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use pixelnet::handlers::auth::{HmacSha256Challenge, METHOD_HMAC_SHA256};
use pixelnet::messages::auth::{AuthChallenge, AuthRequest, AuthResponse, AuthResult, REQUEST, RESPONSE};
use pixelnet::messages::{self, Status};
use pixelnet::wire::{decode_message, encode_message};
use pixelnet::{
    connect, App, ClientOptions, Endpoint, Header, MemoryDirectory, MemoryFramebuffer,
    MulticastConfig, Node, NodeChannel, PixelFormat, SecureSession, ServerConfig, Syncer,
};

pub const SECRET: &[u8] = b"fixture-node-shared-secret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running server on loopback whose sync broadcasts land on `broadcasts`.
pub struct Harness {
    pub app: App,
    pub directory: Arc<MemoryDirectory>,
    pub framebuffer: Arc<MemoryFramebuffer>,
    pub node: Node,
    pub broadcasts: UdpSocket,
}

impl Harness {
    pub fn start() -> Self {
        init_tracing();
        let broadcasts = UdpSocket::bind("127.0.0.1:0").unwrap();
        broadcasts
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let multicast = MulticastConfig::default().rekey_interval(Duration::from_secs(3600));
        let syncer =
            Arc::new(Syncer::start_with_target(&multicast, broadcasts.local_addr().unwrap()).unwrap());

        let directory = Arc::new(MemoryDirectory::new());
        let node = Node {
            id: 12,
            uuid: Uuid::new_v4(),
            secret: SECRET.to_vec(),
            label: "stage-left".into(),
        };
        directory.insert_node(node.clone());
        directory.insert_channel(NodeChannel {
            node_id: node.id,
            index: 0,
            pixel_count: 50,
            fb_offset: 0,
            format: PixelFormat::Rgb,
        });
        directory.insert_channel(NodeChannel {
            node_id: node.id,
            index: 1,
            pixel_count: 200,
            fb_offset: 100,
            format: PixelFormat::Rgb,
        });
        let framebuffer = Arc::new(MemoryFramebuffer::new(512));

        let config = ServerConfig::default()
            .listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .client_read_timeout(Duration::from_millis(100))
            .accept_timeout(Duration::from_millis(50))
            .handshake_timeout(Duration::from_secs(1))
            .gc_interval(Duration::from_millis(50));
        let app = App::start_with_syncer(&config, syncer, directory.clone(), framebuffer.clone()).unwrap();
        Self {
            app,
            directory,
            framebuffer,
            node,
            broadcasts,
        }
    }

    /// Opens a session that pins the server's key.
    pub fn connect(&self) -> SecureSession {
        let options = ClientOptions::default().with_server_key(self.app.verifying_key());
        let session = connect(self.app.local_addr(), &options).unwrap();
        session
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        session
    }

    pub fn wait_for(&self, what: &str, mut condition: impl FnMut(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

pub fn send<T: Serialize>(session: &SecureSession, endpoint: Endpoint, message_type: u8, tag: u8, body: &T) {
    let payload = messages::encode(body).unwrap();
    let datagram = encode_message(Header::new(endpoint, message_type, tag), &payload).unwrap();
    session.send(&datagram).unwrap();
}

/// Reads until a message of `message_type` on `endpoint` arrives, skipping others.
pub fn expect<R: DeserializeOwned>(session: &SecureSession, endpoint: Endpoint, message_type: u8) -> (Header, R) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        let Some(datagram) = session.recv().unwrap() else {
            continue;
        };
        let (header, payload) = decode_message(&datagram).unwrap();
        if header.endpoint == endpoint as u8 && header.message_type == message_type {
            return (header, messages::decode(payload).unwrap());
        }
    }
    panic!("no {message_type:#04x} on {endpoint:?}");
}

pub fn request<T: Serialize, R: DeserializeOwned>(
    session: &SecureSession,
    endpoint: Endpoint,
    message_type: u8,
    reply_type: u8,
    body: &T,
) -> R {
    send(session, endpoint, message_type, 0x40, body);
    let (header, reply) = expect(session, endpoint, reply_type);
    assert_eq!(header.tag, 0x40);
    reply
}

/// Runs the challenge exchange with `secret` and returns the final status.
pub fn authenticate(session: &SecureSession, node_id: Uuid, secret: &[u8]) -> Status {
    let challenge: AuthChallenge = request(
        session,
        Endpoint::Authentication,
        REQUEST,
        pixelnet::messages::auth::CHALLENGE,
        &AuthRequest {
            node_id,
            methods: vec![METHOD_HMAC_SHA256.to_string()],
        },
    );
    assert_eq!(challenge.status, Status::Success);
    let proof = HmacSha256Challenge::compute_proof(secret, &challenge.nonce, &challenge.random).unwrap();
    let result: AuthResult = request(
        session,
        Endpoint::Authentication,
        RESPONSE,
        pixelnet::messages::auth::RESULT,
        &AuthResponse {
            proof: proof.to_vec(),
        },
    );
    result.status
}
