//! pixelnet: node-facing control and data plane of an LED-lighting controller.
//!
//! Nodes open a secured datagram session with the [`server::Listener`],
//! authenticate with a shared-secret challenge, subscribe to framebuffer
//! regions and receive pixel data as frames complete. A [`multicast::Syncer`]
//! broadcasts encrypted frame-completion notices to the group under a key that
//! rotates on a timer; authenticated nodes fetch keys over their session.
//! All payloads are CBOR behind a fixed binary header.

pub mod app;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod framebuffer;
pub mod handlers;
pub mod handshake;
pub mod messages;
pub mod multicast;
pub mod observer;
pub mod pixel;
pub mod server;
pub mod session;
pub mod wire;

pub use app::{App, AppError};
pub use config::{ConfigError, MulticastConfig, ServerConfig};
pub use crypto::{AeadContext, CryptoError, ServerIdentity};
pub use directory::{MemoryDirectory, Node, NodeChannel, NodeDirectory};
pub use framebuffer::{Framebuffer, FramebufferError, MemoryFramebuffer};
pub use handshake::client::{connect, ClientOptions};
pub use handshake::{CipherSuite, HandshakeError};
pub use messages::Status;
pub use multicast::{Syncer, SyncerError};
pub use observer::ObserverToken;
pub use pixel::{Pixel, PixelFormat};
pub use server::{HandlerError, HandlerRegistry, Listener, ListenerError, MessageHandler};
pub use session::{SecureSession, SessionError};
pub use wire::{Endpoint, Header, MulticastHeader, WireError};
