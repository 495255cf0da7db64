//! Established secure sessions.
//!
//! A [`SecureSession`] wraps a connected UDP socket and the record keys agreed
//! by the handshake. Both peers use the same type; [`Role`] picks which key
//! direction seals and which opens.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::crypto::{CryptoError, SessionKeys};
use crate::handshake::transport::is_timeout;
use crate::handshake::CipherSuite;

pub mod record;
pub mod replay;

pub use record::{ContentType, RecordProtection, RECORD_HEADER_LEN};
pub use replay::ReplayWindow;

/// Largest plaintext that still fits one UDP datagram once sealed.
pub const MAX_RECORD_PLAINTEXT: usize = 65_507 - RECORD_HEADER_LEN - 16;

const CLOSE_NOTIFY: u8 = 0;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("session closed")]
    Closed,
    #[error("peer closed the session")]
    PeerClosed,
    #[error("record of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Anything that can carry one framed message to the peer.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, payload: &[u8]) -> Result<(), SessionError>;
}

struct Inbound {
    protection: RecordProtection,
    window: ReplayWindow,
}

pub struct SecureSession {
    socket: UdpSocket,
    peer: SocketAddr,
    suite: CipherSuite,
    seal: RecordProtection,
    open: Mutex<Inbound>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("peer", &self.peer)
            .field("suite", &self.suite)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SecureSession {
    /// Wraps `socket`, which must already be connected to `peer`.
    pub fn establish(
        socket: UdpSocket,
        peer: SocketAddr,
        suite: CipherSuite,
        role: Role,
        keys: &SessionKeys,
    ) -> Result<Self, SessionError> {
        let (ours, theirs) = match role {
            Role::Client => (&keys.client, &keys.server),
            Role::Server => (&keys.server, &keys.client),
        };
        Ok(Self {
            socket,
            peer,
            suite,
            seal: RecordProtection::new(suite, ours)?,
            open: Mutex::new(Inbound {
                protection: RecordProtection::new(suite, theirs)?,
                window: ReplayWindow::new(),
            }),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Sends one application-data record.
    pub fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send_record(ContentType::ApplicationData, payload)
    }

    pub fn send_record(&self, content: ContentType, payload: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if payload.len() > MAX_RECORD_PLAINTEXT {
            return Err(SessionError::TooLarge(payload.len()));
        }
        let sequence = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let record = self.seal.seal(content, sequence, payload)?;
        self.socket.send(&record)?;
        Ok(())
    }

    /// Receives one authenticated record.
    ///
    /// `Ok(None)` means nothing deliverable arrived before the read timeout:
    /// either the socket timed out or the datagram failed authentication or
    /// replay checks and was dropped.
    pub fn recv_record(&self) -> Result<Option<(ContentType, Vec<u8>)>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut buf = vec![0u8; 65_535];
        let len = match self.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(err) if is_timeout(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut inbound = self.open.lock();
        let (content, sequence, plaintext) = match inbound.protection.open(&buf[..len]) {
            Ok(opened) => opened,
            Err(_) => {
                tracing::debug!(peer = %self.peer, len, "dropping record that failed authentication");
                return Ok(None);
            }
        };
        if !inbound.window.is_fresh(sequence) {
            tracing::debug!(peer = %self.peer, sequence, "dropping replayed record");
            return Ok(None);
        }
        inbound.window.mark(sequence);
        Ok(Some((content, plaintext)))
    }

    /// Receives one application-data payload.
    ///
    /// A close-notify from the peer surfaces as [`SessionError::PeerClosed`].
    /// Stray handshake records are ignored.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, SessionError> {
        match self.recv_record()? {
            Some((ContentType::ApplicationData, payload)) => Ok(Some(payload)),
            Some((ContentType::Alert, _)) => Err(SessionError::PeerClosed),
            Some((ContentType::Handshake, _)) => {
                tracing::trace!(peer = %self.peer, "ignoring handshake record on established session");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Sends close-notify once. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let notify = self.send_record(ContentType::Alert, &[CLOSE_NOTIFY]);
        self.closed.store(true, Ordering::Release);
        if let Err(err) = notify {
            tracing::debug!(peer = %self.peer, error = %err, "close notify not delivered");
        }
    }
}

impl DatagramSink for SecureSession {
    fn send_datagram(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send(payload)
    }
}
