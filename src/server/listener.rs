//! Secure datagram listener.
//!
//! One accept thread owns the listen socket. Peers must echo a stateless
//! cookie before the listener binds anything for them; the handshake itself
//! then runs on a per-client socket and its own short-lived thread, and once
//! it completes a [`ServerWorker`] takes the session over.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use thiserror::Error;

use super::registry::HandlerRegistry;
use super::state::ListenerState;
use super::worker::{ServerWorker, ShutdownCallback, ShutdownCause};
use crate::config::{ConfigError, ServerConfig};
use crate::crypto::{CryptoError, ServerIdentity};
use crate::handshake::transport::{bind_datagram, CborUdpTransport, Inbound};
use crate::handshake::{
    ClientHello, CookieJar, HandshakeError, HandshakeMessage, HelloVerifyRequest, ServerHandshake,
};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("crypto setup: {0}")]
    Crypto(#[from] CryptoError),
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

type FinishedList = Arc<Mutex<Vec<(u64, ShutdownCause)>>>;

struct ListenerShared {
    state: Mutex<ListenerState>,
    terminate: AtomicBool,
    active: Mutex<HashMap<u64, ServerWorker>>,
    /// Peers with a handshake thread in flight; retransmitted hellos are ignored.
    handshaking: Mutex<HashSet<SocketAddr>>,
    finished: FinishedList,
    next_id: AtomicU64,
}

impl ListenerShared {
    /// Drops workers whose read loop has exited. Returns how many went.
    fn collect_garbage(&self) -> usize {
        let pending = std::mem::take(&mut *self.finished.lock());
        if pending.is_empty() {
            return 0;
        }
        let mut collected = Vec::new();
        let mut retry = Vec::new();
        {
            let mut active = self.active.lock();
            for (id, cause) in pending {
                let ready = active
                    .get(&id)
                    .map(|worker| cause.is_collectable() || worker.is_finished());
                match ready {
                    Some(true) => collected.extend(active.remove(&id)),
                    Some(false) => retry.push((id, cause)),
                    None => {}
                }
            }
        }
        if !retry.is_empty() {
            self.finished.lock().extend(retry);
        }
        let count = collected.len();
        for worker in collected {
            tracing::debug!(worker = worker.id(), peer = %worker.peer_addr(), "collecting connection");
        }
        count
    }
}

/// Everything the accept thread needs besides the socket.
struct Acceptor {
    shared: Arc<ListenerShared>,
    cookies: CookieJar,
    handshake: Arc<ServerHandshake>,
    registry: Arc<HandlerRegistry>,
    read_timeout: Duration,
    gc_interval: Duration,
}

/// Accepts secured sessions and keeps one [`ServerWorker`] per node.
///
/// # Guarantees
/// - A peer that has not echoed a valid cookie causes no allocation.
/// - Workers are collected only after their read loop has exited.
/// - `terminate` runs once; later calls are logged and ignored.
pub struct Listener {
    shared: Arc<ListenerShared>,
    local_addr: SocketAddr,
    identity: Arc<ServerIdentity>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Listener {
    /// Loads the identity named by `config` and starts listening.
    ///
    /// Without a configured key an ephemeral identity is generated; nodes
    /// that pin the server key will then refuse to connect.
    pub fn start(config: &ServerConfig, registry: Arc<HandlerRegistry>) -> Result<Self, ListenerError> {
        config.validate()?;
        let identity = match &config.key_path {
            Some(key) => ServerIdentity::load(key, config.certificate_path.as_deref())?,
            None => {
                tracing::warn!("no key_path configured; using an ephemeral server identity");
                ServerIdentity::generate()
            }
        };
        Self::start_with_identity(config, Arc::new(identity), registry)
    }

    pub fn start_with_identity(
        config: &ServerConfig,
        identity: Arc<ServerIdentity>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, ListenerError> {
        let mut state = ListenerState::Initializing;
        let suites = config.suites()?;
        let cookies = CookieJar::new()?;

        let addr = config.listen_addr();
        let socket = bind_datagram(addr).map_err(|source| ListenerError::Bind { addr, source })?;
        socket.set_read_timeout(Some(config.accept_timeout))?;
        let local_addr = socket.local_addr()?;

        // Initializing -> Listening is always valid.
        let _ = state.transition(ListenerState::Listening);
        let shared = Arc::new(ListenerShared {
            state: Mutex::new(state),
            terminate: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
            handshaking: Mutex::new(HashSet::new()),
            finished: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        });
        let acceptor = Acceptor {
            shared: shared.clone(),
            cookies,
            handshake: Arc::new(ServerHandshake::new(identity.clone(), suites, config.handshake_timeout)),
            registry,
            read_timeout: config.client_read_timeout,
            gc_interval: config.gc_interval,
        };
        let thread = thread::Builder::new()
            .name("pixelnet-accept".into())
            .spawn(move || acceptor.run(socket))?;

        tracing::info!(addr = %local_addr, "listening for nodes");
        Ok(Self {
            shared,
            local_addr,
            identity,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.identity.verifying_key()
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.shared
            .active
            .lock()
            .values()
            .filter(|worker| worker.is_authenticated())
            .count()
    }

    /// Runs a collection pass now instead of waiting for the accept thread.
    pub fn collect_garbage(&self) -> usize {
        self.shared.collect_garbage()
    }

    /// Stops accepting, shuts every connection down and joins all threads.
    pub fn terminate(&self) {
        if let Err(err) = self.shared.state.lock().transition(ListenerState::Terminating) {
            tracing::warn!(error = %err, "listener terminate ignored");
            return;
        }
        self.shared.terminate.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("accept thread panicked");
            }
        }

        let workers = std::mem::take(&mut *self.shared.active.lock());
        for worker in workers.values() {
            worker.signal_shutdown();
        }
        let count = workers.len();
        drop(workers);
        self.shared.finished.lock().clear();

        let _ = self.shared.state.lock().transition(ListenerState::Closed);
        tracing::info!(addr = %self.local_addr, connections = count, "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.state() == ListenerState::Listening {
            self.terminate();
        }
    }
}

impl Acceptor {
    fn run(self, socket: UdpSocket) {
        let transport = CborUdpTransport::new(&socket);
        let local_ip = match socket.local_addr() {
            Ok(addr) => addr.ip(),
            Err(err) => {
                tracing::error!(error = %err, "listen socket has no local address");
                return;
            }
        };
        let mut last_gc = Instant::now();
        while !self.shared.terminate.load(Ordering::Acquire) {
            match transport.recv() {
                Ok(Some(inbound)) => self.handle(&transport, local_ip, inbound),
                Ok(None) => {}
                Err(HandshakeError::Protocol(reason)) => {
                    tracing::debug!(%reason, "ignoring undecodable datagram");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept socket error");
                }
            }
            if last_gc.elapsed() >= self.gc_interval {
                self.shared.collect_garbage();
                last_gc = Instant::now();
            }
        }
        tracing::debug!("accept loop stopped");
    }

    fn handle(&self, transport: &CborUdpTransport<'_>, local_ip: IpAddr, inbound: Inbound) {
        let peer = inbound.peer;
        let HandshakeMessage::ClientHello(hello) = inbound.message else {
            tracing::debug!(%peer, "ignoring non-hello datagram on listen socket");
            return;
        };
        if let Err(err) = hello.validate() {
            tracing::debug!(%peer, error = %err, "rejecting client hello");
            return;
        }

        let cookie_ok = hello
            .cookie
            .as_ref()
            .map_or(false, |cookie| self.cookies.verify(&peer, cookie));
        if !cookie_ok {
            let cookie = match self.cookies.issue(&peer) {
                Ok(cookie) => cookie,
                Err(err) => {
                    tracing::error!(%peer, error = %err, "could not issue cookie");
                    return;
                }
            };
            let verify = HelloVerifyRequest {
                cookie: cookie.to_vec(),
            };
            if let Err(err) = transport.send_to(&HandshakeMessage::HelloVerifyRequest(verify), peer) {
                tracing::debug!(%peer, error = %err, "hello verify request not sent");
            }
            return;
        }

        if !self.shared.handshaking.lock().insert(peer) {
            tracing::debug!(%peer, "handshake already in progress");
            return;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingConnection {
            id,
            peer,
            local_ip,
            hello,
            raw: inbound.raw,
            shared: self.shared.clone(),
            handshake: self.handshake.clone(),
            registry: self.registry.clone(),
            read_timeout: self.read_timeout,
        };
        let spawned = thread::Builder::new()
            .name(format!("pixelnet-handshake-{id}"))
            .spawn(move || pending.complete());
        if let Err(err) = spawned {
            self.shared.handshaking.lock().remove(&peer);
            tracing::error!(%peer, error = %err, "could not start handshake thread");
        }
    }
}

/// A cookie-verified hello waiting for its handshake to finish.
struct PendingConnection {
    id: u64,
    peer: SocketAddr,
    local_ip: IpAddr,
    hello: ClientHello,
    raw: Vec<u8>,
    shared: Arc<ListenerShared>,
    handshake: Arc<ServerHandshake>,
    registry: Arc<HandlerRegistry>,
    read_timeout: Duration,
}

impl PendingConnection {
    fn complete(self) {
        let peer = self.peer;
        let accepted = self.handshake.accept(self.local_ip, peer, &self.hello, &self.raw);
        self.shared.handshaking.lock().remove(&peer);
        let session = match accepted {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "handshake failed");
                return;
            }
        };

        let id = self.id;
        let finished = self.shared.finished.clone();
        let on_shutdown: ShutdownCallback = Box::new(move |cause| finished.lock().push((id, cause)));
        let worker = match ServerWorker::spawn(id, session, &self.registry, self.read_timeout, vec![on_shutdown]) {
            Ok(worker) => worker,
            Err(err) => {
                tracing::error!(%peer, error = %err, "could not start connection worker");
                return;
            }
        };

        // Checked under the table lock so `terminate` either sees this worker
        // or this thread sees the flag.
        let mut active = self.shared.active.lock();
        if self.shared.terminate.load(Ordering::Acquire) {
            drop(active);
            tracing::debug!(worker = id, %peer, "listener closed during handshake");
            drop(worker);
            return;
        }
        tracing::info!(worker = id, %peer, "node connected");
        active.insert(id, worker);
    }
}
