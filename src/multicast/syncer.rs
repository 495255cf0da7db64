//! Background key rotation and encrypted group broadcasts.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use super::keystore::KeyStore;
use crate::config::{ConfigError, MulticastConfig};
use crate::crypto::{derive_message_iv, AeadContext, CryptoError, IV_LEN, KEY_LEN};
use crate::handshake::transport::unspecified_for;
use crate::messages::multicast::{SyncOutput, SYNC_FRAME_COMPLETED};
use crate::messages::{self, MessageError};
use crate::observer::{ObserverSet, ObserverToken};
use crate::wire::{encode_multicast, MulticastHeader, WireError, MAX_PAYLOAD_LEN};

/// Wait before retrying a rekey that failed to gather entropy.
const REKEY_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SyncerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("multicast socket: {0}")]
    Socket(#[from] io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Work for the syncer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    FrameCompleted { frame: u64 },
    Rekey,
    Shutdown,
}

/// Called with the new key id after every rekey.
pub type RekeyCallback = Arc<dyn Fn(u32) + Send + Sync>;

struct KeyState {
    store: KeyStore,
    aead: AeadContext,
}

struct SyncerShared {
    keys: Mutex<KeyState>,
    observers: ObserverSet<RekeyCallback>,
}

impl SyncerShared {
    fn rekey(&self) -> Result<u32, CryptoError> {
        let id = {
            let mut keys = self.keys.lock();
            let KeyState { store, aead } = &mut *keys;
            let record = store.generate()?;
            aead.load_key(&record.key)?;
            record.id
        };
        tracing::info!(key_id = id, "multicast key rotated");
        for observer in self.observers.snapshot() {
            observer(id);
        }
        Ok(id)
    }
}

/// Owns the rotating group key and the thread that broadcasts under it.
///
/// # Guarantees
/// - `current_key_id` always names a key the store can return.
/// - Superseded keys stay retrievable for `key_history - 1` rotations.
/// - Every broadcast uses a distinct IV under its key.
pub struct Syncer {
    shared: Arc<SyncerShared>,
    queue: Sender<WorkItem>,
    group: SocketAddr,
    terminated: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("group", &self.group)
            .field("key_id", &self.current_key_id())
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

impl Syncer {
    /// Issues the first key and starts broadcasting to the configured group.
    pub fn start(config: &MulticastConfig) -> Result<Self, SyncerError> {
        Self::start_with_target(config, config.group_addr())
    }

    /// Like [`Syncer::start`], but sends broadcasts to `target` instead of the
    /// group. Simulators use this to receive broadcasts over unicast.
    pub fn start_with_target(config: &MulticastConfig, target: SocketAddr) -> Result<Self, SyncerError> {
        config.validate()?;
        let socket = multicast_socket(config, target)?;

        let mut store = KeyStore::new(config.key_history);
        let mut aead = AeadContext::new();
        let first = store.generate()?;
        aead.load_key(&first.key)?;
        tracing::info!(key_id = first.id, group = %config.group_addr(), "multicast syncer starting");

        let shared = Arc::new(SyncerShared {
            keys: Mutex::new(KeyState { store, aead }),
            observers: ObserverSet::new(),
        });
        let (queue, inbox) = crossbeam_channel::unbounded();
        let runner = Runner {
            shared: shared.clone(),
            inbox,
            socket,
            target,
            interval: config.rekey_interval,
            sequence: 0,
            tag: 0,
        };
        let thread = thread::Builder::new()
            .name("pixelnet-syncer".into())
            .spawn(move || runner.run())?;

        Ok(Self {
            shared,
            queue,
            group: config.group_addr(),
            terminated: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn group_address(&self) -> IpAddr {
        self.group.ip()
    }

    pub fn group_port(&self) -> u16 {
        self.group.port()
    }

    pub fn current_key_id(&self) -> u32 {
        self.shared.keys.lock().store.current_id().unwrap_or(0)
    }

    pub fn is_key_id_valid(&self, key_id: u32) -> bool {
        self.shared.keys.lock().store.contains(key_id)
    }

    pub fn key_data(&self, key_id: u32) -> Option<[u8; KEY_LEN]> {
        self.shared.keys.lock().store.get(key_id).map(|r| r.key)
    }

    pub fn iv_data(&self, key_id: u32) -> Option<[u8; IV_LEN]> {
        self.shared.keys.lock().store.get(key_id).map(|r| r.iv)
    }

    /// Key and IV read under one lock acquisition.
    pub fn key_material(&self, key_id: u32) -> Option<([u8; KEY_LEN], [u8; IV_LEN])> {
        self.shared
            .keys
            .lock()
            .store
            .get(key_id)
            .map(|r| (r.key, r.iv))
    }

    /// Queues an immediate rotation. Returns false once terminated.
    pub fn force_rekey(&self) -> bool {
        self.enqueue(WorkItem::Rekey)
    }

    /// Queues a "render complete" broadcast for `frame`.
    pub fn notify_frame_completed(&self, frame: u64) -> bool {
        self.enqueue(WorkItem::FrameCompleted { frame })
    }

    fn enqueue(&self, item: WorkItem) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        self.queue.send(item).is_ok()
    }

    pub fn register_observer(&self, callback: RekeyCallback) -> ObserverToken {
        self.shared.observers.insert(callback)
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        self.shared.observers.remove(token)
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.len()
    }

    /// Stops the thread and waits for it. Runs once.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            tracing::warn!("syncer already terminated");
            return;
        }
        let _ = self.queue.send(WorkItem::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            // The last handle can be released by an observer on the syncer thread.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("syncer thread panicked");
            }
        }
        tracing::info!("multicast syncer stopped");
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::Acquire) {
            self.terminate();
        }
    }
}

fn multicast_socket(config: &MulticastConfig, target: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
    match target {
        SocketAddr::V4(_) => {
            socket.set_multicast_ttl_v4(config.ttl)?;
            socket.set_multicast_loop_v4(true)?;
            if let Some(IpAddr::V4(interface)) = config.interface {
                socket.set_multicast_if_v4(&interface)?;
            }
        }
        SocketAddr::V6(_) => {
            socket.set_multicast_hops_v6(config.ttl)?;
            socket.set_multicast_loop_v6(true)?;
            if config.interface.is_some() {
                tracing::warn!("multicast interface selection applies to IPv4 groups only");
            }
        }
    }
    socket.bind(&unspecified_for(&target).into())?;
    Ok(socket.into())
}

struct Runner {
    shared: Arc<SyncerShared>,
    inbox: Receiver<WorkItem>,
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    sequence: u64,
    tag: u8,
}

impl Runner {
    fn run(mut self) {
        let mut next_rekey = Instant::now() + self.interval;
        loop {
            let now = Instant::now();
            if next_rekey <= now {
                next_rekey = self.rotate();
                continue;
            }
            match self.inbox.recv_timeout(next_rekey - now) {
                Ok(WorkItem::FrameCompleted { frame }) => {
                    if let Err(err) = self.broadcast(frame) {
                        tracing::warn!(frame, error = %err, "sync broadcast failed");
                    }
                }
                Ok(WorkItem::Rekey) => next_rekey = self.rotate(),
                Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn rotate(&self) -> Instant {
        match self.shared.rekey() {
            Ok(_) => Instant::now() + self.interval,
            Err(err) => {
                tracing::error!(error = %err, "multicast rekey failed; keeping current key");
                Instant::now() + REKEY_RETRY
            }
        }
    }

    fn broadcast(&mut self, frame: u64) -> Result<(), SyncerError> {
        let plaintext = messages::encode(&SyncOutput {
            frame,
            timestamp_ms: messages::now_ms(),
        })?;
        let sequence = self.sequence;
        self.sequence += 1;

        let (key_id, ciphertext) = {
            let keys = self.shared.keys.lock();
            let record = keys.store.current().ok_or(CryptoError::NoKey)?;
            let iv = derive_message_iv(&record.iv, sequence);
            (record.id, keys.aead.encrypt(&plaintext, &iv)?)
        };

        let mut body = Vec::with_capacity(8 + ciphertext.len());
        body.extend_from_slice(&sequence.to_be_bytes());
        body.extend_from_slice(&ciphertext);
        assert!(
            body.len() <= MAX_PAYLOAD_LEN,
            "sealed sync payload of {} bytes overflows the length field",
            body.len()
        );

        let header = MulticastHeader::new(SYNC_FRAME_COMPLETED, self.tag, key_id);
        self.tag = self.tag.wrapping_add(1);
        let datagram = encode_multicast(header, &body)?;
        self.socket.send_to(&datagram, self.target)?;
        tracing::trace!(frame, key_id, sequence, "sync broadcast sent");
        Ok(())
    }
}
