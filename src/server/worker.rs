//! One secured connection and its read thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::handler::{ConnectionContext, HandlerError, MessageHandler};
use super::registry::HandlerRegistry;
use super::state::WorkerState;
use crate::messages::Status;
use crate::session::{DatagramSink, SecureSession, SessionError};
use crate::wire::decode_message;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// `signal_shutdown` was called; the read thread may still be running.
    Requested,
    /// The worker was dropped before anything else ended it.
    Dropped,
    PeerClosed,
    ProtocolViolation,
    AuthenticationFailed,
    Transport,
}

impl ShutdownCause {
    /// True when the read loop has already ended and the worker can be
    /// collected without waiting.
    pub fn is_collectable(&self) -> bool {
        !matches!(self, ShutdownCause::Requested | ShutdownCause::Dropped)
    }
}

pub type ShutdownCallback = Box<dyn FnOnce(ShutdownCause) + Send>;

struct WorkerShared {
    id: u64,
    session: Arc<SecureSession>,
    state: Mutex<WorkerState>,
    stop: AtomicBool,
    callbacks: Mutex<Vec<ShutdownCallback>>,
}

impl WorkerShared {
    /// Single entry into termination. Returns false if already terminating.
    fn begin_shutdown(&self, cause: ShutdownCause) -> bool {
        if self.state.lock().transition(WorkerState::Terminating).is_err() {
            return false;
        }
        self.stop.store(true, Ordering::Release);
        self.session.close();
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        tracing::debug!(
            worker = self.id,
            peer = %self.session.peer_addr(),
            ?cause,
            "connection shutting down"
        );
        for callback in callbacks {
            callback(cause);
        }
        true
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Owns one [`SecureSession`] and the handler set serving it.
///
/// Dropping a worker signals shutdown and joins the read thread.
pub struct ServerWorker {
    shared: Arc<WorkerShared>,
    context: Arc<ConnectionContext>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorker")
            .field("id", &self.shared.id)
            .field("peer", &self.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl ServerWorker {
    /// Instantiates every registered handler and starts the read thread.
    pub fn spawn(
        id: u64,
        session: SecureSession,
        registry: &HandlerRegistry,
        read_timeout: Duration,
        callbacks: Vec<ShutdownCallback>,
    ) -> std::io::Result<Self> {
        session.set_read_timeout(Some(read_timeout))?;
        let session = Arc::new(session);
        let sink: Arc<dyn DatagramSink> = session.clone();
        let context = Arc::new(ConnectionContext::new(session.peer_addr(), sink));

        let mut handlers: Vec<Box<dyn MessageHandler>> = Vec::with_capacity(registry.len());
        let mut capabilities: HashMap<u8, usize> = HashMap::new();
        for (name, factory) in registry.iter() {
            let handler = factory(context.clone());
            let endpoint = handler.endpoint();
            match capabilities.get(&(endpoint as u8)) {
                Some(_) => {
                    tracing::warn!(
                        handler = name,
                        endpoint = endpoint.as_str(),
                        "endpoint already claimed; handler ignored"
                    );
                }
                None => {
                    capabilities.insert(endpoint as u8, handlers.len());
                    handlers.push(handler);
                }
            }
        }

        let shared = Arc::new(WorkerShared {
            id,
            session,
            state: Mutex::new(WorkerState::Running),
            stop: AtomicBool::new(false),
            callbacks: Mutex::new(callbacks),
        });
        let thread_shared = shared.clone();
        let thread_context = context.clone();
        let thread = thread::Builder::new()
            .name(format!("pixelnet-worker-{id}"))
            .spawn(move || read_loop(thread_shared, thread_context, handlers, capabilities))?;

        Ok(Self {
            shared,
            context,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.session.peer_addr()
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.context.is_authenticated()
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    /// True once the read thread has exited and the handlers are gone.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Asks the read thread to stop. Returns without waiting for it.
    pub fn signal_shutdown(&self) {
        self.shared.begin_shutdown(ShutdownCause::Requested);
    }
}

impl Drop for ServerWorker {
    fn drop(&mut self) {
        self.shared.begin_shutdown(ShutdownCause::Dropped);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = self.shared.id, "worker thread panicked");
            }
        }
    }
}

fn read_loop(
    shared: Arc<WorkerShared>,
    context: Arc<ConnectionContext>,
    mut handlers: Vec<Box<dyn MessageHandler>>,
    capabilities: HashMap<u8, usize>,
) {
    let peer = shared.session.peer_addr();
    let cause = loop {
        if shared.stopping() {
            break ShutdownCause::Requested;
        }
        let datagram = match shared.session.recv() {
            Ok(Some(datagram)) => datagram,
            Ok(None) => continue,
            Err(SessionError::PeerClosed) => break ShutdownCause::PeerClosed,
            Err(SessionError::Closed) => break ShutdownCause::Requested,
            Err(err) => {
                if !shared.stopping() {
                    tracing::warn!(%peer, error = %err, "connection read failed");
                }
                break ShutdownCause::Transport;
            }
        };

        let (header, payload) = match decode_message(&datagram) {
            Ok(decoded) => decoded,
            Err(err) if err.is_fatal() => {
                tracing::warn!(%peer, error = %err, "protocol violation");
                break ShutdownCause::ProtocolViolation;
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "dropping malformed message");
                continue;
            }
        };

        let Some(&index) = capabilities.get(&header.endpoint) else {
            tracing::debug!(%peer, endpoint = header.endpoint, "no handler for endpoint");
            continue;
        };
        let handler = &mut handlers[index];
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&header, payload))) {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    %peer,
                    endpoint = header.endpoint,
                    message_type = header.message_type,
                    "handler panicked; message dropped"
                );
                continue;
            }
        };
        if let Err(err) = outcome {
            if err.is_fatal() {
                tracing::warn!(%peer, endpoint = header.endpoint, error = %err, "closing connection");
                break err.shutdown_cause();
            }
            if matches!(err, HandlerError::UnknownMessageType { .. }) {
                if let Err(nack_err) = context.nack(&header, Status::Unsupported) {
                    tracing::debug!(%peer, error = %nack_err, "nack not sent");
                }
            }
            tracing::debug!(%peer, endpoint = header.endpoint, error = %err, "message dropped");
        }
    };

    drop(handlers);
    shared.begin_shutdown(cause);
    // The only other transition out of Terminating is this one.
    let _ = shared.state.lock().transition(WorkerState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use crate::handshake::CipherSuite;
    use crate::messages::{Nack, NACK};
    use crate::session::tests::session_pair;
    use crate::wire::{encode_message, Endpoint, Header};

    struct Echo {
        ctx: Arc<ConnectionContext>,
        dropped: Arc<AtomicUsize>,
    }

    impl MessageHandler for Echo {
        fn endpoint(&self) -> Endpoint {
            Endpoint::Default
        }

        fn handle(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
            match header.message_type {
                1 => {
                    let value: u32 = crate::messages::decode(payload)?;
                    self.ctx.reply(header, 2, &value)
                }
                8 => panic!("handler bug"),
                9 => Err(HandlerError::ProtocolViolation("test".into())),
                other => Err(HandlerError::unknown_type(Endpoint::Default, other)),
            }
        }
    }

    impl Drop for Echo {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry(dropped: &Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for name in ["echo", "shadow"] {
            let dropped = dropped.clone();
            registry.register(name, move |ctx| {
                Box::new(Echo {
                    ctx,
                    dropped: dropped.clone(),
                })
            });
        }
        registry
    }

    fn send(session: &SecureSession, message_type: u8, value: u32) {
        let payload = crate::messages::encode(&value).unwrap();
        let datagram = encode_message(Header::new(Endpoint::Default, message_type, 3), &payload).unwrap();
        session.send(&datagram).unwrap();
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn spawn(dropped: &Arc<AtomicUsize>, causes: &Arc<Mutex<Vec<ShutdownCause>>>) -> (SecureSession, ServerWorker) {
        let (client, server) = session_pair(CipherSuite::ChaCha20Poly1305Sha256);
        let causes = causes.clone();
        let worker = ServerWorker::spawn(
            1,
            server,
            &registry(dropped),
            Duration::from_millis(20),
            vec![Box::new(move |cause| causes.lock().push(cause))],
        )
        .unwrap();
        (client, worker)
    }

    #[test]
    fn dispatches_to_first_claimant_and_survives_bad_messages() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let causes = Arc::default();
        let (client, worker) = spawn(&dropped, &causes);
        // The second factory lost the endpoint and was dropped immediately.
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        send(&client, 7, 0);
        let reply = client.recv().unwrap().unwrap();
        let (header, payload) = decode_message(&reply).unwrap();
        assert_eq!(header.message_type, NACK);
        let nack: Nack = crate::messages::decode(payload).unwrap();
        assert_eq!(nack.message_type, 7);
        assert_eq!(nack.status, Status::Unsupported);

        client.send(&[0x01, 0x00]).unwrap();
        send(&client, 1, 42);
        let reply = client.recv().unwrap().unwrap();
        let (header, payload) = decode_message(&reply).unwrap();
        assert_eq!(header.message_type, 2);
        assert_eq!(header.tag, 3);
        assert_eq!(crate::messages::decode::<u32>(payload).unwrap(), 42);
        assert_eq!(worker.state(), WorkerState::Running);
    }

    #[test]
    fn version_mismatch_ends_connection() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let causes: Arc<Mutex<Vec<ShutdownCause>>> = Arc::default();
        let (client, worker) = spawn(&dropped, &causes);
        client.send(&[0x02, 0, 1, 0, 0, 0]).unwrap();
        wait_for(|| worker.is_finished());
        assert_eq!(*causes.lock(), vec![ShutdownCause::ProtocolViolation]);
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert!(matches!(client.recv(), Err(SessionError::PeerClosed)));
    }

    #[test]
    fn fatal_handler_error_ends_connection() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let causes: Arc<Mutex<Vec<ShutdownCause>>> = Arc::default();
        let (client, worker) = spawn(&dropped, &causes);
        send(&client, 9, 0);
        wait_for(|| worker.is_finished());
        assert_eq!(*causes.lock(), vec![ShutdownCause::ProtocolViolation]);
    }

    #[test]
    fn handler_panic_drops_the_message_not_the_connection() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let causes: Arc<Mutex<Vec<ShutdownCause>>> = Arc::default();
        let (client, worker) = spawn(&dropped, &causes);

        send(&client, 8, 0);
        send(&client, 1, 5);
        let reply = client.recv().unwrap().unwrap();
        let (header, payload) = decode_message(&reply).unwrap();
        assert_eq!(header.message_type, 2);
        assert_eq!(crate::messages::decode::<u32>(payload).unwrap(), 5);
        assert_eq!(worker.state(), WorkerState::Running);

        client.close();
        wait_for(|| worker.is_finished());
        assert_eq!(*causes.lock(), vec![ShutdownCause::PeerClosed]);
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn peer_close_is_collectable() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let causes: Arc<Mutex<Vec<ShutdownCause>>> = Arc::default();
        let (client, worker) = spawn(&dropped, &causes);
        client.close();
        wait_for(|| worker.is_finished());
        let cause = causes.lock()[0];
        assert_eq!(cause, ShutdownCause::PeerClosed);
        assert!(cause.is_collectable());
    }

    #[test]
    fn callbacks_run_once_across_signal_and_drop() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let causes: Arc<Mutex<Vec<ShutdownCause>>> = Arc::default();
        let (_client, worker) = spawn(&dropped, &causes);
        worker.signal_shutdown();
        worker.signal_shutdown();
        drop(worker);
        assert_eq!(*causes.lock(), vec![ShutdownCause::Requested]);
        assert!(!ShutdownCause::Requested.is_collectable());
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}
