//! Connection-side server: listener, per-connection workers and the handler
//! plumbing they share.

pub mod handler;
pub mod listener;
pub mod registry;
pub mod state;
pub mod worker;

pub use handler::{ConnectionContext, HandlerError, MessageHandler};
pub use listener::{Listener, ListenerError};
pub use registry::{HandlerFactory, HandlerRegistry};
pub use state::{ListenerState, WorkerState};
pub use worker::{ServerWorker, ShutdownCause};
