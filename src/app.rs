//! Process-level wiring: one syncer, one listener, the default handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::config::{ConfigError, ServerConfig};
use crate::directory::NodeDirectory;
use crate::framebuffer::Framebuffer;
use crate::handlers::register_defaults;
use crate::multicast::{Syncer, SyncerError};
use crate::server::{HandlerRegistry, Listener, ListenerError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("multicast syncer: {0}")]
    Syncer(#[from] SyncerError),
}

/// Owns the running server. Dropping it stops the listener, then the syncer.
#[derive(Debug)]
pub struct App {
    // Field order is drop order: connections release their syncer observers first.
    listener: Listener,
    syncer: Arc<Syncer>,
}

impl App {
    pub fn start(
        config: &ServerConfig,
        directory: Arc<dyn NodeDirectory>,
        framebuffer: Arc<dyn Framebuffer>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let syncer = Arc::new(Syncer::start(&config.multicast)?);
        Self::start_with_syncer(config, syncer, directory, framebuffer)
    }

    /// Starts the listener around an already running syncer.
    pub fn start_with_syncer(
        config: &ServerConfig,
        syncer: Arc<Syncer>,
        directory: Arc<dyn NodeDirectory>,
        framebuffer: Arc<dyn Framebuffer>,
    ) -> Result<Self, AppError> {
        let mut registry = HandlerRegistry::new();
        register_defaults(&mut registry, directory, framebuffer, syncer.clone());
        let listener = Listener::start(config, Arc::new(registry))?;
        tracing::info!(
            addr = %listener.local_addr(),
            group = %syncer.group_address(),
            key_id = syncer.current_key_id(),
            "pixelnet started"
        );
        Ok(Self { listener, syncer })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.listener.verifying_key()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn syncer(&self) -> &Arc<Syncer> {
        &self.syncer
    }

    /// Entry point for the render pipeline once a frame is on the wire.
    pub fn notify_frame_completed(&self, frame: u64) -> bool {
        self.syncer.notify_frame_completed(frame)
    }

    pub fn terminate(&self) {
        self.listener.terminate();
        self.syncer.terminate();
    }
}
