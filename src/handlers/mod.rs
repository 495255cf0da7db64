//! Built-in endpoint handlers and their registration.

pub mod auth;
pub mod default;
pub mod multicast_control;
pub mod pixel_data;

pub use auth::{AuthHandler, ChallengeStrategy, HmacSha256Challenge};
pub use default::DefaultHandler;
pub use multicast_control::MulticastControlHandler;
pub use pixel_data::PixelDataHandler;

use std::sync::Arc;

use crate::directory::NodeDirectory;
use crate::framebuffer::Framebuffer;
use crate::multicast::Syncer;
use crate::server::HandlerRegistry;

/// Registers the four standard endpoints in dispatch order.
pub fn register_defaults(
    registry: &mut HandlerRegistry,
    directory: Arc<dyn NodeDirectory>,
    framebuffer: Arc<dyn Framebuffer>,
    syncer: Arc<Syncer>,
) {
    registry.register("default", |ctx| Box::new(DefaultHandler::new(ctx)));

    let auth_directory = directory.clone();
    registry.register("authentication", move |ctx| {
        Box::new(AuthHandler::new(ctx, auth_directory.clone()))
    });

    registry.register("pixel_data", move |ctx| {
        Box::new(PixelDataHandler::new(ctx, directory.clone(), framebuffer.clone()))
    });

    registry.register("multicast_control", move |ctx| {
        Box::new(MulticastControlHandler::new(ctx, syncer.clone()))
    });
}
