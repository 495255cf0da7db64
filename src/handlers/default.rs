use std::sync::Arc;

use crate::messages::control::{Ping, Pong, PING, PONG};
use crate::messages::{self, Status};
use crate::server::{ConnectionContext, HandlerError, MessageHandler};
use crate::wire::{Endpoint, Header};

/// Liveness pings. Open to unauthenticated connections.
pub struct DefaultHandler {
    ctx: Arc<ConnectionContext>,
}

impl DefaultHandler {
    pub fn new(ctx: Arc<ConnectionContext>) -> Self {
        Self { ctx }
    }
}

impl MessageHandler for DefaultHandler {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Default
    }

    fn handle(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        match header.message_type {
            PING => {
                let ping: Ping = match messages::decode(payload) {
                    Ok(ping) => ping,
                    Err(err) => {
                        self.ctx.nack(header, Status::Malformed)?;
                        return Err(HandlerError::malformed(Endpoint::Default, err));
                    }
                };
                let pong = Pong {
                    timestamp_ms: ping.timestamp_ms,
                    server_time_ms: messages::now_ms(),
                    authenticated: self.ctx.is_authenticated(),
                };
                self.ctx.reply(header, PONG, &pong)
            }
            other => Err(HandlerError::unknown_type(Endpoint::Default, other)),
        }
    }
}
