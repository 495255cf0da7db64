//! Multicast control endpoint: group discovery and key distribution.

use std::sync::{Arc, Weak};

use crate::messages::multicast::{
    GetKey, Info, KeyData, RekeyNotice, GET_INFO, GET_KEY, INFO, KEY, REKEY_NOTICE,
};
use crate::messages::{self, Status};
use crate::multicast::Syncer;
use crate::observer::ObserverToken;
use crate::server::{ConnectionContext, HandlerError, MessageHandler};
use crate::wire::{Endpoint, Header};

/// Serves key material to authenticated nodes and pushes a notice on every
/// rotation.
///
/// # Guarantees
/// - Rekey notices reach a connection only after it authenticated.
/// - The syncer observer lives exactly as long as the handler.
pub struct MulticastControlHandler {
    ctx: Arc<ConnectionContext>,
    syncer: Arc<Syncer>,
    token: ObserverToken,
}

impl MulticastControlHandler {
    pub fn new(ctx: Arc<ConnectionContext>, syncer: Arc<Syncer>) -> Self {
        let weak: Weak<ConnectionContext> = Arc::downgrade(&ctx);
        let source = Arc::downgrade(&syncer);
        let token = syncer.register_observer(Arc::new(move |key_id| {
            let (Some(ctx), Some(syncer)) = (weak.upgrade(), source.upgrade()) else {
                return;
            };
            notify_rekey(&ctx, &syncer, key_id);
        }));
        Self { ctx, syncer, token }
    }

    fn info(&self, header: &Header) -> Result<(), HandlerError> {
        if let Err(err) = self.ctx.require_auth() {
            self.ctx.reply(
                header,
                INFO,
                &Info {
                    status: Status::NotAuthenticated,
                    group: String::new(),
                    port: 0,
                    key_id: 0,
                },
            )?;
            return Err(err);
        }
        let info = Info {
            status: Status::Success,
            group: self.syncer.group_address().to_string(),
            port: self.syncer.group_port(),
            key_id: self.syncer.current_key_id(),
        };
        self.ctx.reply(header, INFO, &info)
    }

    fn key(&self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        let refusal = |status, key_id| KeyData {
            status,
            key_id,
            key: Vec::new(),
            iv: Vec::new(),
        };
        let request: GetKey = match messages::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                self.ctx.reply(header, KEY, &refusal(Status::Malformed, 0))?;
                return Err(HandlerError::malformed(Endpoint::MulticastControl, err));
            }
        };
        if let Err(err) = self.ctx.require_auth() {
            self.ctx.reply(header, KEY, &refusal(Status::NotAuthenticated, request.key_id))?;
            return Err(err);
        }
        let reply = match self.syncer.key_material(request.key_id) {
            Some((key, iv)) => KeyData {
                status: Status::Success,
                key_id: request.key_id,
                key: key.to_vec(),
                iv: iv.to_vec(),
            },
            None => {
                tracing::debug!(peer = %self.ctx.peer(), key_id = request.key_id, "unknown multicast key requested");
                refusal(Status::InvalidKeyId, request.key_id)
            }
        };
        self.ctx.reply(header, KEY, &reply)
    }
}

fn notify_rekey(ctx: &ConnectionContext, syncer: &Syncer, key_id: u32) {
    if !ctx.is_authenticated() {
        return;
    }
    let Some((key, iv)) = syncer.key_material(key_id) else {
        return;
    };
    let notice = RekeyNotice {
        key_id,
        key: key.to_vec(),
        iv: iv.to_vec(),
    };
    if let Err(err) = ctx.push(Endpoint::MulticastControl, REKEY_NOTICE, &notice) {
        tracing::debug!(peer = %ctx.peer(), key_id, error = %err, "rekey notice not sent");
    }
}

impl MessageHandler for MulticastControlHandler {
    fn endpoint(&self) -> Endpoint {
        Endpoint::MulticastControl
    }

    fn handle(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        match header.message_type {
            GET_INFO => self.info(header),
            GET_KEY => self.key(header, payload),
            other => Err(HandlerError::unknown_type(Endpoint::MulticastControl, other)),
        }
    }
}

impl Drop for MulticastControlHandler {
    fn drop(&mut self) {
        self.syncer.remove_observer(self.token);
    }
}
