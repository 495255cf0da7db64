//! Channel-data subscriptions.
//!
//! A subscription maps one of the node's channels to a framebuffer region.
//! Whenever the renderer completes that region the handler copies it out,
//! converts it to the subscribed wire format and pushes it to the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::directory::NodeDirectory;
use crate::framebuffer::Framebuffer;
use crate::messages::pixel::{
    ChannelData, Subscribe, SubscribeAck, Unsubscribe, UnsubscribeAck, CHANNEL_DATA,
    CHANNEL_DATA_OVERHEAD, SUBSCRIBE, SUBSCRIBE_ACK, UNSUBSCRIBE, UNSUBSCRIBE_ACK,
};
use crate::messages::{self, Status};
use crate::observer::ObserverToken;
use crate::pixel::{encode_pixels, PixelFormat};
use crate::server::{ConnectionContext, HandlerError, MessageHandler};
use crate::session::MAX_RECORD_PLAINTEXT;
use crate::wire::{Endpoint, Header, MAX_PAYLOAD_LEN};

/// Largest pixel byte count one `ChannelData` push can carry.
pub const MAX_CHANNEL_BYTES: usize = {
    let record = MAX_RECORD_PLAINTEXT - Header::SIZE;
    let payload = if record < MAX_PAYLOAD_LEN { record } else { MAX_PAYLOAD_LEN };
    payload - CHANNEL_DATA_OVERHEAD
};

struct Subscription {
    token: ObserverToken,
    /// Cleared before the observer is removed so an in-flight callback
    /// does not push for a channel the node already left.
    live: Arc<AtomicBool>,
}

/// What a region-completion callback needs to deliver one channel.
struct Delivery {
    ctx: Weak<ConnectionContext>,
    framebuffer: Weak<dyn Framebuffer>,
    live: Arc<AtomicBool>,
    channel: u32,
    fb_start: u32,
    length: u32,
    offset: u32,
    format: PixelFormat,
}

impl Delivery {
    fn deliver(&self, frame: u64) {
        if !self.live.load(Ordering::Acquire) {
            return;
        }
        let (Some(ctx), Some(framebuffer)) = (self.ctx.upgrade(), self.framebuffer.upgrade()) else {
            return;
        };
        let mut region = Vec::with_capacity(self.length as usize);
        if let Err(err) = framebuffer.copy_out(self.fb_start, self.length, &mut region) {
            tracing::warn!(peer = %ctx.peer(), channel = self.channel, error = %err, "channel copy failed");
            return;
        }
        let mut pixels = Vec::new();
        encode_pixels(&region, self.format, &mut pixels);
        let data = ChannelData {
            channel: self.channel,
            offset: self.offset,
            format: self.format as u8,
            frame,
            pixels,
        };
        if let Err(err) = ctx.push(Endpoint::PixelData, CHANNEL_DATA, &data) {
            tracing::debug!(peer = %ctx.peer(), channel = self.channel, error = %err, "channel data not sent");
        }
    }
}

pub struct PixelDataHandler {
    ctx: Arc<ConnectionContext>,
    directory: Arc<dyn NodeDirectory>,
    framebuffer: Arc<dyn Framebuffer>,
    subscriptions: HashMap<u32, Subscription>,
}

impl PixelDataHandler {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        directory: Arc<dyn NodeDirectory>,
        framebuffer: Arc<dyn Framebuffer>,
    ) -> Self {
        Self {
            ctx,
            directory,
            framebuffer,
            subscriptions: HashMap::new(),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns the format and the framebuffer index of the first pixel.
    fn validate(&self, node_id: u32, request: &Subscribe) -> Result<(PixelFormat, u32), Status> {
        let channel = self
            .directory
            .channels_for_node(node_id)
            .into_iter()
            .find(|c| c.index == request.channel)
            .ok_or(Status::InvalidChannel)?;
        if request.start >= channel.pixel_count {
            return Err(Status::InvalidOffset);
        }
        let end = request.start as u64 + request.length as u64;
        if request.length == 0 || end > channel.pixel_count as u64 {
            return Err(Status::InvalidLength);
        }
        let format = PixelFormat::from_u8(request.format).ok_or(Status::InvalidFormat)?;
        if request.length as u64 * format.bytes_per_pixel() as u64 > MAX_CHANNEL_BYTES as u64 {
            return Err(Status::InvalidLength);
        }
        let fb_start = channel
            .fb_offset
            .checked_add(request.start)
            .filter(|start| start.checked_add(request.length).is_some())
            .ok_or(Status::InvalidOffset)?;
        if self.subscriptions.contains_key(&request.channel) {
            return Err(Status::AlreadySubscribed);
        }
        Ok((format, fb_start))
    }

    fn subscribe(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        let request: Subscribe = match messages::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                let nack = SubscribeAck {
                    status: Status::Malformed,
                    channel: 0,
                };
                self.ctx.reply(header, SUBSCRIBE_ACK, &nack)?;
                return Err(HandlerError::malformed(Endpoint::PixelData, err));
            }
        };
        let ack = |status| SubscribeAck {
            status,
            channel: request.channel,
        };
        let node = match self.ctx.require_auth() {
            Ok(node) => node,
            Err(err) => {
                self.ctx.reply(header, SUBSCRIBE_ACK, &ack(Status::NotAuthenticated))?;
                return Err(err);
            }
        };
        let (format, fb_start) = match self.validate(node.id, &request) {
            Ok(valid) => valid,
            Err(status) => {
                tracing::debug!(peer = %self.ctx.peer(), channel = request.channel, ?status, "subscription refused");
                return self.ctx.reply(header, SUBSCRIBE_ACK, &ack(status));
            }
        };

        let live = Arc::new(AtomicBool::new(true));
        let delivery = Delivery {
            ctx: Arc::downgrade(&self.ctx),
            framebuffer: Arc::downgrade(&self.framebuffer),
            live: live.clone(),
            channel: request.channel,
            fb_start,
            length: request.length,
            offset: request.start,
            format,
        };
        let token = self.framebuffer.register_observer(
            fb_start,
            request.length,
            Arc::new(move |frame| delivery.deliver(frame)),
        );
        self.subscriptions
            .insert(request.channel, Subscription { token, live });
        tracing::debug!(
            peer = %self.ctx.peer(),
            channel = request.channel,
            fb_start,
            length = request.length,
            ?format,
            "channel subscribed"
        );
        self.ctx.reply(header, SUBSCRIBE_ACK, &ack(Status::Success))
    }

    fn unsubscribe(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        let refusal = |status| UnsubscribeAck { status, removed: 0 };
        let request: Unsubscribe = match messages::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                self.ctx.reply(header, UNSUBSCRIBE_ACK, &refusal(Status::Malformed))?;
                return Err(HandlerError::malformed(Endpoint::PixelData, err));
            }
        };
        if let Err(err) = self.ctx.require_auth() {
            self.ctx.reply(header, UNSUBSCRIBE_ACK, &refusal(Status::NotAuthenticated))?;
            return Err(err);
        }
        let removed = match request.channel {
            Some(channel) => self.release(channel) as u32,
            None => self.release_all(),
        };
        self.ctx.reply(
            header,
            UNSUBSCRIBE_ACK,
            &UnsubscribeAck {
                status: Status::Success,
                removed,
            },
        )
    }

    fn release(&mut self, channel: u32) -> bool {
        match self.subscriptions.remove(&channel) {
            Some(subscription) => {
                subscription.live.store(false, Ordering::Release);
                self.framebuffer.remove_observer(subscription.token);
                true
            }
            None => false,
        }
    }

    fn release_all(&mut self) -> u32 {
        let channels: Vec<u32> = self.subscriptions.keys().copied().collect();
        channels.into_iter().filter(|c| self.release(*c)).count() as u32
    }
}

impl MessageHandler for PixelDataHandler {
    fn endpoint(&self) -> Endpoint {
        Endpoint::PixelData
    }

    fn handle(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        match header.message_type {
            SUBSCRIBE => self.subscribe(header, payload),
            UNSUBSCRIBE => self.unsubscribe(header, payload),
            other => Err(HandlerError::unknown_type(Endpoint::PixelData, other)),
        }
    }
}

impl Drop for PixelDataHandler {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            tracing::debug!(peer = %self.ctx.peer(), released, "released channel subscriptions");
        }
    }
}
