//! Pixel-data endpoint payloads.

use serde::{Deserialize, Serialize};

use super::Status;

pub const SUBSCRIBE: u8 = 0x01;
pub const SUBSCRIBE_ACK: u8 = 0x02;
pub const UNSUBSCRIBE: u8 = 0x03;
pub const UNSUBSCRIBE_ACK: u8 = 0x04;
pub const CHANNEL_DATA: u8 = 0x05;

/// Upper bound on the CBOR framing a [`ChannelData`] adds around its pixel
/// bytes: five field names plus maximal integer and length encodings.
pub const CHANNEL_DATA_OVERHEAD: usize = 64;

/// `format` stays a raw code so unsupported values reach validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub channel: u32,
    pub start: u32,
    pub length: u32,
    pub format: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAck {
    pub status: Status,
    pub channel: u32,
}

/// `None` drops every subscription held by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub channel: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeAck {
    pub status: Status,
    pub removed: u32,
}

/// Unsolicited push of one subscribed region after a frame completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelData {
    pub channel: u32,
    pub offset: u32,
    pub format: u8,
    pub frame: u64,
    #[serde(with = "serde_bytes")]
    pub pixels: Vec<u8>,
}
