//! Payload schemas carried after the wire header, encoded as CBOR.
//!
//! Each endpoint owns a submodule with its message type numbers and payload
//! structs. Status codes are shared, but every endpoint answers with codes from
//! its own numeric range.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod auth;
pub mod control;
pub mod multicast;
pub mod pixel;

/// Errors produced while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload encode: {0}")]
    Encode(String),
    #[error("payload decode: {0}")]
    Decode(String),
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, MessageError> {
    serde_cbor::to_vec(msg).map_err(|e| MessageError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    serde_cbor::from_slice(bytes).map_err(|e| MessageError::Decode(e.to_string()))
}

/// Message type reserved on every endpoint for requests it cannot serve.
pub const NACK: u8 = 0xFF;

/// Negative acknowledgement for a request type the endpoint does not know or
/// a payload that has no ack of its own to carry the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nack {
    pub message_type: u8,
    pub status: Status,
}

/// Wall-clock milliseconds since the Unix epoch, as carried in timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Result code carried by acknowledgements.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Success = 0x00,
    Malformed = 0x01,
    NotAuthenticated = 0x02,
    Unsupported = 0x03,

    NoCommonMethod = 0x10,
    AuthenticationFailed = 0x11,

    InvalidChannel = 0x20,
    InvalidOffset = 0x21,
    InvalidLength = 0x22,
    InvalidFormat = 0x23,
    AlreadySubscribed = 0x24,

    InvalidKeyId = 0x30,
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let status = match value {
            0x00 => Status::Success,
            0x01 => Status::Malformed,
            0x02 => Status::NotAuthenticated,
            0x03 => Status::Unsupported,
            0x10 => Status::NoCommonMethod,
            0x11 => Status::AuthenticationFailed,
            0x20 => Status::InvalidChannel,
            0x21 => Status::InvalidOffset,
            0x22 => Status::InvalidLength,
            0x23 => Status::InvalidFormat,
            0x24 => Status::AlreadySubscribed,
            0x30 => Status::InvalidKeyId,
            other => return Err(format!("unknown status code {other:#04x}")),
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_its_code() {
        let bytes = encode(&Status::AlreadySubscribed).unwrap();
        let raw: u8 = decode(&bytes).unwrap();
        assert_eq!(raw, 0x24);
        let back: Status = decode(&bytes).unwrap();
        assert_eq!(back, Status::AlreadySubscribed);
    }

    #[test]
    fn unknown_status_code_fails_to_decode() {
        let bytes = encode(&0x7Fu8).unwrap();
        assert!(decode::<Status>(&bytes).is_err());
    }

    #[test]
    fn endpoint_ranges_are_disjoint() {
        let pixel = [
            Status::InvalidChannel,
            Status::InvalidOffset,
            Status::InvalidLength,
            Status::InvalidFormat,
            Status::AlreadySubscribed,
        ];
        for status in pixel {
            assert_eq!(u8::from(status) & 0xF0, 0x20);
        }
        assert_eq!(u8::from(Status::InvalidKeyId) & 0xF0, 0x30);
        assert_eq!(u8::from(Status::AuthenticationFailed) & 0xF0, 0x10);
    }
}
