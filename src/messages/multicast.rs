//! Multicast control and multicast data payloads.

use serde::{Deserialize, Serialize};

use super::Status;

pub const GET_INFO: u8 = 0x01;
pub const INFO: u8 = 0x02;
pub const GET_KEY: u8 = 0x03;
pub const KEY: u8 = 0x04;
pub const REKEY_NOTICE: u8 = 0x05;

/// Message type of the encrypted broadcast sent on every completed frame.
pub const SYNC_FRAME_COMPLETED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub status: Status,
    pub group: String,
    pub port: u16,
    pub key_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetKey {
    pub key_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyData {
    pub status: Status,
    pub key_id: u32,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub iv: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyNotice {
    pub key_id: u32,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub iv: Vec<u8>,
}

/// Plaintext of a sync broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutput {
    pub frame: u64,
    pub timestamp_ms: u64,
}
