//! Default endpoint payloads: liveness pings.

use serde::{Deserialize, Serialize};

pub const PING: u8 = 0x01;
pub const PONG: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp_ms: u64,
    pub server_time_ms: u64,
    pub authenticated: bool,
}
