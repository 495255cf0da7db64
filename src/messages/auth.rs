//! Authentication endpoint payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Status;

pub const REQUEST: u8 = 0x01;
pub const CHALLENGE: u8 = 0x02;
pub const RESPONSE: u8 = 0x03;
pub const RESULT: u8 = 0x04;

/// Node names itself and lists the challenge methods it can compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub node_id: Uuid,
    pub methods: Vec<String>,
}

/// Server's selected method plus its share of challenge material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub status: Status,
    pub method: Option<String>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub random: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(with = "serde_bytes")]
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub status: Status,
}
