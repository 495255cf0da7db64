//! Challenge/response authentication endpoint.
//!
//! ```text
//! Idle ──AuthRequest──▶ HandleResponse ──proof ok──▶ Authenticated
//!                             └──────────proof bad──▶ Failed
//! ```
//!
//! Any message after a terminal state is a protocol violation.

use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};

use crate::crypto::mac::{hmac_sha256, verify_hmac_sha256, MAC_LEN};
use crate::crypto::CryptoError;
use crate::directory::{Node, NodeDirectory};
use crate::messages::auth::{
    AuthChallenge, AuthRequest, AuthResponse, AuthResult, CHALLENGE, REQUEST, RESPONSE, RESULT,
};
use crate::messages::{self, Status};
use crate::server::{ConnectionContext, HandlerError, MessageHandler};
use crate::wire::{Endpoint, Header};

pub const METHOD_HMAC_SHA256: &str = "hmac-sha256";
pub const NONCE_LEN: usize = 16;
pub const CHALLENGE_RANDOM_LEN: usize = 32;

/// One challenge method, seeded with the node's shared secret.
pub trait ChallengeStrategy: Send {
    fn method(&self) -> &'static str;

    /// Produces the server's challenge material as `(nonce, random)`.
    fn challenge(&mut self) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// Checks the node's proof in constant time.
    fn verify(&self, proof: &[u8]) -> bool;
}

pub type StrategyFactory = fn(&[u8]) -> Box<dyn ChallengeStrategy>;

/// `proof = HMAC-SHA256(secret, nonce || random)`.
pub struct HmacSha256Challenge {
    secret: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    random: [u8; CHALLENGE_RANDOM_LEN],
}

impl HmacSha256Challenge {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            nonce: [0u8; NONCE_LEN],
            random: [0u8; CHALLENGE_RANDOM_LEN],
        }
    }

    pub fn boxed(secret: &[u8]) -> Box<dyn ChallengeStrategy> {
        Box::new(Self::new(secret))
    }

    /// The node's side of the computation.
    pub fn compute_proof(secret: &[u8], nonce: &[u8], random: &[u8]) -> Result<[u8; MAC_LEN], CryptoError> {
        hmac_sha256(secret, &[nonce, random])
    }
}

impl ChallengeStrategy for HmacSha256Challenge {
    fn method(&self) -> &'static str {
        METHOD_HMAC_SHA256
    }

    fn challenge(&mut self) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        OsRng
            .try_fill_bytes(&mut self.nonce)
            .and_then(|_| OsRng.try_fill_bytes(&mut self.random))
            .map_err(|e| CryptoError::Entropy(format!("auth challenge: {e}")))?;
        Ok((self.nonce.to_vec(), self.random.to_vec()))
    }

    fn verify(&self, proof: &[u8]) -> bool {
        verify_hmac_sha256(&self.secret, &[&self.nonce, &self.random], proof)
    }
}

/// Methods this server offers, in preference order.
pub fn supported_methods() -> Vec<(&'static str, StrategyFactory)> {
    vec![(METHOD_HMAC_SHA256, HmacSha256Challenge::boxed as StrategyFactory)]
}

enum AuthState {
    Idle,
    HandleResponse {
        /// `None` when the uuid was unknown; the challenge still runs.
        node: Option<Node>,
        strategy: Box<dyn ChallengeStrategy>,
    },
    Authenticated,
    Failed,
}

impl AuthState {
    fn name(&self) -> &'static str {
        match self {
            AuthState::Idle => "idle",
            AuthState::HandleResponse { .. } => "handle_response",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        }
    }
}

pub struct AuthHandler {
    ctx: Arc<ConnectionContext>,
    directory: Arc<dyn NodeDirectory>,
    methods: Vec<(&'static str, StrategyFactory)>,
    state: AuthState,
}

impl AuthHandler {
    pub fn new(ctx: Arc<ConnectionContext>, directory: Arc<dyn NodeDirectory>) -> Self {
        Self::with_methods(ctx, directory, supported_methods())
    }

    pub fn with_methods(
        ctx: Arc<ConnectionContext>,
        directory: Arc<dyn NodeDirectory>,
        methods: Vec<(&'static str, StrategyFactory)>,
    ) -> Self {
        Self {
            ctx,
            directory,
            methods,
            state: AuthState::Idle,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn on_request(&mut self, header: &Header, payload: &[u8]) -> Result<AuthState, HandlerError> {
        let request: AuthRequest = match messages::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                let reply = AuthChallenge {
                    status: Status::Malformed,
                    method: None,
                    nonce: Vec::new(),
                    random: Vec::new(),
                };
                self.ctx.reply(header, CHALLENGE, &reply)?;
                return Err(HandlerError::malformed(Endpoint::Authentication, err));
            }
        };

        let selected = self
            .methods
            .iter()
            .find(|(name, _)| request.methods.iter().any(|offered| offered == name));
        let Some(&(method, factory)) = selected else {
            tracing::info!(peer = %self.ctx.peer(), offered = ?request.methods, "no common authentication method");
            let reply = AuthChallenge {
                status: Status::NoCommonMethod,
                method: None,
                nonce: Vec::new(),
                random: Vec::new(),
            };
            self.ctx.reply(header, CHALLENGE, &reply)?;
            return Ok(AuthState::Failed);
        };

        let node = self.directory.find_node_by_uuid(&request.node_id);
        let mut strategy = match &node {
            Some(node) => factory(&node.secret),
            None => {
                tracing::debug!(peer = %self.ctx.peer(), node = %request.node_id, "unknown node; issuing decoy challenge");
                let mut decoy = [0u8; 32];
                OsRng
                    .try_fill_bytes(&mut decoy)
                    .map_err(|e| HandlerError::ProtocolViolation(format!("entropy source: {e}")))?;
                factory(&decoy)
            }
        };
        let (nonce, random) = strategy
            .challenge()
            .map_err(|e| HandlerError::ProtocolViolation(e.to_string()))?;
        self.ctx.reply(
            header,
            CHALLENGE,
            &AuthChallenge {
                status: Status::Success,
                method: Some(method.to_string()),
                nonce,
                random,
            },
        )?;
        Ok(AuthState::HandleResponse { node, strategy })
    }

    fn on_response(
        &mut self,
        header: &Header,
        payload: &[u8],
        node: Option<Node>,
        strategy: Box<dyn ChallengeStrategy>,
    ) -> Result<AuthState, HandlerError> {
        let proof = messages::decode::<AuthResponse>(payload)
            .map(|response| response.proof)
            .unwrap_or_default();
        match node {
            Some(node) if strategy.verify(&proof) => {
                tracing::info!(peer = %self.ctx.peer(), node = node.id, label = %node.label, "node authenticated");
                self.ctx.mark_authenticated(node);
                self.ctx.reply(header, RESULT, &AuthResult { status: Status::Success })?;
                Ok(AuthState::Authenticated)
            }
            _ => {
                tracing::warn!(peer = %self.ctx.peer(), "authentication failed");
                self.ctx.reply(
                    header,
                    RESULT,
                    &AuthResult {
                        status: Status::AuthenticationFailed,
                    },
                )?;
                Ok(AuthState::Failed)
            }
        }
    }
}

impl MessageHandler for AuthHandler {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Authentication
    }

    fn handle(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError> {
        let state = std::mem::replace(&mut self.state, AuthState::Failed);
        let next = match (state, header.message_type) {
            (AuthState::Idle, REQUEST) => self.on_request(header, payload),
            (AuthState::HandleResponse { node, strategy }, RESPONSE) => {
                self.on_response(header, payload, node, strategy)
            }
            (state, message_type) => {
                return Err(HandlerError::ProtocolViolation(format!(
                    "authentication message {message_type:#04x} in state {}",
                    state.name()
                )));
            }
        };
        match next {
            Ok(AuthState::Failed) => Err(HandlerError::AuthenticationFailed),
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                // A request that never parsed leaves the exchange where it was.
                if matches!(err, HandlerError::Malformed { .. }) && header.message_type == REQUEST {
                    self.state = AuthState::Idle;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::directory::MemoryDirectory;
    use crate::server::handler::tests::{context, RecordingSink};

    fn setup() -> (AuthHandler, Arc<ConnectionContext>, Arc<RecordingSink>, Node) {
        let directory = Arc::new(MemoryDirectory::new());
        let node = Node {
            id: 12,
            uuid: Uuid::new_v4(),
            secret: b"node-secret".to_vec(),
            label: "stage-left".into(),
        };
        directory.insert_node(node.clone());
        let (ctx, sink) = context();
        (AuthHandler::new(ctx.clone(), directory), ctx, sink, node)
    }

    fn request(handler: &mut AuthHandler, uuid: Uuid, methods: &[&str]) -> Result<(), HandlerError> {
        let payload = messages::encode(&AuthRequest {
            node_id: uuid,
            methods: methods.iter().map(|m| m.to_string()).collect(),
        })
        .unwrap();
        handler.handle(&Header::new(Endpoint::Authentication, REQUEST, 1), &payload)
    }

    fn respond(handler: &mut AuthHandler, proof: Vec<u8>) -> Result<(), HandlerError> {
        let payload = messages::encode(&AuthResponse { proof }).unwrap();
        handler.handle(&Header::new(Endpoint::Authentication, RESPONSE, 2), &payload)
    }

    fn last_challenge(sink: &RecordingSink) -> AuthChallenge {
        let (header, payload) = sink.take().pop().unwrap();
        assert_eq!(header.message_type, CHALLENGE);
        messages::decode(&payload).unwrap()
    }

    #[test]
    fn correct_proof_authenticates_and_binds_node() {
        let (mut handler, ctx, sink, node) = setup();
        request(&mut handler, node.uuid, &["other", METHOD_HMAC_SHA256]).unwrap();
        let challenge = last_challenge(&sink);
        assert_eq!(challenge.method.as_deref(), Some(METHOD_HMAC_SHA256));
        assert_eq!(challenge.nonce.len(), NONCE_LEN);
        assert_eq!(challenge.random.len(), CHALLENGE_RANDOM_LEN);
        assert!(!ctx.is_authenticated());

        let proof = HmacSha256Challenge::compute_proof(&node.secret, &challenge.nonce, &challenge.random).unwrap();
        respond(&mut handler, proof.to_vec()).unwrap();
        assert_eq!(handler.state_name(), "authenticated");
        assert_eq!(ctx.node().unwrap().id, node.id);
        let (header, payload) = sink.take().pop().unwrap();
        assert_eq!(header.message_type, RESULT);
        assert_eq!(header.tag, 2);
        assert_eq!(messages::decode::<AuthResult>(&payload).unwrap().status, Status::Success);
    }

    #[test]
    fn wrong_proof_fails_and_is_fatal() {
        let (mut handler, ctx, sink, node) = setup();
        request(&mut handler, node.uuid, &[METHOD_HMAC_SHA256]).unwrap();
        let challenge = last_challenge(&sink);
        let proof = HmacSha256Challenge::compute_proof(b"wrong", &challenge.nonce, &challenge.random).unwrap();
        let err = respond(&mut handler, proof.to_vec()).unwrap_err();
        assert!(err.is_fatal());
        assert!(!ctx.is_authenticated());
        let (_, payload) = sink.take().pop().unwrap();
        assert_eq!(
            messages::decode::<AuthResult>(&payload).unwrap().status,
            Status::AuthenticationFailed
        );
    }

    #[test]
    fn unknown_node_gets_indistinguishable_challenge() {
        let (mut handler, ctx, sink, _) = setup();
        request(&mut handler, Uuid::new_v4(), &[METHOD_HMAC_SHA256]).unwrap();
        let challenge = last_challenge(&sink);
        assert_eq!(challenge.status, Status::Success);
        let proof = HmacSha256Challenge::compute_proof(b"guess", &challenge.nonce, &challenge.random).unwrap();
        assert!(matches!(
            respond(&mut handler, proof.to_vec()),
            Err(HandlerError::AuthenticationFailed)
        ));
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn no_common_method_terminates() {
        let (mut handler, _, sink, node) = setup();
        let err = request(&mut handler, node.uuid, &["kerberos"]).unwrap_err();
        assert!(matches!(err, HandlerError::AuthenticationFailed));
        let challenge = last_challenge(&sink);
        assert_eq!(challenge.status, Status::NoCommonMethod);
        assert!(challenge.method.is_none());
    }

    #[test]
    fn messages_after_terminal_states_are_violations() {
        let (mut handler, _, sink, node) = setup();
        request(&mut handler, node.uuid, &[METHOD_HMAC_SHA256]).unwrap();
        let challenge = last_challenge(&sink);
        let proof = HmacSha256Challenge::compute_proof(&node.secret, &challenge.nonce, &challenge.random).unwrap();
        respond(&mut handler, proof.to_vec()).unwrap();

        let err = request(&mut handler, node.uuid, &[METHOD_HMAC_SHA256]).unwrap_err();
        assert!(matches!(err, HandlerError::ProtocolViolation(_)));
        assert!(err.is_fatal());

        let (mut failed, _, _, node) = setup();
        request(&mut failed, node.uuid, &[METHOD_HMAC_SHA256]).unwrap();
        let _ = respond(&mut failed, vec![0; 32]);
        assert!(matches!(
            respond(&mut failed, vec![0; 32]),
            Err(HandlerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn response_before_request_is_a_violation() {
        let (mut handler, _, _, _) = setup();
        assert!(matches!(
            respond(&mut handler, vec![1, 2, 3]),
            Err(HandlerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn malformed_request_is_answered_and_keeps_handler_idle() {
        let (mut handler, _, sink, node) = setup();
        let err = handler
            .handle(&Header::new(Endpoint::Authentication, REQUEST, 1), &[0xff, 0x00])
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(handler.state_name(), "idle");
        let challenge = last_challenge(&sink);
        assert_eq!(challenge.status, Status::Malformed);
        assert!(challenge.method.is_none());
        request(&mut handler, node.uuid, &[METHOD_HMAC_SHA256]).unwrap();
    }
}
