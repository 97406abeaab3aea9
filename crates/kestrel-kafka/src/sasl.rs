//! Per-connection SASL session state machine.
//!
//! One [`SaslSession`] exists per connection. While it is in `Initial` or
//! `Negotiating`, only API keys flagged as exempt from the auth gate may be
//! dispatched; everything else is answered with an authentication-required
//! error response without touching the session. `Disabled` and
//! `Authenticated` are equivalent for gating purposes. `Failed` is terminal:
//! the connection closes after the failure response is flushed.
//!
//! Mechanism and credential verification live behind the [`AuthBackend`]
//! port; the session only tracks protocol state.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use crate::codec::{encode_nullable_string, encode_string, ResponseHeader};
use crate::error::ErrorCode;

/// The identity established by a completed handshake, or the ambient identity
/// of a connection that does not require authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Identity of connections on which authentication is disabled.
    pub fn anonymous() -> Self {
        Self::new("ANONYMOUS")
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Session states. `Disabled`, `Authenticated`, and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslState {
    /// Authentication is not required on this listener.
    Disabled,
    /// Waiting for a SaslHandshake to select a mechanism.
    Initial,
    /// Mechanism selected; exchanging challenge/response rounds.
    Negotiating { mechanism: String },
    /// Handshake completed; all requests pass the gate.
    Authenticated { principal: Principal },
    /// Handshake failed; the connection must close.
    Failed,
}

/// One verification step from the authentication backend.
#[derive(Debug, Clone)]
pub enum AuthStep {
    /// More rounds needed; send these bytes back to the peer.
    Challenge(Vec<u8>),
    /// Authentication succeeded.
    Complete {
        principal: Principal,
        /// Final bytes to return to the peer (may be empty).
        response: Vec<u8>,
    },
    /// Authentication failed; the session becomes terminal.
    Failed(String),
}

/// Backend contract for credential verification.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Evaluate one client token for the given mechanism and return the next
    /// step of the exchange.
    async fn authenticate(&self, mechanism: &str, token: &[u8]) -> AuthStep;
}

/// Backend that fails every attempt. Used where SASL is disabled so a
/// misconfigured listener cannot silently authenticate anyone.
pub struct NullAuthBackend;

#[async_trait]
impl AuthBackend for NullAuthBackend {
    async fn authenticate(&self, _mechanism: &str, _token: &[u8]) -> AuthStep {
        AuthStep::Failed("no authentication backend configured".to_string())
    }
}

/// Result of one SaslAuthenticate round, ready to encode.
#[derive(Debug)]
pub struct AuthOutcome {
    pub code: ErrorCode,
    pub message: Option<String>,
    /// Challenge or final bytes for the peer.
    pub token: Vec<u8>,
}

/// The per-connection handshake state machine.
pub struct SaslSession {
    state: SaslState,
    mechanisms: Vec<String>,
}

impl SaslSession {
    /// Session for a listener that does not require authentication.
    pub fn disabled() -> Self {
        Self {
            state: SaslState::Disabled,
            mechanisms: Vec::new(),
        }
    }

    /// Session for a listener that requires authentication with one of the
    /// given mechanisms.
    pub fn required(mechanisms: Vec<String>) -> Self {
        Self {
            state: SaslState::Initial,
            mechanisms,
        }
    }

    pub fn state(&self) -> &SaslState {
        &self.state
    }

    /// Mechanisms advertised in handshake responses.
    pub fn mechanisms(&self) -> &[String] {
        &self.mechanisms
    }

    /// Gate rule: may a request with the given descriptor exemption execute
    /// in the current state?
    pub fn permits(&self, exempt_from_auth: bool) -> bool {
        match self.state {
            SaslState::Disabled | SaslState::Authenticated { .. } => true,
            SaslState::Initial | SaslState::Negotiating { .. } => exempt_from_auth,
            SaslState::Failed => false,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SaslState::Failed)
    }

    /// The principal requests execute as, if one is established. `Disabled`
    /// sessions act as the anonymous principal; a session mid-handshake has
    /// no principal.
    pub fn principal(&self) -> Option<Principal> {
        match &self.state {
            SaslState::Disabled => Some(Principal::anonymous()),
            SaslState::Authenticated { principal } => Some(principal.clone()),
            _ => None,
        }
    }

    /// Process a SaslHandshake request selecting `mechanism`.
    ///
    /// A valid mechanism moves `Initial` to `Negotiating`. An unknown
    /// mechanism moves the session to `Failed` (terminal). In any other state
    /// the handshake is out of place and answered with `IllegalSaslState`
    /// without changing the session.
    pub fn handle_handshake(&mut self, mechanism: &str) -> ErrorCode {
        match self.state {
            SaslState::Initial => {
                if self.mechanisms.iter().any(|m| m == mechanism) {
                    self.state = SaslState::Negotiating {
                        mechanism: mechanism.to_string(),
                    };
                    ErrorCode::None
                } else {
                    self.state = SaslState::Failed;
                    ErrorCode::UnsupportedSaslMechanism
                }
            }
            _ => ErrorCode::IllegalSaslState,
        }
    }

    /// Process one SaslAuthenticate round through the backend.
    ///
    /// Valid only while `Negotiating`; the backend verdict either keeps the
    /// exchange going, completes it, or fails the session terminally.
    pub async fn handle_authenticate(
        &mut self,
        backend: &dyn AuthBackend,
        token: &[u8],
    ) -> AuthOutcome {
        let mechanism = match &self.state {
            SaslState::Negotiating { mechanism } => mechanism.clone(),
            _ => {
                return AuthOutcome {
                    code: ErrorCode::IllegalSaslState,
                    message: Some("SaslAuthenticate without a mechanism handshake".to_string()),
                    token: Vec::new(),
                };
            }
        };

        match backend.authenticate(&mechanism, token).await {
            AuthStep::Challenge(challenge) => AuthOutcome {
                code: ErrorCode::None,
                message: None,
                token: challenge,
            },
            AuthStep::Complete {
                principal,
                response,
            } => {
                self.state = SaslState::Authenticated { principal };
                AuthOutcome {
                    code: ErrorCode::None,
                    message: None,
                    token: response,
                }
            }
            AuthStep::Failed(reason) => {
                self.state = SaslState::Failed;
                AuthOutcome {
                    code: ErrorCode::SaslAuthenticationFailed,
                    message: Some(reason),
                    token: Vec::new(),
                }
            }
        }
    }
}

/// Encode a SaslHandshake response: error code plus the enabled mechanisms.
pub fn encode_handshake_response(
    correlation_id: i32,
    code: ErrorCode,
    mechanisms: &[String],
) -> BytesMut {
    let mut buf = BytesMut::new();
    ResponseHeader::new(correlation_id).encode(&mut buf);
    buf.put_i16(code.as_i16());
    buf.put_i32(mechanisms.len() as i32);
    for mechanism in mechanisms {
        encode_string(&mut buf, mechanism);
    }
    buf
}

/// Encode a SaslAuthenticate response: error code, nullable message, token
/// bytes, and for v1+ a session lifetime (unbounded, reported as 0).
pub fn encode_authenticate_response(
    correlation_id: i32,
    api_version: i16,
    outcome: &AuthOutcome,
) -> BytesMut {
    let mut buf = BytesMut::new();
    ResponseHeader::new(correlation_id).encode(&mut buf);
    buf.put_i16(outcome.code.as_i16());
    encode_nullable_string(&mut buf, outcome.message.as_deref());
    buf.put_i32(outcome.token.len() as i32);
    buf.extend_from_slice(&outcome.token);
    if api_version >= 1 {
        buf.put_i64(0); // session_lifetime_ms
    }
    buf
}
