//! Error handling for the connection engine.
//!
//! Errors come in two tiers. Connection-fatal conditions (framing and header
//! decode failures, unknown API keys, a failed SASL session) surface as
//! [`ConnectionError`] and terminate the connection after any responses that
//! are already sequenced and ready have been flushed. Recoverable, per-request
//! conditions never become a `ConnectionError`; they are encoded as error
//! responses carrying the request's correlation id and a wire [`ErrorCode`],
//! and the connection keeps processing.

use thiserror::Error;

/// Result type for connection-level operations.
pub type ConnResult<T> = Result<T, ConnectionError>;

/// Connection-fatal errors. Any of these closes the connection; the peer must
/// reconnect.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Length-prefix violations: negative size or size above the configured
    /// maximum. No response is sent because the frame cannot be trusted.
    #[error("framing error: {0}")]
    Framing(String),

    /// Truncated or malformed request header. Fatal because the correlation
    /// id cannot be read, so no response can be correlated.
    #[error("header decode error: {0}")]
    Decode(String),

    /// The dispatch table has no descriptor for this API key. The protocol
    /// contract is broken; no safe response framing is defined.
    #[error("unsupported API key: {0}")]
    UnsupportedApiKey(i16),

    /// The SASL session reached its terminal failed state.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A handler signalled a condition that invalidates the whole connection.
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

/// Kafka protocol error codes carried in per-request error responses.
/// See: https://kafka.apache.org/protocol#protocol_error_codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    None = 0,
    UnknownServerError = -1,
    UnknownTopicOrPartition = 3,
    RequestTimedOut = 7,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    ClusterAuthorizationFailed = 31,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    UnsupportedVersion = 35,
    InvalidRequest = 42,
    SaslAuthenticationFailed = 58,
    ThrottlingQuotaExceeded = 89,
}

impl ErrorCode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}
