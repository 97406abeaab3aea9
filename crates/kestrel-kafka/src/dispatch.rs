//! Versioned request dispatch.
//!
//! The dispatch table is built once at startup, shared read-only by every
//! connection, and maps an API key to its descriptor: supported version
//! range, admission flags, and the handler behind the [`RequestHandler`]
//! port. Handlers own the application semantics of their API; the engine
//! only knows this contract.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;

use crate::admission::{Operation, RequestCategory};
use crate::codec::RequestHeader;
use crate::error::ErrorCode;
use crate::sasl::Principal;
use crate::types::{ApiKey, ApiVersionRange};

/// Everything a handler gets for one request.
pub struct RequestContext {
    pub header: RequestHeader,
    /// Opaque request payload: the frame minus the shared header.
    pub payload: BytesMut,
    /// Identity the request executes as, when one is established.
    pub principal: Option<Principal>,
}

impl RequestContext {
    /// Negotiated version, already checked against the descriptor range.
    pub fn api_version(&self) -> i16 {
        self.header.api_version
    }
}

/// Handler failure modes.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Per-request failure: becomes an error response carrying the request's
    /// correlation id; the connection keeps going.
    #[error("request error: {0:?}")]
    Request(ErrorCode),

    /// The handler detected a condition that invalidates the connection
    /// (e.g. upstream protocol inconsistency). Tears the connection down.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Contract for versioned request handlers. Implementations must suspend on
/// their own backend calls rather than block the runtime.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext) -> Result<BytesMut, HandlerError>;
}

/// Placeholder handler for APIs the connection loop services itself
/// (SaslHandshake, SaslAuthenticate). Never invoked through dispatch.
struct SessionHandled;

#[async_trait]
impl RequestHandler for SessionHandled {
    async fn handle(&self, _ctx: RequestContext) -> Result<BytesMut, HandlerError> {
        Err(HandlerError::Request(ErrorCode::IllegalSaslState))
    }
}

/// Immutable per-API dispatch entry.
#[derive(Clone)]
pub struct ApiDescriptor {
    pub api_key: i16,
    pub name: &'static str,
    pub min_version: i16,
    pub max_version: i16,
    /// Run the authorization check before executing.
    pub requires_authorization: bool,
    /// Operation this API implies for authorization purposes.
    pub operation: Operation,
    /// May execute before the SASL session is authenticated.
    pub exempt_from_auth: bool,
    /// Serviced inline by the connection's SASL session.
    pub handshake: bool,
    /// Cost class reported to the quota subsystem.
    pub category: RequestCategory,
    pub handler: Arc<dyn RequestHandler>,
}

impl fmt::Debug for ApiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiDescriptor")
            .field("api_key", &self.api_key)
            .field("name", &self.name)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("requires_authorization", &self.requires_authorization)
            .field("exempt_from_auth", &self.exempt_from_auth)
            .field("handshake", &self.handshake)
            .finish()
    }
}

impl ApiDescriptor {
    pub fn supports_version(&self, version: i16) -> bool {
        version >= self.min_version && version <= self.max_version
    }

    pub fn version_range(&self) -> ApiVersionRange {
        ApiVersionRange {
            api_key: self.api_key,
            min_version: self.min_version,
            max_version: self.max_version,
        }
    }
}

/// Descriptor for SaslHandshake. The connection loop services it inline.
pub fn sasl_handshake_descriptor() -> ApiDescriptor {
    ApiDescriptor {
        api_key: ApiKey::SaslHandshake.as_i16(),
        name: "SaslHandshake",
        min_version: 0,
        max_version: 1,
        requires_authorization: false,
        operation: Operation::ClusterAction,
        exempt_from_auth: true,
        handshake: true,
        category: RequestCategory::Light,
        handler: Arc::new(SessionHandled),
    }
}

/// Descriptor for SaslAuthenticate. The connection loop services it inline.
pub fn sasl_authenticate_descriptor() -> ApiDescriptor {
    ApiDescriptor {
        api_key: ApiKey::SaslAuthenticate.as_i16(),
        name: "SaslAuthenticate",
        min_version: 0,
        max_version: 1,
        requires_authorization: false,
        operation: Operation::ClusterAction,
        exempt_from_auth: true,
        handshake: true,
        category: RequestCategory::Light,
        handler: Arc::new(SessionHandled),
    }
}

/// Process-wide, read-only registry mapping API keys to descriptors.
/// Built once at startup; shared by reference into every connection.
pub struct DispatchTable {
    by_key: HashMap<i16, ApiDescriptor>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder {
            descriptors: Vec::new(),
        }
    }

    /// Look up the descriptor for an API key. `None` means the key is not
    /// part of the protocol contract at all, which is connection-fatal to
    /// callers.
    pub fn lookup(&self, api_key: i16) -> Option<&ApiDescriptor> {
        self.by_key.get(&api_key)
    }

    /// Version ranges of every registered API, sorted by key. This is what
    /// an ApiVersions handler advertises.
    pub fn version_ranges(&self) -> Vec<ApiVersionRange> {
        let mut ranges: Vec<_> = self.by_key.values().map(|d| d.version_range()).collect();
        ranges.sort_by_key(|r| r.api_key);
        ranges
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

pub struct DispatchTableBuilder {
    descriptors: Vec<ApiDescriptor>,
}

impl DispatchTableBuilder {
    pub fn register(mut self, descriptor: ApiDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Register the SASL handshake descriptors.
    pub fn with_sasl(self) -> Self {
        self.register(sasl_handshake_descriptor())
            .register(sasl_authenticate_descriptor())
    }

    /// Version ranges registered so far plus the given extra entries. Lets a
    /// caller compute the advertised set before registering the ApiVersions
    /// handler itself.
    pub fn version_ranges_with(&self, extra: &[ApiVersionRange]) -> Vec<ApiVersionRange> {
        let mut ranges: Vec<_> = self
            .descriptors
            .iter()
            .map(|d| d.version_range())
            .chain(extra.iter().copied())
            .collect();
        ranges.sort_by_key(|r| r.api_key);
        ranges
    }

    pub fn build(self) -> DispatchTable {
        let mut by_key = HashMap::with_capacity(self.descriptors.len());
        for descriptor in self.descriptors {
            let key = descriptor.api_key;
            let replaced = by_key.insert(key, descriptor);
            assert!(replaced.is_none(), "duplicate descriptor for api key {}", key);
        }
        DispatchTable { by_key }
    }
}
