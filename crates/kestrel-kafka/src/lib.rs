//! # Kestrel Kafka connection engine
//!
//! The per-connection core of a Kafka-wire-protocol broker: it owns one
//! network connection, decodes the length-prefixed request stream, runs the
//! SASL authentication gate, dispatches to versioned handlers, applies
//! authorization and quota admission control, and delivers responses in
//! strict request-arrival order even when handlers complete out of order.
//!
//! Application semantics stay outside: handlers, the authorizer, the quota
//! subsystem, and the authentication backend are async ports injected at
//! startup.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kestrel_kafka::{
//!     AllowAllAuthorizer, ApiVersionsHandler, DispatchTable, NullAuthBackend, Server,
//!     ServerConfig, ServerState, UnlimitedQuota,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let builder = DispatchTable::builder().with_sasl();
//!     let ranges = builder.version_ranges_with(&[ApiVersionsHandler::own_range()]);
//!     let table = builder
//!         .register(ApiVersionsHandler::descriptor(ranges))
//!         .build();
//!
//!     let state = Arc::new(ServerState::new(
//!         ServerConfig::default(),
//!         Arc::new(table),
//!         Arc::new(AllowAllAuthorizer),
//!         Arc::new(UnlimitedQuota),
//!         Arc::new(NullAuthBackend),
//!     ));
//!     Server::new(state).bind().await.unwrap().run().await.unwrap();
//! }
//! ```

pub mod admission;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod sasl;
pub mod sequencer;
pub mod server;
pub mod types;

pub use admission::{
    Admission, AdmissionController, AllowAllAuthorizer, Authorizer, Decision, Operation,
    QuotaGate, QuotaVerdict, RequestCategory, Resource, UnlimitedQuota,
};
pub use codec::{FrameCodec, RequestHeader, ResponseHeader};
pub use connection::handle_connection;
pub use dispatch::{
    ApiDescriptor, DispatchTable, DispatchTableBuilder, HandlerError, RequestContext,
    RequestHandler,
};
pub use error::{ConnResult, ConnectionError, ErrorCode};
pub use handlers::ApiVersionsHandler;
pub use sasl::{AuthBackend, AuthStep, NullAuthBackend, Principal, SaslSession, SaslState};
pub use sequencer::ResponseSequencer;
pub use server::{BoundServer, Server, ServerConfig, ServerState};
pub use types::{ApiKey, ApiVersionRange};
