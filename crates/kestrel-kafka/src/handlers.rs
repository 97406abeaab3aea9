//! Built-in protocol-level handlers.
//!
//! Only ApiVersions lives here: it is part of the connection contract itself
//! (clients send it first, before authentication, to discover what they may
//! speak). Application APIs are registered by the embedder.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use crate::dispatch::{ApiDescriptor, HandlerError, RequestContext, RequestHandler};
use crate::admission::{Operation, RequestCategory};
use crate::error::ErrorCode;
use crate::types::{ApiKey, ApiVersionRange};
use std::sync::Arc;

/// ApiVersions handler (API key 18): advertises the version ranges of every
/// registered API.
pub struct ApiVersionsHandler {
    ranges: Vec<ApiVersionRange>,
}

pub const API_VERSIONS_MIN: i16 = 0;
pub const API_VERSIONS_MAX: i16 = 2;

impl ApiVersionsHandler {
    pub fn new(ranges: Vec<ApiVersionRange>) -> Self {
        Self { ranges }
    }

    /// Descriptor registering this handler. Exempt from the auth gate:
    /// clients probe versions before authenticating.
    pub fn descriptor(ranges: Vec<ApiVersionRange>) -> ApiDescriptor {
        ApiDescriptor {
            api_key: ApiKey::ApiVersions.as_i16(),
            name: "ApiVersions",
            min_version: API_VERSIONS_MIN,
            max_version: API_VERSIONS_MAX,
            requires_authorization: false,
            operation: Operation::Describe,
            exempt_from_auth: true,
            handshake: false,
            category: RequestCategory::Light,
            handler: Arc::new(Self::new(ranges)),
        }
    }

    /// Own advertised range, for callers assembling the full set before
    /// construction.
    pub fn own_range() -> ApiVersionRange {
        ApiVersionRange {
            api_key: ApiKey::ApiVersions.as_i16(),
            min_version: API_VERSIONS_MIN,
            max_version: API_VERSIONS_MAX,
        }
    }
}

#[async_trait]
impl RequestHandler for ApiVersionsHandler {
    async fn handle(&self, ctx: RequestContext) -> Result<BytesMut, HandlerError> {
        let mut response = BytesMut::new();

        response.put_i16(ErrorCode::None.as_i16());

        response.put_i32(self.ranges.len() as i32);
        for api in &self.ranges {
            response.put_i16(api.api_key);
            response.put_i16(api.min_version);
            response.put_i16(api.max_version);
        }

        if ctx.api_version() >= 1 {
            // Throttle time (v1+)
            response.put_i32(0);
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RequestHeader;
    use bytes::Buf;

    fn ctx(api_version: i16) -> RequestContext {
        RequestContext {
            header: RequestHeader {
                api_key: 18,
                api_version,
                correlation_id: 1,
                client_id: None,
            },
            payload: BytesMut::new(),
            principal: None,
        }
    }

    fn ranges() -> Vec<ApiVersionRange> {
        vec![
            ApiVersionRange {
                api_key: 0,
                min_version: 0,
                max_version: 9,
            },
            ApiVersionRange {
                api_key: 18,
                min_version: 0,
                max_version: 2,
            },
        ]
    }

    #[tokio::test]
    async fn v0_response_has_no_throttle_field() {
        let handler = ApiVersionsHandler::new(ranges());
        let mut body = handler.handle(ctx(0)).await.unwrap();

        assert_eq!(body.get_i16(), 0); // error_code
        assert_eq!(body.get_i32(), 2); // array count
        assert_eq!(body.get_i16(), 0); // api_key
        assert_eq!(body.get_i16(), 0); // min
        assert_eq!(body.get_i16(), 9); // max
        assert_eq!(body.get_i16(), 18);
        assert_eq!(body.get_i16(), 0);
        assert_eq!(body.get_i16(), 2);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn v1_response_appends_throttle_field() {
        let handler = ApiVersionsHandler::new(ranges());
        let v0 = handler.handle(ctx(0)).await.unwrap();
        let v1 = handler.handle(ctx(1)).await.unwrap();
        assert_eq!(v1.len(), v0.len() + 4);
        assert_eq!(&v1[v1.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn descriptor_is_gate_exempt() {
        let descriptor = ApiVersionsHandler::descriptor(ranges());
        assert!(descriptor.exempt_from_auth);
        assert!(!descriptor.handshake);
        assert!(!descriptor.requires_authorization);
    }
}
