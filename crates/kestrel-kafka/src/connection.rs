//! Per-connection protocol engine.
//!
//! One task per accepted socket drives the loop: read frame → decode header →
//! SASL gate → dispatch lookup and version check → admission control →
//! concurrent handler execution → in-order response flush. Handler tasks
//! report completions over a channel; the [`ResponseSequencer`] guarantees
//! responses leave the socket in request-arrival order no matter when
//! handlers finish.
//!
//! Error tiers: anything that makes the stream untrustworthy (framing or
//! header decode failures, unknown API keys, a failed SASL session, a fatal
//! handler verdict) terminates the loop after flushing responses that are
//! already sequenced and ready. Per-request failures become sequenced error
//! responses and the loop keeps reading.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

use crate::admission::{Admission, AdmissionController, QuotaRegistration};
use crate::codec::{
    encode_error_response, encode_response, parse_bytes, parse_string, FrameCodec, RequestHeader,
};
use crate::dispatch::{HandlerError, RequestContext};
use crate::error::{ConnResult, ConnectionError, ErrorCode};
use crate::sasl::{self, SaslSession};
use crate::sequencer::ResponseSequencer;
use crate::server::ServerState;
use crate::types::ApiKey;

/// Handler task result: the reserved sequence slot plus either a complete
/// response body or a fatal failure message.
type Completion = (u64, Result<BytesMut, String>);

/// Handle a single client connection until stream end or a fatal error.
///
/// Generic over the stream so tests can drive it over in-memory pipes.
#[instrument(skip(stream, state), fields(client = %peer))]
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> ConnResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("new connection");

    let codec = FrameCodec::with_max_frame_size(state.config.max_frame_size);
    let sasl = if state.config.sasl_enabled {
        SaslSession::required(state.config.sasl_mechanisms.clone())
    } else {
        SaslSession::disabled()
    };
    let (completions, mut rx) = mpsc::unbounded_channel();

    let mut conn = Connection {
        framed: Framed::new(stream, codec),
        admission: AdmissionController::new(state.authorizer.clone(), state.quota.clone()),
        quota_reg: QuotaRegistration::new(state.quota.clone()),
        state,
        sasl,
        sequencer: ResponseSequencer::new(),
        client_id: None,
        throttle: None,
        completions,
    };

    let result = conn.serve(&mut rx).await;

    // Teardown, on every exit path: pick up completions already delivered,
    // flush whatever is sequenced and ready, discard the rest. Quota
    // registrations are released by the QuotaRegistration drop.
    while let Ok((seq, outcome)) = rx.try_recv() {
        if let Ok(response) = outcome {
            conn.sequencer.complete(seq, response);
        }
    }
    let _ = conn.flush_ready().await;
    let _ = conn.framed.flush().await;

    result
}

struct Connection<S> {
    framed: Framed<S, FrameCodec>,
    state: Arc<ServerState>,
    admission: AdmissionController,
    quota_reg: QuotaRegistration,
    sasl: SaslSession,
    sequencer: ResponseSequencer,
    client_id: Option<String>,
    /// Quota-imposed deadline before the next frame may be admitted.
    throttle: Option<Instant>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn serve(&mut self, rx: &mut mpsc::UnboundedReceiver<Completion>) -> ConnResult<()> {
        loop {
            tokio::select! {
                Some((seq, outcome)) = rx.recv() => {
                    match outcome {
                        Ok(response) => {
                            self.sequencer.complete(seq, response);
                            self.flush_ready().await?;
                        }
                        Err(reason) => {
                            warn!(%reason, "handler signalled fatal condition");
                            return Err(ConnectionError::Fatal(reason));
                        }
                    }
                }
                frame = next_frame(&mut self.framed, &mut self.throttle) => {
                    match frame {
                        None => {
                            debug!("peer closed stream");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "frame decode error");
                            return Err(e);
                        }
                        Some(Ok(frame)) => self.process_frame(frame).await?,
                    }
                }
            }
        }
    }

    async fn process_frame(&mut self, mut frame: BytesMut) -> ConnResult<()> {
        let request_bytes = frame.len();
        let header = RequestHeader::parse(&mut frame)?;

        if let Some(client_id) = header.client_id.as_deref() {
            self.quota_reg.track(client_id);
            if self.client_id.as_deref() != Some(client_id) {
                self.client_id = Some(client_id.to_string());
            }
        }

        debug!(
            api_key = header.api_key,
            api_version = header.api_version,
            correlation_id = header.correlation_id,
            client_id = ?header.client_id,
            "request"
        );

        let descriptor = match self.state.dispatch.lookup(header.api_key) {
            Some(descriptor) => descriptor.clone(),
            None => {
                warn!(api_key = header.api_key, "unsupported API key");
                return Err(ConnectionError::UnsupportedApiKey(header.api_key));
            }
        };

        // Auth gate: pre-authentication, only exempt keys may proceed. The
        // peer may just not have authenticated yet, so this is recoverable.
        if !self.sasl.permits(descriptor.exempt_from_auth) {
            debug!(api = descriptor.name, "rejected: authentication required");
            return self
                .respond_now(encode_error_response(
                    header.correlation_id,
                    ErrorCode::SaslAuthenticationFailed,
                ))
                .await;
        }

        if !descriptor.supports_version(header.api_version) {
            warn!(
                api = descriptor.name,
                version = header.api_version,
                min = descriptor.min_version,
                max = descriptor.max_version,
                "unsupported API version"
            );
            return self
                .respond_now(encode_error_response(
                    header.correlation_id,
                    ErrorCode::UnsupportedVersion,
                ))
                .await;
        }

        if descriptor.handshake {
            return self.process_handshake(&header, frame).await;
        }

        let principal = self.sasl.principal();
        match self
            .admission
            .admit(
                &descriptor,
                principal.as_ref(),
                self.client_id.as_deref(),
                request_bytes,
            )
            .await
        {
            Admission::Rejected { error } => {
                return self
                    .respond_now(encode_error_response(header.correlation_id, error))
                    .await;
            }
            Admission::Granted { throttle } => {
                if !throttle.is_zero() {
                    // Applied to the *next* frame only; this request runs now.
                    debug!(?throttle, "quota throttles next admission");
                    self.throttle = Some(Instant::now() + throttle);
                }
            }
        }

        let seq = self.sequencer.reserve();
        let correlation_id = header.correlation_id;
        let handler = descriptor.handler.clone();
        let completions = self.completions.clone();
        let ctx = RequestContext {
            header,
            payload: frame,
            principal,
        };

        tokio::spawn(async move {
            let outcome = match handler.handle(ctx).await {
                Ok(payload) => Ok(encode_response(correlation_id, &payload)),
                Err(HandlerError::Request(code)) => {
                    Ok(encode_error_response(correlation_id, code))
                }
                Err(HandlerError::Fatal(reason)) => Err(reason),
            };
            // The connection may be gone; its responses are discarded.
            let _ = completions.send((seq, outcome));
        });

        Ok(())
    }

    /// Service SaslHandshake/SaslAuthenticate inline: they mutate the
    /// session, and the session belongs to this loop. Responses are
    /// sequenced like any other.
    async fn process_handshake(
        &mut self,
        header: &RequestHeader,
        mut payload: BytesMut,
    ) -> ConnResult<()> {
        let response = if header.api_key == ApiKey::SaslHandshake.as_i16() {
            match parse_string(&mut payload) {
                Ok(mechanism) => {
                    let code = self.sasl.handle_handshake(&mechanism);
                    debug!(%mechanism, ?code, "sasl handshake");
                    sasl::encode_handshake_response(
                        header.correlation_id,
                        code,
                        self.sasl.mechanisms(),
                    )
                }
                Err(_) => encode_error_response(header.correlation_id, ErrorCode::InvalidRequest),
            }
        } else {
            match parse_bytes(&mut payload) {
                Ok(token) => {
                    let backend = self.state.auth.clone();
                    let outcome = self.sasl.handle_authenticate(backend.as_ref(), &token).await;
                    debug!(code = ?outcome.code, "sasl authenticate");
                    sasl::encode_authenticate_response(
                        header.correlation_id,
                        header.api_version,
                        &outcome,
                    )
                }
                Err(_) => encode_error_response(header.correlation_id, ErrorCode::InvalidRequest),
            }
        };

        self.respond_now(response).await?;

        if self.sasl.is_failed() {
            return Err(ConnectionError::AuthenticationFailed(
                "SASL session failed".to_string(),
            ));
        }
        Ok(())
    }

    /// Sequence a response that is complete right now (engine-generated
    /// errors, handshake replies) and flush anything that became ready.
    async fn respond_now(&mut self, response: BytesMut) -> ConnResult<()> {
        let seq = self.sequencer.reserve();
        self.sequencer.complete(seq, response);
        self.flush_ready().await
    }

    /// Write every response whose turn has come. One completion can unblock
    /// several buffered successors.
    async fn flush_ready(&mut self) -> ConnResult<()> {
        while let Some(response) = self.sequencer.pop_ready() {
            self.framed.send(response).await?;
        }
        Ok(())
    }
}

/// Read the next frame, honoring any quota-imposed admission deadline first.
///
/// Cancel-safe: the deadline is only cleared once the sleep has elapsed, and
/// `Framed` keeps partially buffered frames across polls.
async fn next_frame<S>(
    framed: &mut Framed<S, FrameCodec>,
    throttle: &mut Option<Instant>,
) -> Option<ConnResult<BytesMut>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(deadline) = *throttle {
        tokio::time::sleep_until(deadline).await;
        *throttle = None;
    }
    framed.next().await
}
