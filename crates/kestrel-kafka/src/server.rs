//! TCP accept shell and the shared per-process state handed to connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::admission::{Authorizer, QuotaGate};
use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::connection::handle_connection;
use crate::dispatch::DispatchTable;
use crate::error::ConnResult;
use crate::sasl::AuthBackend;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum accepted request frame size in bytes
    pub max_frame_size: usize,
    /// Whether connections must complete a SASL handshake before issuing
    /// non-exempt requests
    pub sasl_enabled: bool,
    /// Mechanisms offered in SaslHandshake responses
    pub sasl_mechanisms: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9092".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            sasl_enabled: false,
            sasl_mechanisms: vec!["PLAIN".to_string()],
        }
    }
}

/// Shared state for all connections: the read-only dispatch table and the
/// backend service ports. One instance per process, shared by `Arc`.
pub struct ServerState {
    pub config: ServerConfig,
    pub dispatch: Arc<DispatchTable>,
    pub authorizer: Arc<dyn Authorizer>,
    pub quota: Arc<dyn QuotaGate>,
    pub auth: Arc<dyn AuthBackend>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        dispatch: Arc<DispatchTable>,
        authorizer: Arc<dyn Authorizer>,
        quota: Arc<dyn QuotaGate>,
        auth: Arc<dyn AuthBackend>,
    ) -> Self {
        Self {
            config,
            dispatch,
            authorizer,
            quota,
            auth,
        }
    }
}

/// Protocol server front end.
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Bind the configured listener.
    pub async fn bind(self) -> ConnResult<BoundServer> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {}", local_addr);

        Ok(BoundServer {
            listener,
            state: self.state,
        })
    }

    /// Run the server until the shutdown signal is received.
    pub async fn run_until(self, shutdown: tokio::sync::oneshot::Receiver<()>) -> ConnResult<()> {
        let bound = self.bind().await?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = bound.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => spawn_connection(stream, addr, bound.state.clone()),
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Server bound to a port.
pub struct BoundServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl BoundServer {
    /// Accept connections forever.
    pub async fn run(self) -> ConnResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => spawn_connection(stream, addr, self.state.clone()),
                Err(e) => error!("failed to accept connection: {}", e),
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> ConnResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

fn spawn_connection(stream: tokio::net::TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    tokio::spawn(async move {
        match handle_connection(stream, addr, state).await {
            Ok(()) => debug!("connection closed: {}", addr),
            Err(e) => warn!("connection error from {}: {}", addr, e),
        }
    });
}
