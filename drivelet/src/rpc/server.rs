//! RPC server: accepts connections and serves one [`Service`] on each.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::net::Listener;
use crate::rpc::RpcError;
use crate::rpc::keepalive::KeepaliveConfig;
use crate::rpc::protocol::RpcStatus;
use crate::rpc::session::Session;
use crate::rpc::stream::ServerStream;

/// `go_away` reason sent to clients when the server stops.
pub const SERVER_STOPPING: &str = "server stopping";

/// Handler for the calls of one session.
///
/// Each call and each stream runs in its own task; handlers are dropped
/// (aborted) when the session ends.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Service name, used in logs.
    fn name(&self) -> &str;

    async fn call(&self, method: &str, body: Value) -> Result<Value, RpcStatus>;

    /// Streaming call. Returning `Ok` ends the server's direction cleanly;
    /// returning `Err` resets the stream with that status.
    async fn stream(&self, method: &str, stream: ServerStream) -> Result<(), RpcStatus> {
        drop(stream);
        Err(RpcStatus::unimplemented(method))
    }
}

pub struct RpcServer {
    service: Arc<dyn Service>,
    keepalive: KeepaliveConfig,
    sessions: StdMutex<Vec<Arc<Session>>>,
    stopped: CancellationToken,
}

impl RpcServer {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            keepalive: KeepaliveConfig::default(),
            sessions: StdMutex::new(Vec::new()),
            stopped: CancellationToken::new(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Accepts connections until [`stop`](Self::stop) is called (returns
    /// `Ok`) or the listener fails (returns the error).
    pub async fn serve(&self, listener: &dyn Listener) -> Result<(), RpcError> {
        tracing::info!(
            service = self.service.name(),
            addr = %listener.addr(),
            "RPC server serving"
        );
        loop {
            let accepted = tokio::select! {
                _ = self.stopped.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(_) if self.is_stopped() => break,
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    return Err(e.into());
                }
            };

            tracing::debug!(remote = %conn.remote_addr(), "Connection accepted");
            let session = Session::server(conn, Arc::clone(&self.service), self.keepalive);
            {
                let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
                sessions.retain(|s| !s.is_closed());
                sessions.push(Arc::clone(&session));
            }
            session.start();
            if self.is_stopped() {
                session.shutdown(SERVER_STOPPING);
            }
        }

        if let Err(e) = listener.close() {
            tracing::debug!(error = %e, "Closing listener failed");
        }
        Ok(())
    }

    /// Stops accepting, tells connected clients to go away, and aborts
    /// in-flight calls.
    pub async fn stop(&self) {
        self.stopped.cancel();
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.drain(..).collect()
        };
        tracing::info!(sessions = sessions.len(), "RPC server stopping");
        for session in sessions {
            session.go_away(SERVER_STOPPING).await;
        }
    }
}
