//! Driver-process side: serve a [`Driver`] over the process's stdio.
//!
//! Flow:
//! 1. Install SIGINT/SIGTERM handlers
//! 2. Serve the driver service on a pipe listener over stdin/stdout
//! 3. On a signal: stop the server (in-flight calls are aborted) and
//!    return `Ok`, so the process exits 0
//! 4. Any other end of serving is fatal

use std::sync::Arc;

use crate::driver::{Driver, DriverService};
use crate::hijack::HijackConfig;
use crate::net::Listener;
use crate::rpc::{KeepaliveConfig, RpcError, RpcServer};
use crate::transport::{PipeConn, PipeListener};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Serving stopped for a reason other than a shutdown signal.
    #[error("driver server failed: {0}")]
    Fatal(#[source] RpcError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct DriverServerConfig {
    pub keepalive: KeepaliveConfig,
    pub hijack: HijackConfig,
}

impl Default for DriverServerConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::driver_server(),
            hijack: HijackConfig::default(),
        }
    }
}

/// Serves `driver` on `listener` until SIGINT/SIGTERM.
pub async fn serve(
    driver: Arc<dyn Driver>,
    listener: Arc<dyn Listener>,
    config: DriverServerConfig,
) -> Result<(), ServeError> {
    let mut signals = ShutdownSignals::install().map_err(ServeError::Signal)?;

    let name = match driver.info().await {
        Ok(info) => info.name,
        Err(e) => {
            tracing::warn!(error = %e, "Driver info unavailable at startup");
            "unknown".to_string()
        }
    };
    let service = DriverService::new(driver).with_hijack(config.hijack);
    let server = RpcServer::new(Arc::new(service)).with_keepalive(config.keepalive);

    tracing::info!(driver = %name, "Driver server ready");

    tokio::select! {
        signal = signals.recv() => {
            tracing::info!(signal, "Received signal, shutting down...");
            server.stop().await;
            tracing::info!("Driver server shutdown complete");
            Ok(())
        }
        served = server.serve(listener.as_ref()) => {
            match served {
                Ok(()) => Err(ServeError::Fatal(RpcError::unavailable("server stopped unexpectedly"))),
                Err(e) => {
                    tracing::error!(error = %e, "Driver server failed");
                    Err(ServeError::Fatal(e))
                }
            }
        }
    }
}

/// Serves `driver` over this process's stdin/stdout with the default
/// driver configuration.
pub async fn serve_stdio(driver: Arc<dyn Driver>) -> Result<(), ServeError> {
    let listener: Arc<dyn Listener> = Arc::new(PipeListener::new(Arc::new(PipeConn::stdio())));
    serve(driver, listener, DriverServerConfig::default()).await
}

/// Terminates the process according to how serving ended.
///
/// Exits explicitly because blocking stdin reads would otherwise hold up
/// runtime shutdown.
pub fn exit_with(result: Result<(), ServeError>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "Driver exiting");
            std::process::exit(1)
        }
    }
}

struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Name of the signal that arrived.
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::warn!(error = %e, "Ctrl+C handler failed");
                std::future::pending::<&'static str>().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::driver::{DriverClient, NullDriver};
    use crate::net::IoConn;

    #[test]
    fn default_config_uses_driver_keepalive() {
        let config = DriverServerConfig::default();
        assert_eq!(config.keepalive, KeepaliveConfig::driver_server());
        assert_eq!(config.hijack, HijackConfig::default());
    }

    const EXIT_MODE_ENV: &str = "DRIVELET_TEST_EXIT_MODE";

    #[tokio::test]
    async fn accept_failure_is_fatal() {
        let (server_io, _client_io) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(server_io);
        let listener = PipeListener::new(Arc::new(PipeConn::new(r, w)));
        listener.close().unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve(
                Arc::new(NullDriver::new()),
                Arc::new(listener),
                DriverServerConfig::default(),
            ),
        )
        .await
        .expect("serve should return once accept fails");
        match result {
            Err(ServeError::Fatal(err)) => {
                assert!(err.to_string().contains("connection closed"), "{err}");
            }
            other => panic!("expected a fatal error, got {other:?}"),
        }
    }

    #[test]
    fn exit_with_maps_result_to_exit_code() {
        if let Ok(mode) = std::env::var(EXIT_MODE_ENV) {
            let result = match mode.as_str() {
                "fatal" => Err(ServeError::Fatal(RpcError::unavailable("listener gone"))),
                _ => Ok(()),
            };
            exit_with(result);
        }

        for (mode, code) in [("fatal", 1), ("clean", 0)] {
            let status = std::process::Command::new(std::env::current_exe().unwrap())
                .args([
                    "--exact",
                    "driver::server::tests::exit_with_maps_result_to_exit_code",
                    "--nocapture",
                ])
                .env(EXIT_MODE_ENV, mode)
                .status()
                .unwrap();
            assert_eq!(status.code(), Some(code), "mode {mode}");
        }
    }

    #[tokio::test]
    async fn serves_until_aborted() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(server_io);
        let listener: Arc<dyn Listener> = Arc::new(PipeListener::new(Arc::new(PipeConn::new(r, w))));
        let serving = tokio::spawn(serve(
            Arc::new(NullDriver::new()),
            listener,
            DriverServerConfig::default(),
        ));

        let client = DriverClient::connect(Arc::new(IoConn::new(client_io)));
        let info = tokio::time::timeout(Duration::from_secs(5), client.info())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.name, "null");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!serving.is_finished());
        serving.abort();
    }
}
