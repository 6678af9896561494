//! External drivers: driver executables run as child processes.
//!
//! Flow:
//! 1. Spawn the executable with piped stdin/stdout/stderr
//! 2. Forward each stderr line into our log, tagged with the driver name
//! 3. Run an RPC client over the child's stdout/stdin
//! 4. Confirm readiness with an `info` call within the startup timeout
//! 5. On stop: end the session, SIGTERM, wait out the grace period, kill

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use crate::driver::{Driver, DriverClient, DriverError, DriverInfo};
use crate::hijack::HijackConfig;
use crate::net::Conn;
use crate::rpc::{KeepaliveConfig, RpcClient};
use crate::transport::PipeConn;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),

    #[error("driver process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("driver {name} did not answer within {timeout:?}")]
    StartupTimeout { name: String, timeout: Duration },

    #[error("driver {name} failed its startup handshake: {source}")]
    Handshake {
        name: String,
        #[source]
        source: DriverError,
    },
}

/// Extension point for how driver processes are launched.
pub trait DriverSpawner: Send + Sync {
    /// Spawns the driver at `path`. The child must have piped stdin and
    /// stdout; a piped stderr is forwarded to the log.
    fn spawn(&self, path: &Path) -> Result<Child, SpawnError>;
}

/// Runs the executable directly, with no arguments.
pub struct CommandSpawner;

impl DriverSpawner for CommandSpawner {
    fn spawn(&self, path: &Path) -> Result<Child, SpawnError> {
        let child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Clone)]
pub struct ExternalDriverConfig {
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub keepalive: KeepaliveConfig,
    pub hijack: HijackConfig,
    pub spawner: Arc<dyn DriverSpawner>,
}

impl Default for ExternalDriverConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            keepalive: KeepaliveConfig::driver_client(),
            hijack: HijackConfig::default(),
            spawner: Arc::new(CommandSpawner),
        }
    }
}

impl ExternalDriverConfig {
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn DriverSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// A running driver process.
///
/// The process is killed if this value is dropped without [`stop`](Self::stop).
pub struct ExternalDriver {
    name: String,
    path: PathBuf,
    info: DriverInfo,
    client: DriverClient,
    child: Mutex<Child>,
    pid: Option<u32>,
    stop_grace: Duration,
}

impl ExternalDriver {
    pub async fn start(
        name: &str,
        path: impl AsRef<Path>,
        config: ExternalDriverConfig,
    ) -> Result<Self, SpawnError> {
        let path = path.as_ref();
        tracing::info!(driver = name, path = %path.display(), "Starting external driver");

        let mut child = config.spawner.spawn(path)?;
        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            (None, _) => return Err(abandon(child, SpawnError::MissingPipe("stdin")).await),
            (_, None) => return Err(abandon(child, SpawnError::MissingPipe("stdout")).await),
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }

        let conn: Arc<dyn Conn> = Arc::new(PipeConn::new(stdout, stdin));
        let client = DriverClient::new(RpcClient::new(conn, config.keepalive)).with_hijack(config.hijack);

        let info = match tokio::time::timeout(config.startup_timeout, client.info()).await {
            Ok(Ok(info)) => info,
            Ok(Err(source)) => {
                let err = SpawnError::Handshake {
                    name: name.to_string(),
                    source,
                };
                return Err(abandon(child, err).await);
            }
            Err(_) => {
                let err = SpawnError::StartupTimeout {
                    name: name.to_string(),
                    timeout: config.startup_timeout,
                };
                return Err(abandon(child, err).await);
            }
        };

        tracing::info!(
            driver = name,
            pid = ?pid,
            reported_name = %info.name,
            version = %info.version,
            "External driver started"
        );
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            info,
            client,
            child: Mutex::new(child),
            pid,
            stop_grace: config.stop_grace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Info reported during the startup handshake.
    pub fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    pub fn client(&self) -> &DriverClient {
        &self.client
    }

    /// Whether the RPC session to the process is still up.
    pub fn is_connected(&self) -> bool {
        !self.client.rpc().is_closed()
    }

    /// Ends the session and terminates the process, escalating to a kill
    /// after the grace period.
    pub async fn stop(&self) -> io::Result<ExitStatus> {
        self.client.rpc().close().await;

        let mut child = self.child.lock().await;
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if let Some(pid) = self.pid {
            match terminate(pid) {
                Ok(()) => tracing::debug!(driver = %self.name, pid, "Sent SIGTERM"),
                Err(e) => tracing::debug!(driver = %self.name, pid, error = %e, "SIGTERM failed"),
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(driver = %self.name, %status, "External driver exited");
                Ok(status)
            }
            Err(_) => {
                tracing::warn!(
                    driver = %self.name,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "External driver ignored SIGTERM, killing"
                );
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

async fn abandon(mut child: Child, err: SpawnError) -> SpawnError {
    tracing::error!(error = %err, "External driver failed to start");
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Killing failed driver process");
    }
    err
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(driver = %name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(driver = %name, error = %e, "Driver stderr read failed");
                break;
            }
        }
    }
    tracing::debug!(driver = %name, "Driver stderr closed");
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}

#[async_trait]
impl Driver for ExternalDriver {
    async fn info(&self) -> Result<DriverInfo, DriverError> {
        self.client.info().await
    }

    async fn validate(&self) -> Result<(), DriverError> {
        self.client.validate().await
    }

    async fn create(&self) -> Result<(), DriverError> {
        self.client.create().await
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.client.start().await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        Driver::stop(&self.client).await
    }

    async fn pause(&self) -> Result<(), DriverError> {
        self.client.pause().await
    }

    async fn resume(&self) -> Result<(), DriverError> {
        self.client.resume().await
    }

    async fn create_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        self.client.create_snapshot(tag).await
    }

    async fn apply_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        self.client.apply_snapshot(tag).await
    }

    async fn delete_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        self.client.delete_snapshot(tag).await
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, DriverError> {
        self.client.list_snapshots().await
    }

    async fn guest_agent_conn(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        self.client.guest_agent_conn().await
    }

    async fn serial_console(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        self.client.serial_console().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ExternalDriverConfig::default();
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.keepalive, KeepaliveConfig::driver_client());
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let err = ExternalDriver::start(
            "ghost",
            "/nonexistent/drivelet-driver-ghost",
            ExternalDriverConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_process_times_out() {
        struct Sleeper;
        impl DriverSpawner for Sleeper {
            fn spawn(&self, _path: &Path) -> Result<Child, SpawnError> {
                Ok(Command::new("sleep")
                    .arg("30")
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?)
            }
        }

        let config = ExternalDriverConfig::default()
            .with_startup_timeout(Duration::from_millis(200))
            .with_spawner(Arc::new(Sleeper));
        let err = ExternalDriver::start("sleepy", "sleep", config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::StartupTimeout { .. }), "{err}");
    }
}
