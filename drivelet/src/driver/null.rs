//! A driver with no hypervisor behind it.
//!
//! Tracks lifecycle state and snapshot tags in memory, echoes bytes on its
//! guest agent connection and prints a banner on its serial console. Used
//! by the bundled `drivelet-driver-null` executable and by tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::driver::{Driver, DriverError, DriverFeatures, DriverInfo};
use crate::net::{Conn, ConnAddr, IoConn};

pub const NULL_DRIVER_NAME: &str = "null";

/// Printed on the serial console, followed by end-of-stream.
pub const CONSOLE_BANNER: &str = "drivelet null console ready\n";

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct NullState {
    running: bool,
    paused: bool,
    snapshots: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct NullDriver {
    state: StdMutex<NullState>,
}

impl NullDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }
}

fn require_tag(tag: &str) -> Result<(), DriverError> {
    if tag.is_empty() {
        return Err(DriverError::failed("snapshot tag must not be empty"));
    }
    Ok(())
}

fn guest_addr() -> ConnAddr {
    ConnAddr::new("memory", "null-guest")
}

#[async_trait]
impl Driver for NullDriver {
    async fn info(&self) -> Result<DriverInfo, DriverError> {
        Ok(DriverInfo {
            name: NULL_DRIVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: DriverFeatures {
                snapshots: true,
                pause: true,
                guest_agent: true,
                serial_console: true,
            },
        })
    }

    async fn start(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.running = true;
        state.paused = false;
        tracing::info!("Null VM started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.running = false;
        state.paused = false;
        tracing::info!("Null VM stopped");
        Ok(())
    }

    async fn pause(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.running {
            return Err(DriverError::NotRunning);
        }
        state.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.running {
            return Err(DriverError::NotRunning);
        }
        state.paused = false;
        Ok(())
    }

    async fn create_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        require_tag(tag)?;
        if !self.state().snapshots.insert(tag.to_string()) {
            return Err(DriverError::failed(format!("snapshot {tag} already exists")));
        }
        Ok(())
    }

    async fn apply_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        require_tag(tag)?;
        if !self.state().snapshots.contains(tag) {
            return Err(DriverError::failed(format!("snapshot {tag} not found")));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        require_tag(tag)?;
        if !self.state().snapshots.remove(tag) {
            return Err(DriverError::failed(format!("snapshot {tag} not found")));
        }
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state().snapshots.iter().cloned().collect())
    }

    async fn guest_agent_conn(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        if !self.is_running() {
            return Err(DriverError::NotRunning);
        }
        let (host, guest) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(guest);
            match tokio::io::copy(&mut r, &mut w).await {
                Ok(bytes) => tracing::debug!(bytes, "Guest echo finished"),
                Err(e) => tracing::debug!(error = %e, "Guest echo failed"),
            }
            let _ = w.shutdown().await;
        });
        Ok(Some(Arc::new(IoConn::with_addrs(
            host,
            ConnAddr::new("memory", "null-host"),
            guest_addr(),
        ))))
    }

    async fn serial_console(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        let (host, mut console) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = console.write_all(CONSOLE_BANNER.as_bytes()).await {
                tracing::debug!(error = %e, "Console banner not delivered");
            }
            let _ = console.shutdown().await;
        });
        Ok(Some(Arc::new(IoConn::new(host))))
    }
}
