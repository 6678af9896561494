//! Driver contract shared by in-process and external drivers.
//!
//! A driver owns one VM's hypervisor backend. The orchestrator only talks
//! to [`Driver`]; whether the implementation lives in this process or in a
//! child process behind [`DriverClient`] is invisible to it.

pub mod client;
pub mod external;
pub mod null;
pub mod server;
pub mod service;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::net::Conn;
use crate::rpc::{RpcError, RpcStatus, StatusCode};

pub use client::DriverClient;
pub use external::{ExternalDriver, ExternalDriverConfig};
pub use null::NullDriver;
pub use service::DriverService;

/// RPC method names of the driver service.
pub mod methods {
    pub const INFO: &str = "info";
    pub const VALIDATE: &str = "validate";
    pub const CREATE: &str = "create";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const CREATE_SNAPSHOT: &str = "create_snapshot";
    pub const APPLY_SNAPSHOT: &str = "apply_snapshot";
    pub const DELETE_SNAPSHOT: &str = "delete_snapshot";
    pub const LIST_SNAPSHOTS: &str = "list_snapshots";

    /// Full-duplex tunnel to the guest agent.
    pub const GUEST_AGENT_CONN: &str = "guest_agent_conn";
    /// Driver to host only.
    pub const SERIAL_CONSOLE: &str = "serial_console";
}

/// Optional capabilities a driver advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverFeatures {
    #[serde(default)]
    pub snapshots: bool,
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub guest_agent: bool,
    #[serde(default)]
    pub serial_console: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub features: DriverFeatures,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotList {
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("{operation} is not implemented by this driver")]
    Unimplemented { operation: String },

    #[error("driver is not running")]
    NotRunning,

    #[error("{0}")]
    Failed(String),

    /// Error status returned by an external driver.
    #[error("driver returned error: {0}")]
    Remote(RpcStatus),

    /// The connection to an external driver failed.
    #[error("driver transport failed: {0}")]
    Transport(RpcError),
}

impl DriverError {
    pub fn unimplemented(operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            operation: operation.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_unimplemented(&self) -> bool {
        match self {
            Self::Unimplemented { .. } => true,
            Self::Remote(status) => status.code == StatusCode::Unimplemented,
            _ => false,
        }
    }

    /// Status reported to RPC clients for this error.
    pub fn status(&self) -> RpcStatus {
        match self {
            Self::Unimplemented { .. } => RpcStatus::new(StatusCode::Unimplemented, self.to_string()),
            Self::NotRunning => RpcStatus::new(StatusCode::FailedPrecondition, self.to_string()),
            Self::Failed(message) => RpcStatus::new(StatusCode::Unknown, message.clone()),
            Self::Remote(status) => status.clone(),
            Self::Transport(e) => e.status(),
        }
    }
}

impl From<RpcError> for DriverError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Status(status) => Self::Remote(status),
            other => Self::Transport(other),
        }
    }
}

impl From<DriverError> for RpcStatus {
    fn from(e: DriverError) -> Self {
        e.status()
    }
}

/// VM backend operations.
///
/// Optional operations default to `Unimplemented`; connection getters
/// default to `None` (no such channel).
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn info(&self) -> Result<DriverInfo, DriverError>;

    /// Checks that the driver can run on this host.
    async fn validate(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Prepares instance state. Must succeed on an already created instance.
    async fn create(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), DriverError>;

    async fn stop(&self) -> Result<(), DriverError>;

    async fn pause(&self) -> Result<(), DriverError> {
        Err(DriverError::unimplemented(methods::PAUSE))
    }

    async fn resume(&self) -> Result<(), DriverError> {
        Err(DriverError::unimplemented(methods::RESUME))
    }

    async fn create_snapshot(&self, _tag: &str) -> Result<(), DriverError> {
        Err(DriverError::unimplemented(methods::CREATE_SNAPSHOT))
    }

    async fn apply_snapshot(&self, _tag: &str) -> Result<(), DriverError> {
        Err(DriverError::unimplemented(methods::APPLY_SNAPSHOT))
    }

    async fn delete_snapshot(&self, _tag: &str) -> Result<(), DriverError> {
        Err(DriverError::unimplemented(methods::DELETE_SNAPSHOT))
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, DriverError> {
        Err(DriverError::unimplemented(methods::LIST_SNAPSHOTS))
    }

    /// Raw connection to the guest agent, if the driver provides one.
    async fn guest_agent_conn(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        Ok(None)
    }

    /// Serial console output, if the driver provides it.
    async fn serial_console(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let status = DriverError::unimplemented("pause").status();
        assert_eq!(status.code, StatusCode::Unimplemented);
        assert_eq!(status.message, "pause is not implemented by this driver");

        assert_eq!(
            DriverError::NotRunning.status().code,
            StatusCode::FailedPrecondition
        );
        assert_eq!(
            DriverError::Transport(RpcError::unavailable("gone")).status().code,
            StatusCode::Unavailable
        );
    }

    #[test]
    fn remote_unimplemented_is_recognized() {
        let err = DriverError::from(RpcError::Status(RpcStatus::unimplemented("pause")));
        assert!(matches!(err, DriverError::Remote(_)));
        assert!(err.is_unimplemented());
        assert!(!DriverError::from(RpcError::unavailable("gone")).is_unimplemented());
    }

    #[test]
    fn info_tolerates_missing_features() {
        let info: DriverInfo =
            serde_json::from_value(serde_json::json!({"name": "qemu", "version": "1.0"})).unwrap();
        assert_eq!(info.features, DriverFeatures::default());
    }
}
