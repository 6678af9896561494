//! RPC-layer errors.

use std::io;

use crate::error::TransportError;
use crate::rpc::protocol::{RpcStatus, StatusCode};

/// Errors surfaced by RPC calls and streams.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The peer answered with an error status.
    #[error(transparent)]
    Status(#[from] RpcStatus),

    /// The session is gone (peer closed, stopped, keepalive expired).
    #[error("connection unavailable: {0}")]
    Unavailable(String),

    /// The peer sent something that violates the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl RpcError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Status to report to a remote peer for this error.
    pub fn status(&self) -> RpcStatus {
        match self {
            Self::Status(status) => status.clone(),
            Self::Unavailable(reason) => RpcStatus::new(StatusCode::Unavailable, reason.clone()),
            Self::Protocol(message) | Self::Codec(message) => {
                RpcStatus::new(StatusCode::Internal, message.clone())
            }
        }
    }

    pub fn code(&self) -> StatusCode {
        match self {
            Self::Status(status) => status.code,
            Self::Unavailable(_) => StatusCode::Unavailable,
            Self::Protocol(_) | Self::Codec(_) => StatusCode::Internal,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_passes_through() {
        let err = RpcError::from(RpcStatus::unimplemented("pause"));
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert_eq!(err.to_string(), "unimplemented: method pause is not implemented");
        assert_eq!(err.status(), RpcStatus::unimplemented("pause"));
    }

    #[test]
    fn transport_errors_become_unavailable() {
        let err = RpcError::from(TransportError::Closed);
        assert_eq!(err.code(), StatusCode::Unavailable);
        assert_eq!(err.to_string(), "connection unavailable: connection closed");
    }

    #[test]
    fn local_failures_map_to_internal() {
        assert_eq!(RpcError::protocol("bad id").code(), StatusCode::Internal);
        let err = RpcError::from(io::Error::new(io::ErrorKind::InvalidData, "frame too big"));
        assert_eq!(err.status().code, StatusCode::Internal);
    }
}
