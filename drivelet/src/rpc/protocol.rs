//! Wire protocol types for orchestrator-driver communication.
//!
//! Every frame is one JSON object tagged by `type`. Unary calls are a
//! `call` answered by one `reply`. Streaming calls start with `open`, carry
//! `data` frames both ways, and end with `eof` (clean half-close) or `reset`
//! (abort with a status). A receiver hands out `window` credits as it
//! consumes `data`; each `data` frame costs the sender one credit. `ping`/`pong`/`go_away` belong to the session, not
//! to any call.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Identifier of a call within one session. Allocated by the client.
pub type CallId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
    ResourceExhausted,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error status carried across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(
            StatusCode::Unimplemented,
            format!("method {method} is not implemented"),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Unary request.
    Call {
        id: CallId,
        method: String,
        #[serde(default)]
        body: serde_json::Value,
    },

    /// Unary response. Exactly one of `body`/`error` is meaningful; a missing
    /// body on success means `null`.
    Reply {
        id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcStatus>,
    },

    /// Start of a streaming call.
    Open { id: CallId, method: String },

    /// One opaque stream message.
    Data {
        id: CallId,
        #[serde(with = "payload")]
        data: Bytes,
    },

    /// Sender is done sending on this stream.
    Eof { id: CallId },

    /// Stream aborted.
    Reset { id: CallId, status: RpcStatus },

    /// Receiver consumed `credits` more `data` frames on this stream.
    Window { id: CallId, credits: u32 },

    Ping { nonce: u64 },

    Pong { nonce: u64 },

    /// Peer is closing the session; no further frames will be processed.
    GoAway { reason: String },
}

impl Frame {
    pub fn reply(id: CallId, result: Result<serde_json::Value, RpcStatus>) -> Self {
        match result {
            Ok(body) => Self::Reply {
                id,
                body: Some(body),
                error: None,
            },
            Err(status) => Self::Reply {
                id,
                body: None,
                error: Some(status),
            },
        }
    }

    /// Name used in logs. Never includes payload contents.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Reply { .. } => "reply",
            Self::Open { .. } => "open",
            Self::Data { .. } => "data",
            Self::Eof { .. } => "eof",
            Self::Reset { .. } => "reset",
            Self::Window { .. } => "window",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::GoAway { .. } => "go_away",
        }
    }
}

/// Stream payloads travel as base64 strings inside the JSON frame.
mod payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio_util::bytes::Bytes;

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
