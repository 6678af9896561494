//! Connection-level errors shared by pipes, tunnels and local sockets.

use std::io;
use std::sync::Arc;

use crate::rpc::RpcError;

/// Errors returned by [`Conn`](crate::net::Conn) and
/// [`Listener`](crate::net::Listener) implementations.
///
/// Cloneable so that a once-only `close` can hand the same outcome to every
/// concurrent caller. Variants carry the operation and the stream they came
/// from, never payload bytes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Operation attempted after the connection (or listener) was closed.
    #[error("connection closed")]
    Closed,

    /// Non-EOF failure receiving a message from a tunneled stream.
    /// Terminal for the connection.
    #[error("receive on stream {stream} failed: {source}")]
    StreamReceive {
        stream: Arc<str>,
        #[source]
        source: RpcError,
    },

    /// Failure sending a message on a tunneled stream. Terminal for the
    /// connection.
    #[error("send on stream {stream} failed: {source}")]
    StreamSend {
        stream: Arc<str>,
        #[source]
        source: RpcError,
    },

    #[error("{operation} is not supported by this connection")]
    Unsupported { operation: &'static str },

    /// A state that should be unreachable was observed.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl TransportError {
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        let kind = match &e {
            TransportError::Closed => io::ErrorKind::NotConnected,
            TransportError::Unsupported { .. } => io::ErrorKind::Unsupported,
            TransportError::StreamReceive { .. } | TransportError::StreamSend { .. } => {
                io::ErrorKind::ConnectionAborted
            }
            TransportError::Io(inner) => inner.kind(),
            TransportError::Invariant(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_keeps_kind() {
        let err: io::Error = TransportError::Closed.into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let err: io::Error = TransportError::unsupported("write").into();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        let err: io::Error =
            TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe)).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn stream_errors_name_the_stream() {
        let err = TransportError::StreamReceive {
            stream: Arc::from("guest_agent_conn"),
            source: RpcError::Unavailable("connection closed by peer".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "receive on stream guest_agent_conn failed: connection unavailable: connection closed by peer"
        );
    }
}
