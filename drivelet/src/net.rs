//! Connection abstractions.
//!
//! Every byte channel in drivelet (the driver's stdio pipe, a tunneled RPC
//! stream, a real local socket) is exposed as a [`Conn`]. Reads and writes
//! take `&self` so one task can read while another writes, which is what
//! [`bicopy`](crate::bicopy::bicopy) needs.
//!
//! None of the transports here can honor deadlines. The deadline setters
//! accept any value and do nothing; callers that need bounded waits wrap
//! operations in `tokio::time::timeout` themselves.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Address of a connection endpoint.
///
/// Pipes and tunnels have no real endpoint and report fixed synthetic values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnAddr {
    network: Cow<'static, str>,
    address: Cow<'static, str>,
}

impl ConnAddr {
    pub const PIPE: ConnAddr = ConnAddr {
        network: Cow::Borrowed("pipe"),
        address: Cow::Borrowed("pipe"),
    };

    pub const RPC_STREAM: ConnAddr = ConnAddr {
        network: Cow::Borrowed("rpc"),
        address: Cow::Borrowed("rpc-stream"),
    };

    pub const UNKNOWN: ConnAddr = ConnAddr {
        network: Cow::Borrowed("unknown"),
        address: Cow::Borrowed("unknown"),
    };

    pub fn new(network: impl Into<Cow<'static, str>>, address: impl Into<Cow<'static, str>>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Which half-close operations a connection supports.
///
/// Queried once by consumers such as `bicopy` before they start, never per
/// operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HalfCloseSupport {
    pub read: bool,
    pub write: bool,
}

impl HalfCloseSupport {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };

    pub const BOTH: Self = Self {
        read: true,
        write: true,
    };

    pub const WRITE_ONLY: Self = Self {
        read: false,
        write: true,
    };
}

/// A long-lived, full-duplex byte channel.
///
/// `read` returning `Ok(0)` means end-of-stream.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn local_addr(&self) -> ConnAddr;

    fn remote_addr(&self) -> ConnAddr;

    fn set_deadline(&self, _deadline: Option<Instant>) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), TransportError> {
        Ok(())
    }

    fn half_close_support(&self) -> HalfCloseSupport {
        HalfCloseSupport::NONE
    }

    /// Stop reading; later reads return end-of-stream.
    async fn close_read(&self) -> Result<(), TransportError> {
        Err(TransportError::unsupported("close_read"))
    }

    /// Signal end-of-stream to the peer while keeping the read side open.
    async fn close_write(&self) -> Result<(), TransportError> {
        Err(TransportError::unsupported("close_write"))
    }

    async fn write_all(&self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Source of connections for an RPC server.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn accept(&self) -> Result<Arc<dyn Conn>, TransportError>;

    fn close(&self) -> Result<(), TransportError>;

    fn addr(&self) -> ConnAddr;
}

/// [`Conn`] over any tokio I/O object: TCP and Unix sockets, in-memory
/// duplex pipes.
///
/// Supports both half-close directions. `close` releases blocked readers and
/// writers and shuts down the write side.
pub struct IoConn<T> {
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
    closed: CancellationToken,
    read_closed: CancellationToken,
    local: ConnAddr,
    remote: ConnAddr,
}

impl<T> IoConn<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        Self::with_addrs(io, ConnAddr::UNKNOWN, ConnAddr::UNKNOWN)
    }

    pub fn with_addrs(io: T, local: ConnAddr, remote: ConnAddr) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let closed = CancellationToken::new();
        let read_closed = closed.child_token();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed,
            read_closed,
            local,
            remote,
        }
    }
}

impl IoConn<tokio::net::TcpStream> {
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let local = stream
            .local_addr()
            .map(|a| ConnAddr::new("tcp", a.to_string()))
            .unwrap_or(ConnAddr::UNKNOWN);
        let remote = stream
            .peer_addr()
            .map(|a| ConnAddr::new("tcp", a.to_string()))
            .unwrap_or(ConnAddr::UNKNOWN);
        Self::with_addrs(stream, local, remote)
    }
}

#[cfg(unix)]
impl IoConn<tokio::net::UnixStream> {
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        fn unix_addr(addr: std::io::Result<tokio::net::unix::SocketAddr>) -> ConnAddr {
            match addr.ok().and_then(|a| a.as_pathname().map(|p| p.display().to_string())) {
                Some(path) => ConnAddr::new("unix", path),
                None => ConnAddr::new("unix", "@"),
            }
        }
        let local = unix_addr(stream.local_addr());
        let remote = unix_addr(stream.peer_addr());
        Self::with_addrs(stream, local, remote)
    }
}

#[async_trait]
impl<T> Conn for IoConn<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.read_closed.is_cancelled() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.read_closed.cancelled() => Ok(0),
            r = reader.read(buf) => Ok(r?),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            r = async {
                let n = writer.write(buf).await?;
                writer.flush().await?;
                Ok::<_, std::io::Error>(n)
            } => Ok(r?),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(error = %e, "shutdown on close failed");
        }
        Ok(())
    }

    fn local_addr(&self) -> ConnAddr {
        self.local.clone()
    }

    fn remote_addr(&self) -> ConnAddr {
        self.remote.clone()
    }

    fn half_close_support(&self) -> HalfCloseSupport {
        HalfCloseSupport::BOTH
    }

    async fn close_read(&self) -> Result<(), TransportError> {
        self.read_closed.cancel();
        Ok(())
    }

    async fn close_write(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
