//! Pipe transport: a fixed read/write pipe pair exposed as a single
//! connection.
//!
//! The pipe has exactly one peer (the parent process on the driver side, the
//! child on the orchestrator side), so [`PipeListener`] hands out its one
//! connection and then never accepts again.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::net::{Conn, ConnAddr, Listener};

type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection over a read endpoint and a write endpoint.
///
/// `close` is a no-op: the pipe belongs to the process, not to this object.
/// Dropping the last reference drops the endpoints.
pub struct PipeConn {
    reader: Mutex<PipeReader>,
    writer: Mutex<PipeWriter>,
}

impl PipeConn {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// The current process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl Conn for PipeConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut reader = self.reader.lock().await;
        Ok(reader.read(buf).await?)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self.writer.lock().await;
        let n = writer.write(buf).await?;
        writer.flush().await?;
        Ok(n)
    }

    async fn close(&self) -> Result<(), TransportError> {
        tracing::trace!("close on pipe connection ignored");
        Ok(())
    }

    fn local_addr(&self) -> ConnAddr {
        ConnAddr::PIPE
    }

    fn remote_addr(&self) -> ConnAddr {
        ConnAddr::PIPE
    }
}

/// Listener over exactly one pre-established connection.
///
/// The first `accept` returns the connection. Every later `accept` parks
/// forever: there is no second peer, and generic accept loops must not treat
/// the silence as a failure. `close` only flips a flag; it never interrupts
/// a parked `accept`.
pub struct PipeListener {
    conn: StdMutex<Option<Arc<dyn Conn>>>,
    closed: AtomicBool,
}

impl PipeListener {
    pub fn new(conn: Arc<dyn Conn>) -> Self {
        Self {
            conn: StdMutex::new(Some(conn)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Listener for PipeListener {
    async fn accept(&self) -> Result<Arc<dyn Conn>, TransportError> {
        {
            let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                if let Some(conn) = slot.take() {
                    tracing::debug!("Pipe listener handed out its connection");
                    return Ok(conn);
                }
            }
        }

        tracing::trace!("Pipe listener has no further connections, parking accept");
        let parked: Infallible = std::future::pending().await;
        match parked {}
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn addr(&self) -> ConnAddr {
        ConnAddr::PIPE
    }
}
