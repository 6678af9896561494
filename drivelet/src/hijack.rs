//! Byte-stream connections over message streams.
//!
//! A streaming RPC call carries discrete messages. [`StreamConn`] turns one
//! into an ordinary [`Conn`]: each `write` becomes one message, and `read`
//! hands out message bytes in order regardless of how they were split.
//! [`ReadOnlyStreamConn`] is the same for streams that only flow toward us
//! (serial consoles); its `write` always fails.
//!
//! Locks: the read lock serializes `read` with the close-time drain; the
//! write lock serializes `write` with the half-close send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::net::{Conn, ConnAddr, HalfCloseSupport};
use crate::rpc::RpcError;

/// Ordered, message-oriented, bidirectional stream.
#[async_trait]
pub trait MessageStream: Send + Sync + 'static {
    async fn send(&self, data: Bytes) -> Result<(), RpcError>;

    /// Next message, `None` at clean end-of-stream. Must be cancel-safe.
    async fn recv(&self) -> Result<Option<Bytes>, RpcError>;

    /// Whether [`close_send`](Self::close_send) is available. Queried once.
    fn supports_close_send(&self) -> bool {
        false
    }

    async fn close_send(&self) -> Result<(), RpcError> {
        Err(RpcError::protocol(format!(
            "stream {} does not support close_send",
            self.name()
        )))
    }

    /// Name used in errors and logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: MessageStream> MessageStream for Arc<T> {
    async fn send(&self, data: Bytes) -> Result<(), RpcError> {
        (**self).send(data).await
    }

    async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        (**self).recv().await
    }

    fn supports_close_send(&self) -> bool {
        (**self).supports_close_send()
    }

    async fn close_send(&self) -> Result<(), RpcError> {
        (**self).close_send().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Bounds on the close-time drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HijackConfig {
    pub drain_timeout: Duration,
    pub max_drain_messages: usize,
}

impl Default for HijackConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            max_drain_messages: 1024,
        }
    }
}

impl HijackConfig {
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_max_drain_messages(mut self, max: usize) -> Self {
        self.max_drain_messages = max;
        self
    }
}

#[derive(Default)]
struct ReadState {
    /// Bytes of the last message not yet handed to a reader.
    pending: BytesMut,
    eof: bool,
}

struct Core<S> {
    stream: S,
    name: Arc<str>,
    config: HijackConfig,
    read: Mutex<ReadState>,
    write: Mutex<()>,
    closed: AtomicBool,
    write_shut: AtomicBool,
    /// Cancelled when close gives up on draining; wakes blocked readers.
    released: CancellationToken,
    close_result: OnceCell<Result<(), TransportError>>,
    can_close_send: bool,
}

impl<S: MessageStream> Core<S> {
    fn new(stream: S, config: HijackConfig) -> Self {
        let can_close_send = stream.supports_close_send();
        let name = Arc::from(stream.name());
        Self {
            stream,
            name,
            config,
            read: Mutex::new(ReadState::default()),
            write: Mutex::new(()),
            closed: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            released: CancellationToken::new(),
            close_result: OnceCell::new(),
            can_close_send,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.read.lock().await;
        loop {
            if !state.pending.is_empty() {
                let n = buf.len().min(state.pending.len());
                buf[..n].copy_from_slice(&state.pending[..n]);
                state.pending.advance(n);
                return Ok(n);
            }
            if state.eof || self.is_closed() {
                return Ok(0);
            }

            let received = tokio::select! {
                biased;
                _ = self.released.cancelled() => return Ok(0),
                received = self.stream.recv() => received,
            };
            match received {
                Ok(Some(msg)) if msg.is_empty() => continue,
                Ok(Some(msg)) => {
                    let n = buf.len().min(msg.len());
                    buf[..n].copy_from_slice(&msg[..n]);
                    if n < msg.len() {
                        state.pending.extend_from_slice(&msg[n..]);
                    }
                    return Ok(n);
                }
                Ok(None) => {
                    state.eof = true;
                    return Ok(0);
                }
                Err(_) if self.is_closed() => {
                    state.eof = true;
                    return Ok(0);
                }
                Err(source) => {
                    self.closed.store(true, Ordering::SeqCst);
                    state.eof = true;
                    tracing::debug!(stream = %self.name, error = %source, "Stream receive failed");
                    return Err(TransportError::StreamReceive {
                        stream: Arc::clone(&self.name),
                        source,
                    });
                }
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let _write = self.write.lock().await;
        if self.is_closed() || self.write_shut.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream.send(Bytes::copy_from_slice(buf)).await {
            Ok(()) => Ok(buf.len()),
            Err(source) => {
                self.closed.store(true, Ordering::SeqCst);
                tracing::debug!(stream = %self.name, error = %source, "Stream send failed");
                Err(TransportError::StreamSend {
                    stream: Arc::clone(&self.name),
                    source,
                })
            }
        }
    }

    async fn close_write(&self) -> Result<(), TransportError> {
        if !self.can_close_send {
            return Err(TransportError::unsupported("close_write"));
        }
        let _write = self.write.lock().await;
        if self.write_shut.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stream
            .close_send()
            .await
            .map_err(|source| TransportError::StreamSend {
                stream: Arc::clone(&self.name),
                source,
            })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_result
            .get_or_init(|| self.close_once())
            .await
            .clone()
    }

    async fn close_once(&self) -> Result<(), TransportError> {
        {
            let _write = self.write.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            if self.can_close_send && !self.write_shut.swap(true, Ordering::SeqCst) {
                if let Err(e) = self.stream.close_send().await {
                    tracing::debug!(stream = %self.name, error = %e, "close_send failed during close");
                }
            }
        }

        let max = self.config.max_drain_messages;
        let drain = async {
            let mut state = self.read.lock().await;
            let mut drained = 0usize;
            while !state.eof && drained < max {
                match self.stream.recv().await {
                    Ok(Some(msg)) => {
                        state.pending.extend_from_slice(&msg);
                        drained += 1;
                    }
                    Ok(None) => state.eof = true,
                    Err(e) => {
                        tracing::debug!(stream = %self.name, error = %e, "Receive failed during drain");
                        state.eof = true;
                    }
                }
            }
            (drained, state.eof)
        };

        match tokio::time::timeout(self.config.drain_timeout, drain).await {
            Ok((drained, true)) => {
                tracing::trace!(stream = %self.name, drained, "Stream drained on close");
            }
            Ok((drained, false)) => {
                tracing::warn!(stream = %self.name, drained, "Stream drain hit message limit");
            }
            Err(_) => {
                tracing::warn!(
                    stream = %self.name,
                    timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    "Stream drain timed out"
                );
            }
        }
        self.released.cancel();
        Ok(())
    }
}

/// Full-duplex [`Conn`] over a message stream.
pub struct StreamConn<S> {
    core: Core<S>,
}

impl<S: MessageStream> StreamConn<S> {
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, HijackConfig::default())
    }

    pub fn with_config(stream: S, config: HijackConfig) -> Self {
        Self {
            core: Core::new(stream, config),
        }
    }

    pub fn stream(&self) -> &S {
        &self.core.stream
    }
}

#[async_trait]
impl<S: MessageStream> Conn for StreamConn<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.core.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.core.write(buf).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.core.close().await
    }

    fn local_addr(&self) -> ConnAddr {
        ConnAddr::RPC_STREAM
    }

    fn remote_addr(&self) -> ConnAddr {
        ConnAddr::RPC_STREAM
    }

    fn half_close_support(&self) -> HalfCloseSupport {
        if self.core.can_close_send {
            HalfCloseSupport::WRITE_ONLY
        } else {
            HalfCloseSupport::NONE
        }
    }

    async fn close_write(&self) -> Result<(), TransportError> {
        self.core.close_write().await
    }
}

/// Read-only [`Conn`] over a message stream that only flows toward us.
pub struct ReadOnlyStreamConn<S> {
    core: Core<S>,
}

impl<S: MessageStream> ReadOnlyStreamConn<S> {
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, HijackConfig::default())
    }

    pub fn with_config(stream: S, config: HijackConfig) -> Self {
        Self {
            core: Core::new(stream, config),
        }
    }
}

#[async_trait]
impl<S: MessageStream> Conn for ReadOnlyStreamConn<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.core.read(buf).await
    }

    async fn write(&self, _buf: &[u8]) -> Result<usize, TransportError> {
        Err(TransportError::unsupported("write"))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.core.close().await
    }

    fn local_addr(&self) -> ConnAddr {
        ConnAddr::RPC_STREAM
    }

    fn remote_addr(&self) -> ConnAddr {
        ConnAddr::RPC_STREAM
    }
}
