//! Message streams for streaming calls.
//!
//! Both ends see a sequence of opaque byte messages in each direction. Only
//! the client end can half-close ([`ClientStream::close_send`]); the server
//! end finishes its direction by returning from the handler.
//!
//! Sending is credit based: each message costs one credit out of
//! the stream window, and the receiver hands credits back as it reads. A
//! sender with no credit left waits, so a slow reader slows its writer
//! without holding up the rest of the session. Messages larger than
//! [`MAX_DATA_CHUNK`] go out as several messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::bytes::Bytes;

use crate::hijack::MessageStream;
use crate::rpc::RpcError;
use crate::rpc::protocol::{CallId, Frame};
use crate::rpc::session::{
    InFlight, Session, StreamEvent, WINDOW_UPDATE_BATCH, cancelled_status, window_exceeded,
};

/// Largest payload carried by one `data` frame. Base64 inflates it by a
/// third, which keeps the frame well under the codec's limit.
pub const MAX_DATA_CHUNK: usize = 4 * 1024 * 1024;

struct Inbox {
    rx: mpsc::Receiver<StreamEvent>,
    /// Set once the inbound direction has ended, cleanly or not.
    done: Option<Result<(), RpcError>>,
    /// Messages read since credit was last granted back.
    unacked: u32,
}

/// State shared by both stream ends.
struct StreamCore {
    session: Arc<Session>,
    id: CallId,
    method: Arc<str>,
    inbox: Mutex<Inbox>,
    credits: Arc<Semaphore>,
    finished: AtomicBool,
}

impl StreamCore {
    fn new(
        session: Arc<Session>,
        id: CallId,
        method: &str,
        rx: mpsc::Receiver<StreamEvent>,
        credits: Arc<Semaphore>,
    ) -> Self {
        Self {
            session,
            id,
            method: Arc::from(method),
            inbox: Mutex::new(Inbox {
                rx,
                done: None,
                unacked: 0,
            }),
            credits,
            finished: AtomicBool::new(false),
        }
    }

    async fn send(&self, mut data: Bytes) -> Result<(), RpcError> {
        loop {
            let chunk = if data.len() > MAX_DATA_CHUNK {
                data.split_to(MAX_DATA_CHUNK)
            } else {
                std::mem::take(&mut data)
            };
            self.acquire_credit().await?;
            self.session
                .send_frame(Frame::Data {
                    id: self.id,
                    data: chunk,
                })
                .await?;
            if data.is_empty() {
                return Ok(());
            }
        }
    }

    async fn acquire_credit(&self) -> Result<(), RpcError> {
        let closed = self.session.closed_token();
        let acquired = tokio::select! {
            _ = closed.cancelled() => return Err(self.session.unavailable()),
            acquired = self.credits.acquire() => acquired,
        };
        match acquired {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) if self.session.is_closed() => Err(self.session.unavailable()),
            Err(_) => Err(RpcError::unavailable(format!(
                "stream {} is finished",
                self.method
            ))),
        }
    }

    /// Cancel-safe: a dropped call never loses a message.
    async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        let mut inbox = self.inbox.lock().await;
        if let Some(done) = &inbox.done {
            return done.clone().map(|()| None);
        }

        let outcome = match inbox.rx.recv().await {
            Some(StreamEvent::Data(data)) => {
                inbox.unacked += 1;
                if inbox.unacked >= WINDOW_UPDATE_BATCH {
                    self.session.grant_window(self.id, inbox.unacked);
                    inbox.unacked = 0;
                }
                return Ok(Some(data));
            }
            Some(StreamEvent::End) => Ok(()),
            Some(StreamEvent::Failed(e)) => Err(e),
            None if self.session.is_closed() => Err(self.session.unavailable()),
            None => Err(RpcError::Status(window_exceeded())),
        };
        self.finished.store(true, Ordering::Release);
        inbox.done = Some(outcome.clone());
        outcome.map(|()| None)
    }
}

/// Client end of a streaming call, returned by
/// [`RpcClient::open_stream`](crate::rpc::RpcClient::open_stream).
///
/// Dropping it before the server finished sends a best-effort `reset`, which
/// cancels the server's handler.
pub struct ClientStream {
    core: StreamCore,
    send_done: AtomicBool,
    _in_flight: InFlight,
}

impl ClientStream {
    pub(crate) fn new(
        session: Arc<Session>,
        id: CallId,
        method: &str,
        rx: mpsc::Receiver<StreamEvent>,
        credits: Arc<Semaphore>,
        in_flight: InFlight,
    ) -> Self {
        Self {
            core: StreamCore::new(session, id, method, rx, credits),
            send_done: AtomicBool::new(false),
            _in_flight: in_flight,
        }
    }

    pub fn method(&self) -> &str {
        &self.core.method
    }

    pub async fn send(&self, data: Bytes) -> Result<(), RpcError> {
        if self.send_done.load(Ordering::Acquire) {
            return Err(RpcError::protocol("send after close_send"));
        }
        self.core.send(data).await
    }

    /// Next message, or `None` once the server finished cleanly.
    pub async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        self.core.recv().await
    }

    /// Half-close: no further messages will be sent. Idempotent.
    pub async fn close_send(&self) -> Result<(), RpcError> {
        if self.send_done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.core
            .session
            .send_frame(Frame::Eof { id: self.core.id })
            .await
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        let session = &self.core.session;
        session.remove_stream(self.core.id);
        if self.core.finished.load(Ordering::Acquire) || session.is_closed() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = Arc::clone(session);
            let id = self.core.id;
            handle.spawn(async move {
                let frame = Frame::Reset {
                    id,
                    status: cancelled_status(),
                };
                if let Err(e) = session.send_frame(frame).await {
                    tracing::trace!(id, error = %e, "Reset on drop not delivered");
                }
            });
        }
    }
}

#[async_trait]
impl MessageStream for ClientStream {
    async fn send(&self, data: Bytes) -> Result<(), RpcError> {
        ClientStream::send(self, data).await
    }

    async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        ClientStream::recv(self).await
    }

    fn supports_close_send(&self) -> bool {
        true
    }

    async fn close_send(&self) -> Result<(), RpcError> {
        ClientStream::close_send(self).await
    }

    fn name(&self) -> &str {
        self.method()
    }
}

/// Server end of a streaming call, handed to
/// [`Service::stream`](crate::rpc::Service::stream).
pub struct ServerStream {
    core: StreamCore,
}

impl ServerStream {
    pub(crate) fn new(
        session: Arc<Session>,
        id: CallId,
        method: &str,
        rx: mpsc::Receiver<StreamEvent>,
        credits: Arc<Semaphore>,
    ) -> Self {
        Self {
            core: StreamCore::new(session, id, method, rx, credits),
        }
    }

    pub fn method(&self) -> &str {
        &self.core.method
    }

    pub async fn send(&self, data: Bytes) -> Result<(), RpcError> {
        self.core.send(data).await
    }

    /// Next message, or `None` once the client half-closed.
    pub async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        self.core.recv().await
    }
}

#[async_trait]
impl MessageStream for ServerStream {
    async fn send(&self, data: Bytes) -> Result<(), RpcError> {
        ServerStream::send(self, data).await
    }

    async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        ServerStream::recv(self).await
    }

    fn name(&self) -> &str {
        self.method()
    }
}
