//! One RPC session over one connection.
//!
//! Flow:
//! 1. Reader task decodes frames from the connection
//! 2. Replies go to pending calls, stream frames to stream inboxes. The
//!    reader never waits on a stream: a peer that sends past its window
//!    gets that one stream reset
//! 3. On the server side, calls and opens are dispatched to the service
//!    in their own tasks
//! 4. Keepalive task pings the peer when configured
//! 5. On session end: fail every pending call and stream, close the conn

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::net::Conn;
use crate::rpc::RpcError;
use crate::rpc::codec::{ConnFrameReader, ConnFrameWriter, encode_frame};
use crate::rpc::keepalive::{KeepaliveConfig, KeepaliveParams, PingEnforcer, TOO_MANY_PINGS};
use crate::rpc::protocol::{CallId, Frame, RpcStatus, StatusCode};
use crate::rpc::server::Service;
use crate::rpc::stream::{ClientStream, ServerStream};

/// `data` frames a sender may have in flight per stream before it needs
/// more credit.
pub(crate) const STREAM_WINDOW: u32 = 64;

/// Credits a receiver accumulates before granting them back.
pub(crate) const WINDOW_UPDATE_BATCH: u32 = 16;

/// Room for a full window plus the terminal event.
const INBOX_CAPACITY: usize = STREAM_WINDOW as usize + 1;

/// Upper bound on delivering a `go_away` before the session is torn down.
const GO_AWAY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Inbound event for one stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    End,
    Failed(RpcError),
}

/// Counts a call or stream as in flight for as long as it is alive.
pub(crate) struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Session {
    role: Role,
    conn: Arc<dyn Conn>,
    writer: Mutex<ConnFrameWriter<Frame>>,
    calls: DashMap<CallId, oneshot::Sender<Result<Value, RpcError>>>,
    streams: DashMap<CallId, mpsc::Sender<StreamEvent>>,
    /// Send credit per open stream. Closed once sending is pointless.
    credits: DashMap<CallId, Arc<Semaphore>>,
    /// Server side: cancels a running stream handler when the client resets.
    handlers: DashMap<CallId, CancellationToken>,
    in_flight: Arc<AtomicUsize>,
    next_id: AtomicU64,
    next_nonce: AtomicU64,
    closed: CancellationToken,
    close_reason: OnceLock<String>,
    pongs: watch::Sender<u64>,
    enforcer: Option<StdMutex<PingEnforcer>>,
    keepalive: Option<KeepaliveParams>,
    service: Option<Arc<dyn Service>>,
}

impl Session {
    pub(crate) fn client(conn: Arc<dyn Conn>, keepalive: KeepaliveConfig) -> Arc<Self> {
        Arc::new(Self::new(Role::Client, conn, keepalive, None))
    }

    pub(crate) fn server(
        conn: Arc<dyn Conn>,
        service: Arc<dyn Service>,
        keepalive: KeepaliveConfig,
    ) -> Arc<Self> {
        Arc::new(Self::new(Role::Server, conn, keepalive, Some(service)))
    }

    fn new(
        role: Role,
        conn: Arc<dyn Conn>,
        keepalive: KeepaliveConfig,
        service: Option<Arc<dyn Service>>,
    ) -> Self {
        let (pongs, _) = watch::channel(0);
        Self {
            role,
            writer: Mutex::new(ConnFrameWriter::new(Arc::clone(&conn))),
            conn,
            calls: DashMap::new(),
            streams: DashMap::new(),
            credits: DashMap::new(),
            handlers: DashMap::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            next_nonce: AtomicU64::new(0),
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
            pongs,
            enforcer: keepalive
                .enforcement
                .map(|policy| StdMutex::new(PingEnforcer::new(policy))),
            keepalive: keepalive.params,
            service,
        }
    }

    /// Spawns the reader and keepalive tasks. The returned handle completes
    /// when the reader task has stopped and the connection is closed.
    pub(crate) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        if let Some(params) = self.keepalive {
            tokio::spawn(Arc::clone(self).run_keepalive(params));
        }
        tokio::spawn(Arc::clone(self).run_reader())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn close_reason(&self) -> String {
        self.close_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "session closed".to_string())
    }

    pub(crate) fn unavailable(&self) -> RpcError {
        RpcError::Unavailable(self.close_reason())
    }

    pub(crate) fn in_flight(&self) -> InFlight {
        InFlight::new(&self.in_flight)
    }

    /// Writes one frame. An encode failure is returned to the caller and
    /// leaves the session open; a write failure ends the session.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.unavailable());
        }
        let kind = frame.kind();
        let encoded = encode_frame(frame)?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send_encoded(&encoded).await {
            drop(writer);
            tracing::debug!(frame = kind, error = %e, "Frame write failed");
            self.shutdown(format!("write failed: {e}"));
            return Err(e);
        }
        Ok(())
    }

    /// Ends the session once. Pending calls fail with `Unavailable`; stream
    /// inboxes are dropped, which their readers observe as `Unavailable`.
    pub(crate) fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        tracing::debug!(role = ?self.role, reason = %reason, "Session closing");
        self.closed.cancel();

        let err = RpcError::Unavailable(reason);
        let ids: Vec<CallId> = self.calls.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.calls.remove(&id) {
                let _ = tx.send(Err(err.clone()));
            }
        }
        self.streams.clear();
        for entry in self.credits.iter() {
            entry.value().close();
        }
        self.credits.clear();
        self.handlers.clear();
    }

    /// Tells the peer we are leaving, then shuts down.
    pub(crate) async fn go_away(&self, reason: &str) {
        let frame = Frame::GoAway {
            reason: reason.to_string(),
        };
        match tokio::time::timeout(GO_AWAY_TIMEOUT, self.send_frame(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Failed to send go_away"),
            Err(_) => tracing::debug!("Timed out sending go_away"),
        }
        self.shutdown(reason);
    }

    pub(crate) fn remove_stream(&self, id: CallId) {
        self.streams.remove(&id);
        self.revoke_credits(id);
    }

    fn revoke_credits(&self, id: CallId) {
        if let Some((_, credits)) = self.credits.remove(&id) {
            credits.close();
        }
    }

    fn register_stream(&self, id: CallId) -> (mpsc::Receiver<StreamEvent>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let credits = Arc::new(Semaphore::new(STREAM_WINDOW as usize));
        self.streams.insert(id, tx);
        self.credits.insert(id, Arc::clone(&credits));
        (rx, credits)
    }

    /// Returns `credits` consumed messages to the peer, in the background.
    pub(crate) fn grant_window(self: &Arc<Self>, id: CallId, credits: u32) {
        if self.is_closed() {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.send_frame(Frame::Window { id, credits }).await {
                tracing::trace!(id, error = %e, "Window update not delivered");
            }
        });
    }

    /// Unary call from the client side.
    pub(crate) async fn call(&self, method: &str, body: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        if self.is_closed() {
            self.calls.remove(&id);
            return Err(self.unavailable());
        }
        let _in_flight = self.in_flight();

        let frame = Frame::Call {
            id,
            method: method.to_string(),
            body,
        };
        if let Err(e) = self.send_frame(frame).await {
            self.calls.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.unavailable()),
        }
    }

    /// Opens a streaming call from the client side.
    pub(crate) async fn open(self: &Arc<Self>, method: &str) -> Result<ClientStream, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (rx, credits) = self.register_stream(id);
        if self.is_closed() {
            self.remove_stream(id);
            return Err(self.unavailable());
        }
        let in_flight = self.in_flight();

        let frame = Frame::Open {
            id,
            method: method.to_string(),
        };
        if let Err(e) = self.send_frame(frame).await {
            self.remove_stream(id);
            return Err(e);
        }
        tracing::debug!(id, method, "Stream opened");
        Ok(ClientStream::new(
            Arc::clone(self),
            id,
            method,
            rx,
            credits,
            in_flight,
        ))
    }

    async fn run_reader(self: Arc<Self>) {
        let mut reader = ConnFrameReader::<Frame>::new(Arc::clone(&self.conn));
        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                next = reader.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::debug!(role = ?self.role, error = %e, "Session read failed");
                    self.shutdown(format!("read failed: {e}"));
                    break;
                }
                None => {
                    self.shutdown("connection closed by peer");
                    break;
                }
            };
            tracing::trace!(frame = frame.kind(), "Frame received");
            if let ControlFlow::Break(reason) = self.dispatch(frame).await {
                self.shutdown(reason);
                break;
            }
        }

        if let Err(e) = self.conn.close().await {
            tracing::debug!(error = %e, "Closing session connection failed");
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) -> ControlFlow<String> {
        match frame {
            Frame::Reply { id, body, error } => {
                if self.role != Role::Client {
                    return ControlFlow::Break("reply frame received by server".to_string());
                }
                let result = match error {
                    Some(status) => Err(RpcError::Status(status)),
                    None => Ok(body.unwrap_or(Value::Null)),
                };
                match self.calls.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => tracing::debug!(id, "Reply for unknown call ignored"),
                }
            }
            Frame::Call { id, method, body } => return self.spawn_call(id, method, body),
            Frame::Open { id, method } => return self.spawn_stream(id, method),
            Frame::Data { id, data } => self.deliver(id, data),
            Frame::Eof { id } => {
                // The server sends `eof` when its handler is done, so nothing
                // more the client sends would be read.
                if self.role == Role::Client {
                    self.revoke_credits(id);
                }
                if let Some((_, tx)) = self.streams.remove(&id) {
                    let _ = tx.try_send(StreamEvent::End);
                }
            }
            Frame::Reset { id, status } => {
                tracing::debug!(id, code = %status.code, "Stream reset by peer");
                if let Some((_, token)) = self.handlers.remove(&id) {
                    token.cancel();
                }
                self.revoke_credits(id);
                if let Some((_, tx)) = self.streams.remove(&id) {
                    let _ = tx.try_send(StreamEvent::Failed(RpcError::Status(status)));
                }
            }
            Frame::Window { id, credits } => {
                if let Some(entry) = self.credits.get(&id) {
                    let room = (STREAM_WINDOW as usize).saturating_sub(entry.available_permits());
                    entry.add_permits((credits as usize).min(room));
                }
            }
            Frame::Ping { nonce } => {
                if self.ping_exceeds_policy() {
                    tracing::warn!("Peer exceeded ping policy, sending go_away");
                    self.go_away(TOO_MANY_PINGS).await;
                    return ControlFlow::Break(TOO_MANY_PINGS.to_string());
                }
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = session.send_frame(Frame::Pong { nonce }).await;
                });
            }
            Frame::Pong { nonce } => {
                self.pongs.send_if_modified(|latest| {
                    if nonce > *latest {
                        *latest = nonce;
                        true
                    } else {
                        false
                    }
                });
            }
            Frame::GoAway { reason } => {
                tracing::debug!(role = ?self.role, reason = %reason, "Peer sent go_away");
                return ControlFlow::Break(format!("peer sent go_away: {reason}"));
            }
        }
        ControlFlow::Continue(())
    }

    fn deliver(self: &Arc<Self>, id: CallId, data: Bytes) {
        let tx = match self.streams.get(&id) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::trace!(id, "Frame for finished stream ignored");
                return;
            }
        };
        match tx.try_send(StreamEvent::Data(data)) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                self.streams.remove(&id);
            }
            Err(TrySendError::Full(_)) => self.overflow(id),
        }
    }

    /// The peer sent past its window. Only that stream is torn down; its
    /// reader sees `ResourceExhausted` after the buffered messages.
    fn overflow(self: &Arc<Self>, id: CallId) {
        tracing::warn!(id, window = STREAM_WINDOW, "Peer overran stream window, resetting stream");
        self.streams.remove(&id);
        self.revoke_credits(id);
        if let Some((_, token)) = self.handlers.remove(&id) {
            token.cancel();
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let frame = Frame::Reset {
                id,
                status: window_exceeded(),
            };
            if let Err(e) = session.send_frame(frame).await {
                tracing::debug!(id, error = %e, "Failed to reset overrun stream");
            }
        });
    }

    fn ping_exceeds_policy(&self) -> bool {
        match &self.enforcer {
            Some(enforcer) => enforcer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_ping(Instant::now(), self.active_calls()),
            None => false,
        }
    }

    fn note_call_activity(&self) {
        if let Some(enforcer) = &self.enforcer {
            enforcer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset_strikes();
        }
    }

    fn spawn_call(self: &Arc<Self>, id: CallId, method: String, body: Value) -> ControlFlow<String> {
        let Some(service) = self.service.clone() else {
            return ControlFlow::Break("call frame received by client".to_string());
        };
        self.note_call_activity();
        let in_flight = self.in_flight();
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let _in_flight = in_flight;
            tracing::debug!(id, method = %method, "Handling call");
            let result = tokio::select! {
                _ = session.closed.cancelled() => {
                    tracing::debug!(id, method = %method, "Call aborted by session shutdown");
                    return;
                }
                result = service.call(&method, body) => result,
            };
            if let Err(status) = &result {
                tracing::debug!(id, method = %method, code = %status.code, "Call failed");
            }
            match session.send_frame(Frame::reply(id, result)).await {
                Ok(()) => {}
                Err(RpcError::Codec(reason)) => {
                    tracing::warn!(id, method = %method, error = %reason, "Reply could not be encoded");
                    let status = RpcStatus::internal(format!("reply could not be encoded: {reason}"));
                    if let Err(e) = session.send_frame(Frame::reply(id, Err(status))).await {
                        tracing::debug!(id, error = %e, "Failed to send reply");
                    }
                }
                Err(e) => tracing::debug!(id, error = %e, "Failed to send reply"),
            }
        });
        ControlFlow::Continue(())
    }

    fn spawn_stream(self: &Arc<Self>, id: CallId, method: String) -> ControlFlow<String> {
        let Some(service) = self.service.clone() else {
            return ControlFlow::Break("open frame received by client".to_string());
        };
        self.note_call_activity();
        let in_flight = self.in_flight();

        let (rx, credits) = self.register_stream(id);
        let cancel = self.closed.child_token();
        self.handlers.insert(id, cancel.clone());
        let stream = ServerStream::new(Arc::clone(self), id, &method, rx, credits);
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let _in_flight = in_flight;
            tracing::debug!(id, method = %method, "Handling stream");
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = service.stream(&method, stream) => Some(result),
            };
            session.handlers.remove(&id);
            session.remove_stream(id);

            let frame = match result {
                None => {
                    tracing::debug!(id, method = %method, "Stream handler cancelled");
                    return;
                }
                Some(Ok(())) => Frame::Eof { id },
                Some(Err(status)) => {
                    tracing::debug!(id, method = %method, code = %status.code, "Stream handler failed");
                    Frame::Reset { id, status }
                }
            };
            if let Err(e) = session.send_frame(frame).await {
                tracing::debug!(id, error = %e, "Failed to finish stream");
            }
        });
        ControlFlow::Continue(())
    }

    async fn run_keepalive(self: Arc<Self>, params: KeepaliveParams) {
        let mut pongs = self.pongs.subscribe();
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(params.time) => {}
            }
            if !params.permit_without_stream && self.active_calls() == 0 {
                continue;
            }

            let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed) + 1;
            if self.send_frame(Frame::Ping { nonce }).await.is_err() {
                return;
            }
            let answered = async { pongs.wait_for(|&latest| latest >= nonce).await.map(|_| ()) };
            let outcome = tokio::select! {
                _ = self.closed.cancelled() => return,
                outcome = tokio::time::timeout(params.timeout, answered) => outcome,
            };
            match outcome {
                Ok(Ok(())) => tracing::trace!(nonce, "Keepalive pong received"),
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::warn!(
                        role = ?self.role,
                        timeout_ms = params.timeout.as_millis() as u64,
                        "Keepalive ping timed out"
                    );
                    self.shutdown("keepalive ping timed out");
                    return;
                }
            }
        }
    }
}

/// Status of a stream whose peer sent more than [`STREAM_WINDOW`] unread
/// messages.
pub(crate) fn window_exceeded() -> RpcStatus {
    RpcStatus::new(StatusCode::ResourceExhausted, "stream window exceeded")
}

/// Status sent with a best-effort reset when a client drops an open stream.
pub(crate) fn cancelled_status() -> RpcStatus {
    RpcStatus::cancelled("stream dropped by client")
}
