//! RPC client over one connection.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::net::Conn;
use crate::rpc::RpcError;
use crate::rpc::keepalive::KeepaliveConfig;
use crate::rpc::session::Session;
use crate::rpc::stream::ClientStream;

/// `go_away` reason sent when the client closes its session.
const CLIENT_CLOSING: &str = "client closing";

/// Client end of a session. Must be created inside a tokio runtime.
///
/// Dropping the client ends the session.
pub struct RpcClient {
    session: Arc<Session>,
}

impl RpcClient {
    pub fn new(conn: Arc<dyn Conn>, keepalive: KeepaliveConfig) -> Self {
        let session = Session::client(conn, keepalive);
        session.start();
        Self { session }
    }

    /// Unary call with typed request and response bodies.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_value(request)?;
        let reply = self.call_value(method, body).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn call_value(&self, method: &str, body: Value) -> Result<Value, RpcError> {
        tracing::trace!(method, "Calling");
        self.session.call(method, body).await
    }

    pub async fn open_stream(&self, method: &str) -> Result<ClientStream, RpcError> {
        self.session.open(method).await
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Why the session ended, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.is_closed().then(|| self.session.close_reason())
    }

    /// Resolves when the session ends, for whatever reason.
    pub async fn closed(&self) {
        self.session.closed_token().cancelled().await;
    }

    /// Tells the server we are leaving and ends the session. Pending calls
    /// fail with `Unavailable`.
    pub async fn close(&self) {
        if !self.is_closed() {
            self.session.go_away(CLIENT_CLOSING).await;
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.session.shutdown("client dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::task::JoinHandle;
    use tokio_util::bytes::Bytes;

    use crate::hijack::StreamConn;
    use crate::net::IoConn;
    use crate::rpc::codec::{ConnFrameReader, ConnFrameWriter, MAX_FRAME_LENGTH};
    use crate::rpc::keepalive::{EnforcementPolicy, KeepaliveParams};
    use crate::rpc::protocol::{Frame, RpcStatus, StatusCode};
    use crate::rpc::server::{RpcServer, Service};
    use crate::rpc::session::STREAM_WINDOW;
    use crate::rpc::stream::ServerStream;
    use crate::transport::{PipeConn, PipeListener};

    const FLOOD_MESSAGES: usize = 500;
    const LARGE_WRITE: usize = 13 * 1024 * 1024;

    fn internal(e: RpcError) -> RpcStatus {
        RpcStatus::internal(e.to_string())
    }

    struct TestService;

    #[async_trait]
    impl Service for TestService {
        fn name(&self) -> &str {
            "test"
        }

        async fn call(&self, method: &str, body: Value) -> Result<Value, RpcStatus> {
            match method {
                "echo" => Ok(body),
                "fail" => Err(RpcStatus::invalid_argument("bad input")),
                "slow" => {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }
                "huge" => Ok(json!("x".repeat(MAX_FRAME_LENGTH))),
                other => Err(RpcStatus::unimplemented(other)),
            }
        }

        async fn stream(&self, method: &str, stream: ServerStream) -> Result<(), RpcStatus> {
            match method {
                "echo" => {
                    while let Some(msg) = stream.recv().await.map_err(internal)? {
                        stream.send(msg).await.map_err(internal)?;
                    }
                }
                "flood" => {
                    for i in 0..FLOOD_MESSAGES {
                        stream
                            .send(Bytes::from(i.to_string()))
                            .await
                            .map_err(internal)?;
                    }
                }
                "count" => {
                    let mut total = 0u64;
                    while let Some(msg) = stream.recv().await.map_err(internal)? {
                        total += msg.len() as u64;
                    }
                    stream
                        .send(Bytes::copy_from_slice(&total.to_le_bytes()))
                        .await
                        .map_err(internal)?;
                }
                other => return Err(RpcStatus::unimplemented(other)),
            }
            Ok(())
        }
    }

    struct Harness {
        server: Arc<RpcServer>,
        serve: JoinHandle<Result<(), RpcError>>,
        client: RpcClient,
    }

    fn connect(server_keepalive: KeepaliveConfig, client_keepalive: KeepaliveConfig) -> Harness {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(server_io);
        let listener = PipeListener::new(Arc::new(PipeConn::new(r, w)));

        let server = Arc::new(RpcServer::new(Arc::new(TestService)).with_keepalive(server_keepalive));
        let serve = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(&listener).await })
        };
        let client = RpcClient::new(Arc::new(IoConn::new(client_io)), client_keepalive);
        Harness {
            server,
            serve,
            client,
        }
    }

    fn plain() -> Harness {
        connect(KeepaliveConfig::disabled(), KeepaliveConfig::disabled())
    }

    #[tokio::test]
    async fn unary_echo() {
        let h = plain();
        let reply: Value = h.client.call("echo", &json!({"x": 1})).await.unwrap();
        assert_eq!(reply, json!({"x": 1}));
    }

    #[tokio::test]
    async fn concurrent_calls_are_routed_by_id() {
        let h = plain();
        let args: Vec<Value> = (0..16).map(|i| json!(i)).collect();
        let calls = args.iter().map(|arg| h.client.call::<_, Value>("echo", arg));
        let replies = futures::future::join_all(calls).await;
        for (i, reply) in replies.into_iter().enumerate() {
            assert_eq!(reply.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn error_status_reaches_caller() {
        let h = plain();
        let err = h.client.call::<_, Value>("fail", &()).await.unwrap_err();
        match err {
            RpcError::Status(status) => {
                assert_eq!(status.code, StatusCode::InvalidArgument);
                assert_eq!(status.message, "bad input");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = h.client.call::<_, Value>("nope", &()).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
    }

    #[tokio::test]
    async fn mismatched_response_type_is_codec_error() {
        let h = plain();
        let err = h.client.call::<_, u32>("echo", &"text").await.unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)));
    }

    #[tokio::test]
    async fn stream_echo_and_half_close() {
        let h = plain();
        let stream = h.client.open_stream("echo").await.unwrap();

        stream.send(Bytes::from_static(b"abc")).await.unwrap();
        stream.send(Bytes::from_static(b"def")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(stream.recv().await.unwrap().unwrap(), Bytes::from_static(b"def"));

        stream.close_send().await.unwrap();
        assert!(stream.recv().await.unwrap().is_none());
        // End-of-stream is sticky.
        assert!(stream.recv().await.unwrap().is_none());
        assert!(matches!(
            stream.send(Bytes::from_static(b"late")).await,
            Err(RpcError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn oversized_call_fails_without_closing_session() {
        let h = plain();
        let err = h
            .client
            .call_value("echo", json!("x".repeat(MAX_FRAME_LENGTH)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)), "{err}");
        assert!(!h.client.is_closed());

        let reply: Value = h.client.call("echo", &"after").await.unwrap();
        assert_eq!(reply, json!("after"));
    }

    #[tokio::test]
    async fn oversized_reply_becomes_internal_error() {
        let h = plain();
        let err = h.client.call::<_, Value>("huge", &()).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
        assert!(err.to_string().contains("reply could not be encoded"), "{err}");

        let reply: Value = h.client.call("echo", &"after").await.unwrap();
        assert_eq!(reply, json!("after"));
    }

    #[tokio::test]
    async fn large_write_over_stream_conn_is_split() {
        let h = plain();
        let conn = StreamConn::new(h.client.open_stream("count").await.unwrap());
        conn.write_all(&vec![7u8; LARGE_WRITE]).await.unwrap();
        conn.close_write().await.unwrap();

        let mut total = [0u8; 8];
        let mut filled = 0;
        while filled < total.len() {
            let n = conn.read(&mut total[filled..]).await.unwrap();
            assert!(n > 0, "stream ended before the byte count");
            filled += n;
        }
        assert_eq!(u64::from_le_bytes(total), LARGE_WRITE as u64);
        assert!(!h.client.is_closed());

        let reply: Value = h.client.call("echo", &"after").await.unwrap();
        assert_eq!(reply, json!("after"));
    }

    #[tokio::test]
    async fn unread_stream_does_not_stall_calls() {
        let h = plain();
        let flood = h.client.open_stream("flood").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply: Value = tokio::time::timeout(Duration::from_secs(3), h.client.call("echo", &1))
            .await
            .expect("call should not wait on an unread stream")
            .unwrap();
        assert_eq!(reply, json!(1));

        // The server was held back by the window, not dropped messages.
        for i in 0..FLOOD_MESSAGES {
            let msg = flood.recv().await.unwrap().unwrap();
            assert_eq!(msg, Bytes::from(i.to_string()));
        }
        assert!(flood.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_overrun_resets_only_that_stream() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::new(Arc::new(IoConn::new(local)), KeepaliveConfig::disabled());
        let remote: Arc<dyn Conn> = Arc::new(IoConn::new(remote));

        // A peer that ignores the window.
        let peer = tokio::spawn(async move {
            let mut reader = ConnFrameReader::<Frame>::new(Arc::clone(&remote));
            let mut writer = ConnFrameWriter::<Frame>::new(Arc::clone(&remote));
            let mut reset = None;
            let mut answered = false;
            while reset.is_none() || !answered {
                match reader.next().await.unwrap().unwrap() {
                    Frame::Open { id, .. } => {
                        for _ in 0..STREAM_WINDOW + 2 {
                            let data = Bytes::from_static(b"more");
                            writer.send(Frame::Data { id, data }).await.unwrap();
                        }
                    }
                    Frame::Reset { status, .. } => reset = Some(status),
                    Frame::Call { id, body, .. } => {
                        writer.send(Frame::reply(id, Ok(body))).await.unwrap();
                        answered = true;
                    }
                    _ => {}
                }
            }
            (reset, remote)
        });

        let stream = client.open_stream("firehose").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply: Value = tokio::time::timeout(Duration::from_secs(3), client.call("echo", &"ok"))
            .await
            .expect("call should complete")
            .unwrap();
        assert_eq!(reply, json!("ok"));

        let (reset, _remote) = tokio::time::timeout(Duration::from_secs(5), peer)
            .await
            .expect("peer should see the reset")
            .unwrap();
        assert_eq!(reset.unwrap().code, StatusCode::ResourceExhausted);

        let mut delivered = 0;
        let err = loop {
            match stream.recv().await {
                Ok(Some(_)) => delivered += 1,
                Ok(None) => panic!("overrun stream should not end cleanly"),
                Err(e) => break e,
            }
        };
        assert_eq!(delivered, STREAM_WINDOW as usize + 1);
        assert_eq!(err.code(), StatusCode::ResourceExhausted);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn unknown_stream_is_reset() {
        let h = plain();
        let stream = h.client.open_stream("nope").await.unwrap();
        let err = stream.recv().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
    }

    #[tokio::test]
    async fn stop_fails_pending_calls() {
        let h = plain();
        let pending = {
            let client = Arc::new(h.client);
            let c = Arc::clone(&client);
            let task = tokio::spawn(async move { c.call::<_, Value>("slow", &()).await });
            (client, task)
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.server.stop().await;
        let err = tokio::time::timeout(Duration::from_secs(5), pending.1)
            .await
            .expect("pending call should fail")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::Unavailable(_)));
        assert!(err.to_string().contains("server stopping"), "{err}");

        let served = tokio::time::timeout(Duration::from_secs(5), h.serve)
            .await
            .expect("serve should return after stop")
            .unwrap();
        assert!(served.is_ok());
        assert!(pending.0.is_closed());
    }

    #[tokio::test]
    async fn ping_flood_gets_go_away() {
        let strict = KeepaliveConfig::disabled().with_enforcement(EnforcementPolicy {
            min_time: Duration::from_secs(3600),
            permit_without_stream: true,
        });
        let eager = KeepaliveConfig::disabled().with_params(KeepaliveParams {
            time: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
            permit_without_stream: true,
        });
        let h = connect(strict, eager);

        tokio::time::timeout(Duration::from_secs(5), h.client.closed())
            .await
            .expect("client should be sent away");
        let reason = h.client.close_reason().unwrap();
        assert!(reason.contains("too_many_pings"), "{reason}");
    }

    #[tokio::test]
    async fn keepalive_times_out_silent_peer() {
        let (local, _silent_peer) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::new(
            Arc::new(IoConn::new(local)),
            KeepaliveConfig::disabled().with_params(KeepaliveParams {
                time: Duration::from_millis(10),
                timeout: Duration::from_millis(50),
                permit_without_stream: true,
            }),
        );

        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .expect("keepalive should close the session");
        assert_eq!(client.close_reason().unwrap(), "keepalive ping timed out");

        let err = client.call::<_, Value>("echo", &()).await.unwrap_err();
        assert!(matches!(err, RpcError::Unavailable(_)));
    }

    #[tokio::test]
    async fn healthy_keepalive_keeps_session_open() {
        let quick = KeepaliveParams {
            time: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
            permit_without_stream: true,
        };
        let h = connect(
            KeepaliveConfig::disabled().with_params(quick),
            KeepaliveConfig::disabled().with_params(quick),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.client.is_closed());
        let reply: Value = h.client.call("echo", &"still here").await.unwrap();
        assert_eq!(reply, json!("still here"));
    }
}
