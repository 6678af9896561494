//! [`Driver`] implementation that forwards to a driver process over RPC.

use std::sync::Arc;

use async_trait::async_trait;

use crate::driver::{Driver, DriverError, DriverInfo, SnapshotList, SnapshotRequest, methods};
use crate::hijack::{HijackConfig, ReadOnlyStreamConn, StreamConn};
use crate::net::Conn;
use crate::rpc::{KeepaliveConfig, RpcClient};

pub struct DriverClient {
    rpc: RpcClient,
    hijack: HijackConfig,
}

impl DriverClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            hijack: HijackConfig::default(),
        }
    }

    /// Client over a connection to a driver, with the orchestrator's
    /// keepalive settings.
    pub fn connect(conn: Arc<dyn Conn>) -> Self {
        Self::new(RpcClient::new(conn, KeepaliveConfig::driver_client()))
    }

    pub fn with_hijack(mut self, hijack: HijackConfig) -> Self {
        self.hijack = hijack;
        self
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn unit(&self, method: &str) -> Result<(), DriverError> {
        self.rpc.call::<_, ()>(method, &()).await?;
        Ok(())
    }

    async fn snapshot(&self, method: &str, tag: &str) -> Result<(), DriverError> {
        let req = SnapshotRequest {
            tag: tag.to_string(),
        };
        self.rpc.call::<_, ()>(method, &req).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for DriverClient {
    async fn info(&self) -> Result<DriverInfo, DriverError> {
        Ok(self.rpc.call(methods::INFO, &()).await?)
    }

    async fn validate(&self) -> Result<(), DriverError> {
        self.unit(methods::VALIDATE).await
    }

    async fn create(&self) -> Result<(), DriverError> {
        self.unit(methods::CREATE).await
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.unit(methods::START).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.unit(methods::STOP).await
    }

    async fn pause(&self) -> Result<(), DriverError> {
        self.unit(methods::PAUSE).await
    }

    async fn resume(&self) -> Result<(), DriverError> {
        self.unit(methods::RESUME).await
    }

    async fn create_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        self.snapshot(methods::CREATE_SNAPSHOT, tag).await
    }

    async fn apply_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        self.snapshot(methods::APPLY_SNAPSHOT, tag).await
    }

    async fn delete_snapshot(&self, tag: &str) -> Result<(), DriverError> {
        self.snapshot(methods::DELETE_SNAPSHOT, tag).await
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, DriverError> {
        let list: SnapshotList = self.rpc.call(methods::LIST_SNAPSHOTS, &()).await?;
        Ok(list.tags)
    }

    /// Opens a tunnel to the guest agent. A driver without one resets the
    /// stream, which surfaces as an error on the first read.
    async fn guest_agent_conn(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        let stream = self.rpc.open_stream(methods::GUEST_AGENT_CONN).await?;
        Ok(Some(Arc::new(StreamConn::with_config(stream, self.hijack))))
    }

    async fn serial_console(&self) -> Result<Option<Arc<dyn Conn>>, DriverError> {
        let stream = self.rpc.open_stream(methods::SERIAL_CONSOLE).await?;
        Ok(Some(Arc::new(ReadOnlyStreamConn::with_config(
            stream,
            self.hijack,
        ))))
    }
}
