//! RPC service exposing a [`Driver`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::bytes::Bytes;

use crate::bicopy::bicopy;
use crate::driver::{Driver, SnapshotList, SnapshotRequest, methods};
use crate::hijack::{HijackConfig, StreamConn};
use crate::net::Conn;
use crate::rpc::{RpcStatus, ServerStream, Service, StatusCode};

const CONSOLE_CHUNK: usize = 32 * 1024;

pub struct DriverService {
    driver: Arc<dyn Driver>,
    hijack: HijackConfig,
}

impl DriverService {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            hijack: HijackConfig::default(),
        }
    }

    pub fn with_hijack(mut self, hijack: HijackConfig) -> Self {
        self.hijack = hijack;
        self
    }

    async fn relay_guest_agent(&self, stream: ServerStream) -> Result<(), RpcStatus> {
        let guest = self.driver.guest_agent_conn().await?.ok_or_else(|| {
            RpcStatus::new(
                StatusCode::FailedPrecondition,
                "driver has no guest agent connection",
            )
        })?;
        let tunnel: Arc<dyn Conn> = Arc::new(StreamConn::with_config(stream, self.hijack));

        let report = bicopy(tunnel, guest, None).await;
        tracing::debug!(
            to_guest = report.x_to_y.bytes,
            from_guest = report.y_to_x.bytes,
            "Guest agent relay finished"
        );
        if let Some(e) = report.first_error() {
            tracing::debug!(error = %e, "Guest agent relay ended with error");
        }
        Ok(())
    }

    async fn pump_serial_console(&self, stream: ServerStream) -> Result<(), RpcStatus> {
        let console = self.driver.serial_console().await?.ok_or_else(|| {
            RpcStatus::new(
                StatusCode::FailedPrecondition,
                "driver has no serial console",
            )
        })?;

        let mut buf = vec![0u8; CONSOLE_CHUNK];
        let result = loop {
            let n = match console.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(RpcStatus::internal(format!("serial console read failed: {e}"))),
            };
            if let Err(e) = stream.send(Bytes::copy_from_slice(&buf[..n])).await {
                tracing::debug!(error = %e, "Serial console client went away");
                break Ok(());
            }
        };
        if let Err(e) = console.close().await {
            tracing::debug!(error = %e, "Closing serial console failed");
        }
        result
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T, RpcStatus> {
    serde_json::from_value(body).map_err(|e| RpcStatus::invalid_argument(e.to_string()))
}

fn reply<T: Serialize>(value: T) -> Result<Value, RpcStatus> {
    serde_json::to_value(value).map_err(|e| RpcStatus::internal(e.to_string()))
}

#[async_trait]
impl Service for DriverService {
    fn name(&self) -> &str {
        "driver"
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, RpcStatus> {
        let driver = &self.driver;
        match method {
            methods::INFO => reply(driver.info().await?),
            methods::VALIDATE => reply(driver.validate().await?),
            methods::CREATE => reply(driver.create().await?),
            methods::START => reply(driver.start().await?),
            methods::STOP => reply(driver.stop().await?),
            methods::PAUSE => reply(driver.pause().await?),
            methods::RESUME => reply(driver.resume().await?),
            methods::CREATE_SNAPSHOT => {
                let req: SnapshotRequest = parse(body)?;
                reply(driver.create_snapshot(&req.tag).await?)
            }
            methods::APPLY_SNAPSHOT => {
                let req: SnapshotRequest = parse(body)?;
                reply(driver.apply_snapshot(&req.tag).await?)
            }
            methods::DELETE_SNAPSHOT => {
                let req: SnapshotRequest = parse(body)?;
                reply(driver.delete_snapshot(&req.tag).await?)
            }
            methods::LIST_SNAPSHOTS => reply(SnapshotList {
                tags: driver.list_snapshots().await?,
            }),
            other => Err(RpcStatus::unimplemented(other)),
        }
    }

    async fn stream(&self, method: &str, stream: ServerStream) -> Result<(), RpcStatus> {
        match method {
            methods::GUEST_AGENT_CONN => self.relay_guest_agent(stream).await,
            methods::SERIAL_CONSOLE => self.pump_serial_console(stream).await,
            other => Err(RpcStatus::unimplemented(other)),
        }
    }
}
