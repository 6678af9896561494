//! Runs the bundled null driver as a child process and drives it over its
//! stdio pipe.
#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use drivelet::driver::null::CONSOLE_BANNER;
use drivelet::driver::{Driver, DriverError, ExternalDriver, ExternalDriverConfig};
use drivelet::net::Conn;
use drivelet::registry::{DiscoveryConfig, DriverRegistry};
use drivelet::rpc::StatusCode;
use drivelet::TransportError;

const NULL_DRIVER: &str = env!("CARGO_BIN_EXE_drivelet-driver-null");

fn config() -> ExternalDriverConfig {
    ExternalDriverConfig::default().with_startup_timeout(Duration::from_secs(10))
}

async fn start_null() -> ExternalDriver {
    ExternalDriver::start("null", NULL_DRIVER, config())
        .await
        .expect("null driver should start")
}

async fn read_to_end(conn: &dyn Conn) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 7];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(10), conn.read(&mut buf))
            .await
            .expect("read should not hang")
            .unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn lifecycle_and_snapshots_over_stdio() {
    let driver = start_null().await;
    assert_eq!(driver.driver_info().name, "null");
    assert!(driver.driver_info().features.snapshots);

    driver.validate().await.unwrap();
    driver.create().await.unwrap();
    Driver::start(&driver).await.unwrap();
    driver.pause().await.unwrap();
    driver.resume().await.unwrap();

    driver.create_snapshot("clean").await.unwrap();
    assert_eq!(driver.list_snapshots().await.unwrap(), vec!["clean"]);
    driver.apply_snapshot("clean").await.unwrap();
    driver.delete_snapshot("clean").await.unwrap();
    assert!(driver.list_snapshots().await.unwrap().is_empty());

    match driver.apply_snapshot("missing").await.unwrap_err() {
        DriverError::Remote(status) => {
            assert_eq!(status.code, StatusCode::Unknown);
            assert!(status.message.contains("not found"), "{}", status.message);
        }
        other => panic!("unexpected error: {other}"),
    }

    Driver::stop(&driver).await.unwrap();
    let err = driver.pause().await.unwrap_err();
    assert_eq!(err.status().code, StatusCode::FailedPrecondition);

    let status = driver.stop().await.unwrap();
    assert!(status.success(), "SIGTERM should exit 0, got {status}");
}

#[tokio::test]
async fn guest_agent_tunnel_echoes() {
    let driver = start_null().await;
    Driver::start(&driver).await.unwrap();

    let conn = driver.guest_agent_conn().await.unwrap().unwrap();
    conn.write_all(b"PING over the pipe").await.unwrap();
    conn.close_write().await.unwrap();
    assert_eq!(read_to_end(conn.as_ref()).await, b"PING over the pipe");
    conn.close().await.unwrap();

    let status = driver.stop().await.unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn serial_console_is_read_only() {
    let driver = start_null().await;

    let console = driver.serial_console().await.unwrap().unwrap();
    assert!(matches!(
        console.write(b"typed").await,
        Err(TransportError::Unsupported { .. })
    ));
    assert_eq!(read_to_end(console.as_ref()).await, CONSOLE_BANNER.as_bytes());
    console.close().await.unwrap();

    let status = driver.stop().await.unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn registry_discovers_and_starts_null_driver() {
    let registry = DriverRegistry::new().with_external_config(config());
    registry.discover(&DiscoveryConfig::default().with_search_path(vec![PathBuf::from(NULL_DRIVER)]));
    assert_eq!(registry.list(), vec!["null (external)"]);

    let driver = registry.get("null").await.unwrap();
    assert_eq!(driver.info().await.unwrap().name, "null");

    let again = registry.start_external("null").await.unwrap();
    assert!(again.is_connected());
    registry.shutdown().await;
}
