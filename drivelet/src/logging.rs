//! Tracing setup for drivelet processes.
//!
//! Logs always go to stderr: in a driver process stdout carries the RPC
//! protocol, and the parent forwards stderr lines into its own log.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Environment variable selecting the drivelet log level when `RUST_LOG`
/// is unset.
pub const LOG_LEVEL_ENV: &str = "DRIVELET_LOG";

/// `RUST_LOG` wins; otherwise `DRIVELET_LOG` (`debug`, `warn`, `error`,
/// default `info`) applies to drivelet targets.
pub fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = level_from(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
    EnvFilter::new(format!(
        "drivelet={level},drivelet::rpc::codec=off,drivelet_driver_null={level}"
    ))
}

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Installs the global subscriber. `LOG_FORMAT=json` selects JSON lines.
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = env_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
