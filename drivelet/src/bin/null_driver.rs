//! `drivelet-driver-null`: serves the null driver over stdio.

use std::sync::Arc;

use anyhow::Context;
use drivelet::driver::NullDriver;
use drivelet::driver::server::{exit_with, serve_stdio};

fn main() -> anyhow::Result<()> {
    drivelet::logging::init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(serve_stdio(Arc::new(NullDriver::new())));
    exit_with(result)
}
