//! Full-duplex byte forwarding between two connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::net::{Conn, HalfCloseSupport};

const BUFFER_SIZE: usize = 32 * 1024;

/// How long copy tasks get to notice their endpoints were closed before
/// they are aborted.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one copy direction.
#[derive(Debug, Default)]
pub struct DirectionReport {
    pub bytes: u64,
    /// First error that stopped this direction, if any.
    pub error: Option<TransportError>,
}

#[derive(Debug, Default)]
pub struct BicopyReport {
    pub x_to_y: DirectionReport,
    pub y_to_x: DirectionReport,
    /// The quit token fired before both directions finished.
    pub cancelled: bool,
}

impl BicopyReport {
    pub fn first_error(&self) -> Option<&TransportError> {
        self.x_to_y.error.as_ref().or(self.y_to_x.error.as_ref())
    }
}

/// Copies bytes between `x` and `y` in both directions until both reach
/// end-of-stream (or fail), or until `quit` fires.
///
/// A direction that finishes half-closes: `close_read` on its source and
/// `close_write` on its destination, each only if that endpoint supports
/// it. Afterwards both endpoints are closed and both copy tasks have
/// terminated.
pub async fn bicopy(
    x: Arc<dyn Conn>,
    y: Arc<dyn Conn>,
    quit: Option<CancellationToken>,
) -> BicopyReport {
    let x_caps = x.half_close_support();
    let y_caps = y.half_close_support();
    let x_to_y_bytes = Arc::new(AtomicU64::new(0));
    let y_to_x_bytes = Arc::new(AtomicU64::new(0));

    let mut x_to_y = tokio::spawn(broker(
        "x_to_y",
        Arc::clone(&x),
        Arc::clone(&y),
        x_caps,
        y_caps,
        Arc::clone(&x_to_y_bytes),
    ));
    let mut y_to_x = tokio::spawn(broker(
        "y_to_x",
        Arc::clone(&y),
        Arc::clone(&x),
        y_caps,
        x_caps,
        Arc::clone(&y_to_x_bytes),
    ));

    let quit = quit.unwrap_or_default();
    let mut x_to_y_done = None;
    let mut y_to_x_done = None;
    let cancelled = loop {
        if x_to_y_done.is_some() && y_to_x_done.is_some() {
            break false;
        }
        tokio::select! {
            _ = quit.cancelled() => break true,
            joined = &mut x_to_y, if x_to_y_done.is_none() => x_to_y_done = Some(flatten(joined)),
            joined = &mut y_to_x, if y_to_x_done.is_none() => y_to_x_done = Some(flatten(joined)),
        }
    };
    if cancelled {
        tracing::debug!("Bicopy cancelled, closing both ends");
    }

    let (x_closed, y_closed) = tokio::join!(x.close(), y.close());
    for (side, closed) in [("x", x_closed), ("y", y_closed)] {
        if let Err(e) = closed {
            tracing::debug!(side, error = %e, "Close after copy failed");
        }
    }

    let x_to_y_error = match x_to_y_done {
        Some(error) => error,
        None => finish(x_to_y).await,
    };
    let y_to_x_error = match y_to_x_done {
        Some(error) => error,
        None => finish(y_to_x).await,
    };

    BicopyReport {
        x_to_y: DirectionReport {
            bytes: x_to_y_bytes.load(Ordering::Relaxed),
            error: x_to_y_error,
        },
        y_to_x: DirectionReport {
            bytes: y_to_x_bytes.load(Ordering::Relaxed),
            error: y_to_x_error,
        },
        cancelled,
    }
}

async fn broker(
    direction: &'static str,
    src: Arc<dyn Conn>,
    dst: Arc<dyn Conn>,
    src_caps: HalfCloseSupport,
    dst_caps: HalfCloseSupport,
    copied: Arc<AtomicU64>,
) -> Option<TransportError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let error = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Some(e);
        }
        copied.fetch_add(n as u64, Ordering::Relaxed);
    };
    match &error {
        None => tracing::trace!(direction, "Copy reached end-of-stream"),
        Some(e) => tracing::debug!(direction, error = %e, "Copy stopped"),
    }

    if src_caps.read {
        if let Err(e) = src.close_read().await {
            tracing::debug!(direction, error = %e, "close_read failed");
        }
    }
    if dst_caps.write {
        if let Err(e) = dst.close_write().await {
            tracing::debug!(direction, error = %e, "close_write failed");
        }
    }
    error
}

fn flatten(
    joined: Result<Option<TransportError>, tokio::task::JoinError>,
) -> Option<TransportError> {
    joined.unwrap_or_else(|e| Some(TransportError::invariant(format!("copy task failed: {e}"))))
}

async fn finish(mut handle: JoinHandle<Option<TransportError>>) -> Option<TransportError> {
    match tokio::time::timeout(JOIN_GRACE, &mut handle).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            tracing::warn!("Copy task ignored close, aborting");
            handle.abort();
            let _ = handle.await;
            Some(TransportError::Closed)
        }
    }
}
