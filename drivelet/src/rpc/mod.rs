//! Framed RPC over a single [`Conn`](crate::net::Conn).
//!
//! # Architecture
//!
//! - **codec**: length-prefixed JSON frames over a connection
//! - **protocol**: frame types, call ids, wire status
//! - **session**: one connection's reader loop, call/stream routing, keepalive
//! - **server** / **client**: the two ends of a session
//! - **stream**: message streams for streaming calls
//!
//! A session multiplexes unary calls and streaming calls by call id. Only the
//! client initiates calls.

pub mod client;
pub mod codec;
pub mod error;
pub mod keepalive;
pub mod protocol;
pub mod server;
mod session;
pub mod stream;

pub use client::RpcClient;
pub use error::RpcError;
pub use keepalive::{EnforcementPolicy, KeepaliveConfig, KeepaliveParams};
pub use protocol::{CallId, Frame, RpcStatus, StatusCode};
pub use server::{RpcServer, Service};
pub use stream::{ClientStream, MAX_DATA_CHUNK, ServerStream};
