//! Transports that carry the driver RPC protocol.
//!
//! Currently only the stdio pipe transport: the parent talks to a driver
//! child process over its stdin/stdout, and the driver serves over its own.

pub mod pipe;

pub use pipe::{PipeConn, PipeListener};
