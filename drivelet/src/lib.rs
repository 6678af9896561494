//! drivelet: out-of-process VM driver transport.
//!
//! Drivers run as child processes and speak a framed RPC protocol over
//! their stdin/stdout. Raw byte streams (guest agent sockets, serial
//! consoles) are tunneled through streaming calls and exposed on both ends
//! as ordinary [`Conn`]s.

pub mod bicopy;
pub mod driver;
pub mod error;
pub mod hijack;
pub mod logging;
pub mod net;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use bicopy::{BicopyReport, DirectionReport, bicopy};
pub use driver::{Driver, DriverClient, DriverError, DriverInfo, ExternalDriver, NullDriver};
pub use error::TransportError;
pub use hijack::{HijackConfig, MessageStream, ReadOnlyStreamConn, StreamConn};
pub use net::{Conn, ConnAddr, HalfCloseSupport, IoConn, Listener};
pub use registry::{DiscoveryConfig, DriverRegistry, RegistryError};
pub use transport::{PipeConn, PipeListener};
