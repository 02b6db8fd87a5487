//! The `transport` module carries frames between clients and the broker.
//!
//! It defines the binary wire header, the frame decoder shared by both ends
//! of a connection, address parsing for TCP and unix-domain sockets, and the
//! broker's accept/read/write server loop.

pub mod address;
pub mod frame;
pub mod header;
pub mod server;

pub use address::{BusAddress, Listener};
pub use frame::Frame;
pub use header::{MessageFlags, WireHeader};
