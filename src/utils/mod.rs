//! The `utils` module provides the pieces shared by the broker daemon and the
//! client library: the crate error type, logging setup and the PID-file lock
//! used to keep a single broker per host.

pub mod error;
pub mod logging;
pub mod pidfile;
