//! The `client` module is the application side of the bus.
//!
//! `Connection` publishes documents, registers subscription callbacks,
//! performs blocking-style request/response through its private inbox and
//! recovers from broker restarts by reconnecting and replaying its
//! subscriptions.

pub mod connection;
pub mod subscription;

pub use connection::Connection;
pub use subscription::{MessageCallback, SubscriptionTable};
