//! The `broker` module holds the routing side of the bus.
//!
//! It keeps the table of connected clients and their subscription routes,
//! interprets the `_ROUTER.` control topics, and forwards every other frame
//! to the subscribers whose expressions match its topic.

pub mod client;
pub mod engine;
pub mod route;
pub mod topic;

pub use engine::Broker;

#[cfg(test)]
mod tests;
