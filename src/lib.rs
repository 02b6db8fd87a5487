//! # popbus
//!
//! `popbus` is a lightweight publish/subscribe message bus for processes on
//! one host. A broker daemon (`popbusd`) accepts stream connections over TCP
//! or unix-domain sockets and forwards topic-addressed frames to every
//! subscriber whose pattern matches; the client library publishes
//! documents, subscribes with wildcard patterns and performs
//! request/response through a private inbox.
//!
//! ## Core Modules
//!
//! - `document`: the structured payload carried by every message, with its text encoding.
//! - `transport`: the binary wire header, frame decoding, addresses and the broker's server loop.
//! - `broker`: the route table, wildcard topic matching and message forwarding.
//! - `client`: `Connection`, the application-side handle to the broker.
//! - `config`: layered settings loaded from a file and the environment.
//! - `utils`: the error type, logging setup and the broker's PID-file lock.
//!
//! ```no_run
//! use std::time::Duration;
//! use popbus::{Connection, Document};
//!
//! # async fn demo() -> popbus::Result<()> {
//! let mut conn = Connection::connect("sample", "tcp://127.0.0.1:10001").await?;
//! conn.subscribe("A.*.C", |frame| {
//!     if let Ok(doc) = frame.document() {
//!         println!("{}: {doc}", frame.topic());
//!     }
//! })
//! .await?;
//!
//! let mut doc = Document::new();
//! doc.set_string("field1", "hello");
//! conn.publish("A.B.C", &doc).await?;
//! conn.dispatch(Some(Duration::from_secs(1))).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod document;
pub mod transport;
pub mod utils;

pub use client::Connection;
pub use document::Document;
pub use transport::{Frame, MessageFlags, WireHeader};
pub use utils::error::{Error, Result};

#[cfg(test)]
mod tests;
