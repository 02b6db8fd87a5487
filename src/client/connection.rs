//! Client connection to the broker
//!
//! A `Connection` owns one stream to the broker. A background task decodes
//! inbound frames: responses to this connection's inbox fill the pending
//! request slot, everything else is queued for `dispatch`, which runs the
//! matching subscription callback.
//!
//! When a send fails because the stream is gone the connection reconnects,
//! says HELLO again and replays every subscription before retrying, since
//! the broker forgets a client's routes when it disconnects.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::engine::{HELLO_TOPIC, INBOX_SUBSCRIPTION_ID, SUBSCRIBE_TOPIC};
use crate::client::subscription::SubscriptionTable;
use crate::config::ClientSettings;
use crate::document::Document;
use crate::transport::address::{self, BoxedReader, BoxedWriter, BusAddress, Transport};
use crate::transport::frame::{Frame, FrameReader};
use crate::transport::header::{MessageFlags, WireHeader, validate_topic};
use crate::utils::error::{Error, Result};

type PendingResponse = Arc<Mutex<Option<oneshot::Sender<Frame>>>>;

/// What the reader task hands to `dispatch`.
#[derive(Debug)]
enum Inbound {
    Frame(Frame),
    /// The stream of reader `generation` ended.
    Closed {
        generation: u64,
        error: Option<Error>,
    },
}

pub struct Connection {
    app_name: String,
    address: BusAddress,
    settings: ClientSettings,
    inbox: String,
    writer: Option<BoxedWriter>,
    local_endpoint: String,
    remote_endpoint: String,
    sequence_number: u32,
    subscriptions: SubscriptionTable,
    pending_response: PendingResponse,
    inbound_tx: UnboundedSender<Inbound>,
    inbound_rx: UnboundedReceiver<Inbound>,
    reader_task: Option<JoinHandle<()>>,
    /// Bumped on every (re)connect so stale end-of-stream events are ignored
    generation: u64,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("app_name", &self.app_name)
            .field("address", &self.address)
            .field("inbox", &self.inbox)
            .field("local_endpoint", &self.local_endpoint)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("subscriptions", &self.subscriptions.len())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects to the broker at `address` with default client settings.
    pub async fn connect(app_name: &str, address: &str) -> Result<Connection> {
        let settings = ClientSettings {
            address: address.to_string(),
            ..ClientSettings::default()
        };
        Self::connect_with(app_name, settings).await
    }

    /// Connects using explicit settings, retrying up to
    /// `settings.connect_attempts` times.
    pub async fn connect_with(app_name: &str, settings: ClientSettings) -> Result<Connection> {
        if app_name.is_empty() || app_name.contains(['.', '*', '>']) {
            return Err(Error::InvalidArgument(format!(
                "invalid application name '{app_name}'"
            )));
        }
        let address: BusAddress = settings.address.parse()?;
        let inbox = format!("{app_name}.INBOX.{}", Uuid::new_v4().simple());
        validate_topic("inbox", &inbox)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut connection = Connection {
            app_name: app_name.to_string(),
            address,
            subscriptions: SubscriptionTable::new(settings.max_subscriptions),
            settings,
            inbox,
            writer: None,
            local_endpoint: String::new(),
            remote_endpoint: String::new(),
            sequence_number: 1,
            pending_response: Arc::new(Mutex::new(None)),
            inbound_tx,
            inbound_rx,
            reader_task: None,
            generation: 0,
            closed: false,
        };
        connection.establish().await?;
        Ok(connection)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    /// Private topic this connection receives responses on.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub fn local_endpoint(&self) -> &str {
        &self.local_endpoint
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publishes `document` on `topic`. Nothing is awaited from subscribers.
    pub async fn publish(&mut self, topic: &str, document: &Document) -> Result<()> {
        self.send_frame(WireHeader::new(topic), document.encode()?)
            .await
    }

    /// Publishes an opaque payload on `topic`.
    pub async fn publish_bytes(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        self.send_frame(WireHeader::new(topic), payload).await
    }

    /// Publishes `document` on its own send topic, see
    /// `Document::set_send_topic`.
    pub async fn send(&mut self, document: &Document) -> Result<()> {
        let topic = document
            .send_topic()
            .ok_or_else(|| Error::InvalidArgument("document has no send topic".to_string()))?
            .to_string();
        self.publish(&topic, document).await
    }

    /// Answers a request received through a subscription callback.
    pub async fn send_response(&mut self, request: &WireHeader, document: &Document) -> Result<()> {
        let reply_topic = request.reply_topic.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "message on '{}' has no reply topic",
                request.topic
            ))
        })?;
        let header = WireHeader::new(reply_topic).with_flags(MessageFlags::RESPONSE);
        self.send_frame(header, document.encode()?).await
    }

    /// Subscribes `callback` to frames whose topic matches `expression`.
    /// Callbacks run inside `dispatch`.
    pub async fn subscribe<F>(&mut self, expression: &str, callback: F) -> Result<u32>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        validate_topic("expression", expression)?;
        let id = self.subscriptions.insert(expression, Box::new(callback))?;
        let (header, payload) = subscribe_message(expression, id)?;
        if let Err(e) = self.send_frame(header, payload).await {
            self.subscriptions.remove(id);
            return Err(e);
        }
        debug!(expression, id, "subscribed");
        Ok(id)
    }

    /// Sends `document` to `topic` as a request and waits for the response.
    ///
    /// Fails with `Error::Timeout` once `timeout` has passed since the call
    /// started, including time spent reconnecting to send the request. The
    /// connection stays usable. One request at a time.
    pub async fn request(
        &mut self,
        document: &Document,
        topic: &str,
        timeout: Duration,
    ) -> Result<Document> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        *self.pending_slot() = Some(tx);

        let header = WireHeader::new(topic)
            .with_flags(MessageFlags::REQUEST)
            .with_reply_topic(self.inbox.clone());
        let sent = match document.encode() {
            Ok(payload) => match timeout_at(deadline, self.send_frame(header, payload)).await {
                Ok(sent) => sent,
                Err(_) => {
                    // the abandoned write may have left half a frame on the stream
                    self.teardown();
                    Err(Error::Timeout)
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.pending_slot().take();
            return Err(e);
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(frame)) => frame.document(),
            Ok(Err(_)) => Err(Error::ConnectionLost(io::Error::new(
                io::ErrorKind::NotConnected,
                "response slot dropped",
            ))),
            Err(_) => {
                self.pending_slot().take();
                Err(Error::Timeout)
            }
        }
    }

    /// Waits for one inbound frame and runs the subscription callback it is
    /// addressed to. Frames for unknown subscriptions are dropped.
    ///
    /// `None` waits without a limit. If the stream ended, or an earlier
    /// reconnect failed and left no stream, the connection is re-established
    /// before waiting. A failed reconnect is returned; the next call tries
    /// again.
    pub async fn dispatch(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.closed {
                return Err(Error::ConnectionLost(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection is closed",
                )));
            }
            if self.writer.is_none() {
                self.reconnect_until(deadline).await?;
            }
            let next = match deadline {
                Some(deadline) => timeout_at(deadline, self.inbound_rx.recv())
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => self.inbound_rx.recv().await,
            };
            match next {
                Some(Inbound::Frame(frame)) => {
                    if !self.subscriptions.dispatch(&frame) {
                        debug!(
                            topic = %frame.topic(),
                            id = frame.header.control_data,
                            "no subscription for message"
                        );
                    }
                    return Ok(());
                }
                Some(Inbound::Closed { generation, error }) => {
                    if generation != self.generation || self.closed {
                        continue;
                    }
                    match error {
                        Some(e) => warn!(error = %e, "lost connection to broker"),
                        None => warn!("broker closed the connection"),
                    }
                    self.teardown();
                    self.reconnect_until(deadline).await?;
                }
                // unreachable while we hold inbound_tx
                None => {
                    return Err(Error::ConnectionLost(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "reader channel closed",
                    )));
                }
            }
        }
    }

    /// Shuts the stream down. The broker sees end-of-stream and drops this
    /// client's routes. Later sends fail without reconnecting.
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.pending_slot().take();
        if let Some(mut writer) = self.writer.take() {
            match writer.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(inbox = %self.inbox, "connection closed");
        Ok(())
    }

    async fn send_frame(&mut self, header: WireHeader, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionLost(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }
        if payload.len() > self.settings.max_payload_length {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                self.settings.max_payload_length
            )));
        }
        let header = header.with_sequence_number(self.next_sequence_number());
        let bytes = Frame::new(header, payload).encode()?;

        let attempts = self.settings.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.write_bytes(&bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !err.is_reconnectable() || attempt >= attempts {
                return Err(err);
            }
            attempt += 1;
            warn!(error = %err, attempt, "send failed, reconnecting");
            if let Err(e) = self.reconnect().await {
                warn!(error = %e, "reconnect failed");
            }
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::ConnectionLost(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
        })?;
        writer.write_all(bytes).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        info!(address = %self.address, "reconnecting to broker");
        self.establish().await
    }

    async fn reconnect_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        match deadline {
            Some(deadline) => timeout_at(deadline, self.reconnect())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.reconnect().await,
        }
    }

    /// Opens a fresh stream, announces the inbox and replays subscriptions.
    ///
    /// The new stream is only installed once the handshake is written, so a
    /// failure or cancellation at any await leaves the connection without a
    /// stream and the next operation reconnects.
    async fn establish(&mut self) -> Result<()> {
        self.teardown();
        let Transport {
            reader,
            mut writer,
            local,
            peer,
        } = open(&self.address, &self.settings).await?;

        let mut hello = Document::new();
        hello.set_string("inbox", self.inbox.as_str());
        self.write_control(&mut writer, HELLO_TOPIC, hello.encode()?)
            .await?;

        let replay: Vec<(u32, String)> = self
            .subscriptions
            .iter()
            .map(|(id, expression)| (id, expression.to_string()))
            .collect();
        for (id, expression) in &replay {
            let (header, payload) = subscribe_message(expression, *id)?;
            self.write_control(&mut writer, &header.topic, payload)
                .await?;
        }

        self.generation += 1;
        self.reader_task = Some(tokio::spawn(read_loop(
            reader,
            self.settings.max_payload_length,
            self.generation,
            self.inbound_tx.clone(),
            self.pending_response.clone(),
        )));
        self.writer = Some(writer);
        info!(local = %local, remote = %peer, inbox = %self.inbox, "connected to broker");
        self.local_endpoint = local;
        self.remote_endpoint = peer;
        if !replay.is_empty() {
            info!(subscriptions = replay.len(), "replayed subscriptions");
        }
        Ok(())
    }

    /// Single write with no retry, used while (re)connecting.
    async fn write_control(
        &mut self,
        writer: &mut BoxedWriter,
        topic: &str,
        payload: Bytes,
    ) -> Result<()> {
        let header = WireHeader::new(topic).with_sequence_number(self.next_sequence_number());
        let bytes = Frame::new(header, payload).encode()?;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
    }

    fn next_sequence_number(&mut self) -> u32 {
        let n = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        n
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<Frame>>> {
        self.pending_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Half-closes the current stream as if the broker had vanished, so the
    /// reconnect path can be exercised.
    #[cfg(test)]
    pub(crate) async fn shutdown_transport(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Connects with up to `connect_attempts` tries, `retry_delay` apart.
async fn open(address: &BusAddress, settings: &ClientSettings) -> Result<Transport> {
    let attempts = settings.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match address::connect(address, settings.no_delay).await {
            Ok(transport) => return Ok(transport),
            Err(e) if attempt < attempts => {
                debug!(%address, error = %e, attempt, "connect failed, retrying");
                attempt += 1;
                tokio::time::sleep(settings.retry_delay()).await;
            }
            Err(Error::Io(e)) => return Err(Error::ConnectionLost(e)),
            Err(e) => return Err(e),
        }
    }
}

fn subscribe_message(expression: &str, id: u32) -> Result<(WireHeader, Bytes)> {
    let route_id = i32::try_from(id)
        .map_err(|_| Error::ResourceExhausted("subscription ids exhausted".to_string()))?;
    let mut doc = Document::new();
    doc.set_string("topic", expression);
    doc.set_i32("route_id", route_id);
    Ok((WireHeader::new(SUBSCRIBE_TOPIC), doc.encode()?))
}

async fn read_loop(
    reader: BoxedReader,
    max_payload_length: usize,
    generation: u64,
    inbound: UnboundedSender<Inbound>,
    pending: PendingResponse,
) {
    let mut frames = FrameReader::new(reader, max_payload_length);
    loop {
        match frames.read_frame().await {
            Ok(Some(frame)) => {
                if frame.header.is_response() && frame.header.control_data == INBOX_SUBSCRIPTION_ID
                {
                    let waiter = pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(frame);
                        }
                        None => debug!(topic = %frame.topic(), "response with no request waiting"),
                    }
                    continue;
                }
                if inbound.send(Inbound::Frame(frame)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = inbound.send(Inbound::Closed {
                    generation,
                    error: None,
                });
                return;
            }
            Err(Error::Decode(reason)) => {
                warn!(%reason, "dropping undecodable frame");
            }
            Err(e) => {
                let _ = inbound.send(Inbound::Closed {
                    generation,
                    error: Some(e),
                });
                return;
            }
        }
    }
}
