//! Broker stream server
//!
//! One accept loop runs per listener. Every accepted connection gets:
//! - a registration with the `Broker`, refused when it has no free slot
//! - a writer task draining that client's bounded outbound frame queue
//! - a read loop decoding frames and handing them to the broker
//!
//! Undecodable frames are logged and skipped. End-of-stream, I/O errors and
//! unrecoverable framing errors close the connection and purge its routes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::transport::address::{BusAddress, Listener, Transport};
use crate::transport::frame::{Frame, FrameReader};
use crate::utils::error::{Error, Result};

pub type SharedBroker = Arc<Mutex<Broker>>;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Locks the broker, recovering the state if a previous holder panicked.
pub fn lock_broker(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Binds every listen address, failing on the first that cannot be bound.
pub async fn bind_listeners(addresses: &[String], no_delay: bool) -> Result<Vec<Listener>> {
    if addresses.is_empty() {
        return Err(Error::InvalidArgument("no listen address given".to_string()));
    }
    let mut listeners = Vec::with_capacity(addresses.len());
    for address in addresses {
        let parsed: BusAddress = address.parse()?;
        let listener = Listener::bind(&parsed, no_delay).await.map_err(|e| {
            error!(%address, error = %e, "failed to bind listener");
            e
        })?;
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Serves clients on every listener until all accept loops end.
pub async fn serve(listeners: Vec<Listener>, broker: SharedBroker) {
    let mut accept_loops = JoinSet::new();
    for listener in listeners {
        accept_loops.spawn(accept_loop(listener, broker.clone()));
    }
    while let Some(result) = accept_loops.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "accept loop failed");
        }
    }
}

async fn accept_loop(listener: Listener, broker: SharedBroker) {
    match listener.local_address() {
        Ok(address) => info!(%address, "broker listening"),
        Err(e) => warn!(error = %e, "listening on an unknown address"),
    }

    loop {
        match listener.accept().await {
            Ok(transport) => {
                tokio::spawn(handle_client(transport, broker.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle_client(transport: Transport, broker: SharedBroker) {
    let Transport {
        reader,
        mut writer,
        peer,
        ..
    } = transport;

    let (client_id, max_payload_length, mut rx) = {
        let mut broker = lock_broker(&broker);
        let (tx, rx) = mpsc::channel::<Frame>(broker.settings().outbound_queue_length.max(1));
        match broker.register_client(&peer, tx) {
            Ok(id) => (id, broker.settings().max_payload_length, rx),
            Err(e) => {
                warn!(%peer, error = %e, "refusing connection");
                return;
            }
        }
    };
    let ident = format!("{peer}/{client_id}");

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let do_cleanup = {
        let broker = broker.clone();
        let cleanup_called = cleanup_called.clone();
        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                lock_broker(&broker).cleanup_client(client_id);
            }
        }
    };

    {
        let ident = ident.clone();
        let do_cleanup = do_cleanup.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(client = %ident, error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(client = %ident, error = %e, "failed to send to client");
                    break;
                }
            }
            let _ = writer.shutdown().await;
            do_cleanup();
            debug!(client = %ident, "send loop closed");
        });
    }

    let mut frames = FrameReader::new(reader, max_payload_length);
    loop {
        match frames.read_frame().await {
            Ok(Some(frame)) => {
                lock_broker(&broker).route_frame(client_id, &frame);
            }
            Ok(None) => {
                info!(client = %ident, "client disconnected");
                break;
            }
            Err(Error::Decode(reason)) => {
                warn!(client = %ident, %reason, "dropping undecodable frame");
            }
            Err(e) => {
                warn!(client = %ident, error = %e, "closing client connection");
                break;
            }
        }
    }

    do_cleanup();
}
