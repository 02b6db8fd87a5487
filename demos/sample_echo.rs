//! Answers requests on `RDK.MODEL.ECHO` with a copy of the request plus a
//! `status` field, then sends one request to itself through a second
//! connection to show the round trip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use popbus::config::load_config;
use popbus::transport::Frame;
use popbus::utils::logging;
use popbus::{Connection, Document};
use tracing::{info, warn};

const SERVICE_TOPIC: &str = "RDK.MODEL.ECHO";

#[tokio::main]
async fn main() -> popbus::Result<()> {
    logging::init("info");
    let settings = load_config()?;

    let mut provider = Connection::connect_with("ECHO", settings.client.clone()).await?;
    let requests = Arc::new(Mutex::new(Vec::<Frame>::new()));
    let sink = requests.clone();
    provider
        .subscribe(SERVICE_TOPIC, move |frame: &Frame| {
            if frame.header.is_request() {
                sink.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(frame.clone());
            }
        })
        .await?;

    tokio::spawn(async move {
        loop {
            if let Err(e) = provider.dispatch(None).await {
                warn!(error = %e, "dispatch failed");
                return;
            }
            let pending: Vec<Frame> = requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            for request in pending {
                let mut reply = request.document().unwrap_or_default();
                reply.set_string("status", "ok");
                if let Err(e) = provider.send_response(&request.header, &reply).await {
                    warn!(error = %e, "failed to respond");
                }
            }
        }
    });

    let mut client = Connection::connect_with("CLIENT", settings.client).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut params = Document::new();
    params.set_string("name", "Device.DeviceInfo.ModelName");
    let mut request = Document::new();
    request.set_string("method", "get");
    request.set_string("provider", "echo");
    request.set_document("params", &params);

    let response = client
        .request(&request, SERVICE_TOPIC, Duration::from_secs(2))
        .await?;
    info!(%response, "got response");

    tokio::signal::ctrl_c().await?;
    Ok(())
}
