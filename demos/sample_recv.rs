//! Prints everything published under `A.*.C` and `A.B.C.>`.

use popbus::config::load_config;
use popbus::transport::Frame;
use popbus::utils::logging;
use popbus::Connection;
use tracing::{info, warn};

fn on_message(frame: &Frame) {
    match frame.document() {
        Ok(doc) => info!(topic = %frame.topic(), subscription = frame.header.control_data, "{doc}"),
        Err(e) => warn!(topic = %frame.topic(), error = %e, "undecodable payload"),
    }
}

#[tokio::main]
async fn main() -> popbus::Result<()> {
    logging::init("info");
    let settings = load_config()?;
    let mut con = Connection::connect_with("APP2", settings.client).await?;
    con.subscribe("A.*.C", on_message).await?;
    con.subscribe("A.B.C.>", on_message).await?;

    loop {
        con.dispatch(None).await?;
    }
}
