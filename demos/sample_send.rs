//! Publishes a document on `A.B.C` and another on `A.B.C.FOO.BAR` every
//! second. Pair with `sample_recv`.
//!
//! The broker address comes from `POPBUS__CLIENT__ADDRESS` or
//! `config/default`, falling back to `tcp://127.0.0.1:10001`.

use std::time::Duration;

use popbus::config::load_config;
use popbus::utils::logging;
use popbus::{Connection, Document};
use tracing::info;

#[tokio::main]
async fn main() -> popbus::Result<()> {
    logging::init("info");
    let settings = load_config()?;
    let mut con = Connection::connect_with("APP1", settings.client).await?;

    let mut count: i32 = 0;
    loop {
        let mut doc = Document::new();
        doc.set_i32("field1", count);
        doc.set_string("field2", "hello world");
        doc.set_send_topic("A.B.C");
        con.send(&doc).await?;
        info!(count, "send");
        count = count.wrapping_add(1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut doc = Document::new();
        doc.set_i32("field1", 1234);
        doc.set_send_topic("A.B.C.FOO.BAR");
        con.send(&doc).await?;
        info!("send");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
