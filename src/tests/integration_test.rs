use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::config::{BrokerSettings, ClientSettings};
use crate::document::Document;
use crate::transport::address::{self, BusAddress};
use crate::transport::frame::Frame;
use crate::transport::header::WireHeader;
use crate::transport::server::{SharedBroker, bind_listeners, lock_broker, serve};
use crate::utils::error::Error;
use crate::Connection;

struct TestBroker {
    address: String,
    broker: SharedBroker,
    task: JoinHandle<()>,
}

impl TestBroker {
    /// Stops accepting. Connections already accepted keep running.
    async fn stop(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        // the aborted accept loops drop their listeners on their next poll
        settle().await;
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start_broker_on(listen: &str, settings: BrokerSettings) -> TestBroker {
    let listeners = bind_listeners(&[listen.to_string()], true).await.unwrap();
    let address = listeners[0].local_address().unwrap().to_string();
    let broker = Arc::new(Mutex::new(Broker::new(settings)));
    let task = tokio::spawn(serve(listeners, broker.clone()));
    TestBroker {
        address,
        broker,
        task,
    }
}

async fn start_broker() -> TestBroker {
    start_broker_on("tcp://127.0.0.1:0", BrokerSettings::default()).await
}

fn client_settings(address: &str) -> ClientSettings {
    ClientSettings {
        address: address.to_string(),
        connect_attempts: 3,
        retry_delay_ms: 50,
        ..ClientSettings::default()
    }
}

async fn connect(app: &str, address: &str) -> Connection {
    Connection::connect_with(app, client_settings(address))
        .await
        .unwrap()
}

/// Lets the broker process frames written on other sockets.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn collector() -> (Arc<Mutex<Vec<Document>>>, impl FnMut(&Frame) + Send + 'static) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let callback = move |frame: &Frame| {
        sink.lock().unwrap().push(frame.document().unwrap());
    };
    (received, callback)
}

fn text(value: &str) -> Document {
    let mut doc = Document::new();
    doc.set_string("field2", value);
    doc.set_i32("field1", 1234);
    doc
}

#[tokio::test]
async fn integration_wildcard_delivery() {
    let bus = start_broker().await;
    let mut x = connect("recv", &bus.address).await;
    let mut y = connect("send", &bus.address).await;

    let (received, callback) = collector();
    assert_eq!(x.subscribe("Foo.*", callback).await.unwrap(), 1);
    settle().await;

    y.publish("Foo.Bar", &text("hello world")).await.unwrap();
    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![text("hello world")]);

    y.publish("Baz.Bar", &text("not for you")).await.unwrap();
    let err = x.dispatch(Some(Duration::from_millis(300))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn integration_send_uses_document_topic() {
    let bus = start_broker().await;
    let mut x = connect("recv", &bus.address).await;
    let mut y = connect("send", &bus.address).await;

    let (received, callback) = collector();
    x.subscribe("A.B.C.>", callback).await.unwrap();
    settle().await;

    let mut doc = text("routed by field");
    doc.set_send_topic("A.B.C.FOO.BAR");
    y.send(&doc).await.unwrap();
    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(received.lock().unwrap()[0].send_topic(), Some("A.B.C.FOO.BAR"));

    assert!(matches!(y.send(&Document::new()).await, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn integration_request_response() {
    let bus = start_broker().await;
    let mut responder = connect("echo", &bus.address).await;
    let mut requester = connect("client", &bus.address).await;

    let requests = Arc::new(Mutex::new(Vec::<Frame>::new()));
    let sink = requests.clone();
    responder
        .subscribe("Echo.Service", move |frame: &Frame| sink.lock().unwrap().push(frame.clone()))
        .await
        .unwrap();

    let serving = tokio::spawn(async move {
        while responder.dispatch(Some(Duration::from_secs(5))).await.is_ok() {
            let pending: Vec<Frame> = requests.lock().unwrap().drain(..).collect();
            for request in pending {
                assert!(request.header.is_request());
                let mut reply = request.document().unwrap();
                reply.set_string("status", "ok");
                responder.send_response(&request.header, &reply).await.unwrap();
            }
        }
    });
    settle().await;

    let response = requester
        .request(&text("ping"), "Echo.Service", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.get_string("field2"), Some("ping"));
    assert_eq!(response.get_string("status"), Some("ok"));

    // the slot is free again for a second request
    let response = requester
        .request(&text("again"), "Echo.Service", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.get_string("field2"), Some("again"));

    serving.abort();
}

#[tokio::test]
async fn integration_request_times_out_after_full_budget() {
    let bus = start_broker().await;
    let mut requester = connect("client", &bus.address).await;

    let budget = Duration::from_millis(400);
    let started = Instant::now();
    let err = requester
        .request(&text("anyone?"), "Nobody.Home", budget)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= budget);
    assert!(elapsed < budget + Duration::from_millis(200), "took {elapsed:?}");

    // still usable
    requester.publish("Nobody.Home", &text("still here")).await.unwrap();
}

#[tokio::test]
async fn integration_send_reconnects_and_replays_subscriptions() {
    let bus = start_broker().await;
    let mut x = connect("recv", &bus.address).await;
    let mut y = connect("send", &bus.address).await;

    let (received, callback) = collector();
    x.subscribe("Foo.*", callback).await.unwrap();
    settle().await;

    x.shutdown_transport().await.unwrap();
    settle().await;
    // the broker dropped x and its routes with it
    assert_eq!(lock_broker(&bus.broker).client_count(), 1);

    // the write hits the dead stream, reconnects, replays and retries
    x.publish("Other.Topic", &text("wake up")).await.unwrap();
    settle().await;
    assert_eq!(lock_broker(&bus.broker).client_count(), 2);

    y.publish("Foo.Bar", &text("after reconnect")).await.unwrap();
    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![text("after reconnect")]);
    assert_eq!(x.subscription_count(), 1);
}

#[tokio::test]
async fn integration_dispatch_reconnects_after_broker_hangup() {
    let bus = start_broker().await;
    let mut x = connect("recv", &bus.address).await;
    let mut y = connect("send", &bus.address).await;

    let (received, callback) = collector();
    x.subscribe("Foo.*", callback).await.unwrap();
    settle().await;

    x.shutdown_transport().await.unwrap();
    // sees end-of-stream, reconnects, then runs out of time waiting
    let err = x.dispatch(Some(Duration::from_millis(500))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    settle().await;

    y.publish("Foo.Bar", &text("welcome back")).await.unwrap();
    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![text("welcome back")]);
}

#[tokio::test]
async fn integration_close_purges_routes() {
    let bus = start_broker().await;
    let mut x = connect("recv", &bus.address).await;
    let (_received, callback) = collector();
    x.subscribe("Foo.*", callback).await.unwrap();
    settle().await;
    // control route, inbox route, Foo.*
    assert_eq!(lock_broker(&bus.broker).route_count(), 3);

    x.close().await.unwrap();
    settle().await;
    assert_eq!(lock_broker(&bus.broker).route_count(), 1);
    assert_eq!(lock_broker(&bus.broker).client_count(), 0);

    let err = x.publish("Foo.Bar", &text("too late")).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)));
    settle().await;
    assert_eq!(lock_broker(&bus.broker).client_count(), 0);
}

#[tokio::test]
async fn integration_broker_skips_undecodable_frames() {
    let bus = start_broker().await;
    let mut x = connect("recv", &bus.address).await;
    let (received, callback) = collector();
    x.subscribe("Foo.*", callback).await.unwrap();
    settle().await;

    let target: BusAddress = bus.address.parse().unwrap();
    let mut raw = address::connect(&target, true).await.unwrap();
    let bad = Frame::from_document(WireHeader::new("Foo.Bad"), &text("bad")).unwrap();
    let mut bad_bytes = bad.encode().unwrap().to_vec();
    bad_bytes[1] = 7;
    let good = Frame::from_document(WireHeader::new("Foo.Good"), &text("good")).unwrap();
    raw.writer.write_all(&bad_bytes).await.unwrap();
    raw.writer.write_all(&good.encode().unwrap()).await.unwrap();

    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![text("good")]);
}

#[tokio::test]
async fn integration_refuses_clients_beyond_capacity() {
    let bus = start_broker_on(
        "tcp://127.0.0.1:0",
        BrokerSettings {
            max_connections: 1,
            ..BrokerSettings::default()
        },
    )
    .await;
    let _first = connect("one", &bus.address).await;
    settle().await;
    // the broker drops the socket right away, so the handshake may or may not fail
    let _second = Connection::connect_with("two", client_settings(&bus.address)).await;
    settle().await;
    assert_eq!(lock_broker(&bus.broker).client_count(), 1);
}

#[tokio::test]
async fn integration_unix_socket_transport() {
    let dir = tempfile::tempdir().unwrap();
    let listen = format!("unix://{}", dir.path().join("popbus.sock").display());
    let bus = start_broker_on(&listen, BrokerSettings::default()).await;
    assert_eq!(bus.address, listen);

    let mut x = connect("recv", &bus.address).await;
    let mut y = connect("send", &bus.address).await;
    assert!(!x.remote_endpoint().is_empty());

    let (received, callback) = collector();
    x.subscribe("A.*.C", callback).await.unwrap();
    settle().await;

    y.publish("A.B.B.C", &text("no")).await.unwrap();
    y.publish("A.B.C", &text("yes")).await.unwrap();
    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![text("yes")]);
}

#[tokio::test]
async fn integration_request_budget_covers_reconnect() {
    let mut bus = start_broker().await;
    let settings = ClientSettings {
        connect_attempts: 4,
        retry_delay_ms: 1000,
        ..client_settings(&bus.address)
    };
    let mut requester = Connection::connect_with("client", settings).await.unwrap();

    bus.stop().await;
    requester.shutdown_transport().await.unwrap();
    settle().await;

    // the send has to reconnect to a broker that is gone, far longer than the budget
    let budget = Duration::from_millis(300);
    let started = Instant::now();
    let err = requester
        .request(&text("anyone?"), "Echo.Service", budget)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
    assert!(elapsed < budget + Duration::from_millis(200), "took {elapsed:?}");
}

#[tokio::test]
async fn integration_dispatch_retries_failed_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let listen = format!("unix://{}", dir.path().join("popbus.sock").display());
    let mut old = start_broker_on(&listen, BrokerSettings::default()).await;
    let mut x = connect("recv", &old.address).await;
    let (received, callback) = collector();
    x.subscribe("Foo.*", callback).await.unwrap();
    settle().await;

    old.stop().await;
    x.shutdown_transport().await.unwrap();
    // end-of-stream with nothing to reconnect to
    let err = x.dispatch(Some(Duration::from_secs(2))).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)), "got {err:?}");
    // no stream left, so the next call reconnects instead of waiting it out
    let started = Instant::now();
    let err = x.dispatch(Some(Duration::from_secs(2))).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    let bus = start_broker_on(&listen, BrokerSettings::default()).await;
    let mut y = connect("send", &bus.address).await;
    // reconnects, replays Foo.* and then waits
    let err = x.dispatch(Some(Duration::from_millis(500))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
    settle().await;

    y.publish("Foo.Bar", &text("back online")).await.unwrap();
    x.dispatch(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![text("back online")]);
}

#[tokio::test]
async fn integration_subscribe_respects_table_capacity() {
    let bus = start_broker().await;
    let settings = ClientSettings {
        max_subscriptions: 1,
        ..client_settings(&bus.address)
    };
    let mut x = Connection::connect_with("recv", settings).await.unwrap();

    assert_eq!(x.subscribe("Foo.*", |_: &Frame| {}).await.unwrap(), 1);
    let err = x.subscribe("Bar.*", |_: &Frame| {}).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert_eq!(x.subscription_count(), 1);
    settle().await;
    // control route, inbox route, Foo.*
    assert_eq!(lock_broker(&bus.broker).route_count(), 3);
}

#[tokio::test]
async fn integration_unsent_subscribe_is_rolled_back() {
    let bus = start_broker().await;
    let settings = ClientSettings {
        max_subscriptions: 1,
        ..client_settings(&bus.address)
    };
    let mut x = Connection::connect_with("recv", settings).await.unwrap();
    x.close().await.unwrap();

    let err = x.subscribe("Foo.*", |_: &Frame| {}).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)));
    assert_eq!(x.subscription_count(), 0);

    // a closed connection never waits on a stream it no longer has
    let err = x.dispatch(None).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)));
}
