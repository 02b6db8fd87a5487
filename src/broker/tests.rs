use super::Broker;
use super::engine::{CONTROL_EXPRESSION, HELLO_TOPIC, SUBSCRIBE_TOPIC};
use super::route::{ClientId, Route, RouteAction, RouteTable};
use super::topic::is_topic_match;
use crate::config::BrokerSettings;
use crate::document::Document;
use crate::transport::frame::Frame;
use crate::transport::header::{MessageFlags, WireHeader};
use crate::utils::error::Error;
use bytes::Bytes;
use tokio::sync::mpsc::{self, Receiver};

fn frame(topic: &str, doc: &Document) -> Frame {
    Frame::from_document(WireHeader::new(topic), doc).unwrap()
}

fn hello(inbox: &str) -> Frame {
    let mut doc = Document::new();
    doc.set_string("inbox", inbox);
    frame(HELLO_TOPIC, &doc)
}

fn subscribe(expression: &str, route_id: i32) -> Frame {
    let mut doc = Document::new();
    doc.set_string("topic", expression);
    doc.set_i32("route_id", route_id);
    frame(SUBSCRIBE_TOPIC, &doc)
}

fn connect(broker: &mut Broker, peer: &str) -> (ClientId, Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(16);
    let id = broker.register_client(peer, tx).unwrap();
    (id, rx)
}

#[test]
fn test_topic_match_reference_cases() {
    assert!(is_topic_match("A.B.C", "A.*.C"));
    assert!(!is_topic_match("A.B.B.C", "A.*.C"));
    assert!(is_topic_match("A.B.C.D", "A.B.>"));
    assert!(is_topic_match("A.B", "A.B.>"));
    assert!(!is_topic_match("A.C", "A.*.C"));
}

#[test]
fn test_topic_match_more_cases() {
    assert!(is_topic_match("Foo.Bar", "Foo.Bar"));
    assert!(!is_topic_match("Foo.Bar", "Foo.Baz"));
    assert!(!is_topic_match("Foo.Bar.Baz", "Foo.Bar"));
    assert!(!is_topic_match("Foo", "Foo.Bar"));
    assert!(is_topic_match("Foo.Bar", "Foo.*"));
    assert!(!is_topic_match("Foo.Bar.Baz", "Foo.*"));
    assert!(!is_topic_match("Baz.Bar", "Foo.*"));
    assert!(is_topic_match("anything.at.all", ">"));
    assert!(is_topic_match("A", "*"));
    assert!(is_topic_match("_ROUTER.INBOX.HELLO", CONTROL_EXPRESSION));
    assert!(!is_topic_match("A..C", "A.*.C"));
    assert!(!is_topic_match("A.BC", "A.B"));
}

#[test]
fn test_route_table_ignores_duplicates_and_fills_up() {
    let mut table = RouteTable::new(2);
    assert!(table.add(Route::forward("A.*", 1, 7)).unwrap());
    assert!(!table.add(Route::forward("A.*", 1, 7)).unwrap());
    assert!(table.add(Route::forward("A.*", 2, 7)).unwrap());
    assert_eq!(table.len(), 2);
    assert!(matches!(
        table.add(Route::forward("B", 1, 8)),
        Err(Error::ResourceExhausted(_))
    ));

    let ids: Vec<u32> = table.matching("A.x").map(|r| r.subscription_id).collect();
    assert_eq!(ids, vec![1, 2]);

    assert_eq!(table.remove_client(7), 2);
    assert!(table.is_empty());
}

#[test]
fn test_new_broker_installs_builtin_routes() {
    let broker = Broker::default();
    assert_eq!(broker.route_count(), 1);
    let control = broker.routes().next().unwrap();
    assert_eq!(control.expression, CONTROL_EXPRESSION);
    assert_eq!(control.action, RouteAction::Control);

    let broker = Broker::new(BrokerSettings {
        debug_route: true,
        ..BrokerSettings::default()
    });
    assert_eq!(broker.route_count(), 2);
    assert!(broker.routes().any(|r| r.action == RouteAction::Print && r.expression == ">"));
}

#[test]
fn test_register_client_respects_max_connections() {
    let mut broker = Broker::new(BrokerSettings {
        max_connections: 2,
        ..BrokerSettings::default()
    });
    let (a, _rx_a) = connect(&mut broker, "127.0.0.1:5000");
    let (_b, _rx_b) = connect(&mut broker, "127.0.0.1:5001");
    assert_eq!(broker.client(a).unwrap().ident, format!("127.0.0.1:5000/{a}"));

    let (tx, _rx) = mpsc::channel(16);
    assert!(matches!(
        broker.register_client("127.0.0.1:5002", tx),
        Err(Error::ResourceExhausted(_))
    ));

    broker.cleanup_client(a);
    let (tx, _rx) = mpsc::channel(16);
    assert!(broker.register_client("127.0.0.1:5003", tx).is_ok());
}

#[test]
fn test_hello_registers_inbox_route() {
    let mut broker = Broker::default();
    let (id, mut rx) = connect(&mut broker, "peer");
    broker.route_frame(id, &hello("app.INBOX.1"));

    assert_eq!(broker.client(id).unwrap().inbox.as_deref(), Some("app.INBOX.1"));
    assert!(broker.routes().any(|r| r.expression == "app.INBOX.1"
        && r.subscription_id == 0
        && r.owner == Some(id)));
    // control messages are consumed, never echoed
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_forward_rewrites_only_control_data() {
    let mut broker = Broker::default();
    let (sub, mut sub_rx) = connect(&mut broker, "subscriber");
    let (publisher, mut pub_rx) = connect(&mut broker, "publisher");
    broker.route_frame(sub, &subscribe("Foo.*", 5));

    let mut doc = Document::new();
    doc.set_string("field2", "hello world");
    let sent = Frame::from_document(
        WireHeader::new("Foo.Bar")
            .with_sequence_number(42)
            .with_flags(MessageFlags::REQUEST)
            .with_reply_topic("pub.INBOX.9"),
        &doc,
    )
    .unwrap();
    broker.route_frame(publisher, &sent);

    let delivered = sub_rx.try_recv().unwrap();
    assert_eq!(delivered.header.control_data, 5);
    assert_eq!(delivered.header.sequence_number, 42);
    assert_eq!(delivered.header.reply_topic.as_deref(), Some("pub.INBOX.9"));
    assert!(delivered.header.is_request());
    assert_eq!(delivered.payload, sent.payload);
    assert_eq!(delivered.document().unwrap(), doc);
    assert!(sub_rx.try_recv().is_err());
    assert!(pub_rx.try_recv().is_err());

    broker.route_frame(publisher, &frame("Baz.Bar", &doc));
    assert!(sub_rx.try_recv().is_err());
}

#[test]
fn test_every_matching_route_gets_a_copy() {
    let mut broker = Broker::default();
    let (a, mut rx_a) = connect(&mut broker, "a");
    let (b, mut rx_b) = connect(&mut broker, "b");
    broker.route_frame(a, &subscribe("A.>", 1));
    broker.route_frame(a, &subscribe("A.B", 2));
    broker.route_frame(b, &subscribe("*.B", 1));

    broker.route_frame(b, &Frame::new(WireHeader::new("A.B"), Bytes::from_static(b"{}")));

    let ids: Vec<u32> = std::iter::from_fn(|| rx_a.try_recv().ok())
        .map(|f| f.header.control_data)
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(rx_b.try_recv().unwrap().header.control_data, 1);
}

#[test]
fn test_resubscribe_is_idempotent() {
    let mut broker = Broker::default();
    let (id, mut rx) = connect(&mut broker, "peer");
    broker.route_frame(id, &subscribe("Foo.*", 1));
    broker.route_frame(id, &subscribe("Foo.*", 1));
    assert_eq!(broker.route_count(), 2);

    broker.route_frame(id, &frame("Foo.Bar", &Document::new()));
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_dead_subscriber_routes_are_purged_on_forward() {
    let mut broker = Broker::default();
    let (gone, rx) = connect(&mut broker, "gone");
    let (publisher, _rx) = connect(&mut broker, "publisher");
    broker.route_frame(gone, &subscribe("Foo.*", 1));
    broker.route_frame(gone, &subscribe("Bar", 2));
    assert_eq!(broker.route_count(), 3);

    drop(rx);
    broker.route_frame(publisher, &frame("Foo.Bar", &Document::new()));
    assert_eq!(broker.route_count(), 1);
}

#[test]
fn test_stalled_subscriber_is_purged_when_its_queue_fills() {
    let mut broker = Broker::default();
    let (tx, mut rx) = mpsc::channel(1);
    let stalled = broker.register_client("stalled", tx).unwrap();
    let (publisher, _rx) = connect(&mut broker, "publisher");
    broker.route_frame(stalled, &subscribe("Foo.*", 1));
    assert_eq!(broker.route_count(), 2);

    broker.route_frame(publisher, &frame("Foo.Bar", &Document::new()));
    assert_eq!(broker.route_count(), 2);
    // nothing drained: the second frame does not fit
    broker.route_frame(publisher, &frame("Foo.Baz", &Document::new()));
    assert_eq!(broker.route_count(), 1);
    assert_eq!(broker.client_count(), 2);

    assert_eq!(rx.try_recv().unwrap().topic(), "Foo.Bar");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_cleanup_client_removes_routes() {
    let mut broker = Broker::default();
    let (id, _rx) = connect(&mut broker, "peer");
    broker.route_frame(id, &hello("app.INBOX.1"));
    broker.route_frame(id, &subscribe("A.*", 1));
    assert_eq!(broker.route_count(), 3);

    broker.cleanup_client(id);
    broker.cleanup_client(id);
    assert_eq!(broker.route_count(), 1);
    assert_eq!(broker.client_count(), 0);
}

#[test]
fn test_malformed_control_messages_are_dropped() {
    let mut broker = Broker::default();
    let (id, _rx) = connect(&mut broker, "peer");

    broker.route_frame(
        id,
        &Frame::new(WireHeader::new(SUBSCRIBE_TOPIC), Bytes::from_static(b"not json")),
    );
    let mut missing_id = Document::new();
    missing_id.set_string("topic", "A");
    broker.route_frame(id, &frame(SUBSCRIBE_TOPIC, &missing_id));
    broker.route_frame(id, &subscribe("A", -1));
    broker.route_frame(id, &subscribe(&"x".repeat(200), 1));
    broker.route_frame(id, &frame("_ROUTER.UNKNOWN", &Document::new()));

    assert_eq!(broker.route_count(), 1);
}

#[test]
fn test_full_route_table_drops_subscribe() {
    let mut broker = Broker::new(BrokerSettings {
        max_routes: 2,
        ..BrokerSettings::default()
    });
    let (id, _rx) = connect(&mut broker, "peer");
    broker.route_frame(id, &subscribe("A", 1));
    broker.route_frame(id, &subscribe("B", 2));
    assert_eq!(broker.route_count(), 2);
}

#[test]
fn test_debug_route_does_not_forward() {
    let mut broker = Broker::new(BrokerSettings {
        debug_route: true,
        ..BrokerSettings::default()
    });
    let (id, mut rx) = connect(&mut broker, "peer");
    broker.route_frame(id, &frame("Some.Topic", &Document::new()));
    assert!(rx.try_recv().is_err());
}
