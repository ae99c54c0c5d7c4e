use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, ExchangeKind};
use crate::client::Client;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::websocket::{handle_client_message, serve};

fn command(value: serde_json::Value) -> ClientMessage {
    serde_json::from_value(value).expect("valid client message")
}

fn parse_frame(frame: WsMessage) -> ServerMessage {
    let text = frame.to_text().expect("text frame");
    serde_json::from_str(text).expect("valid server message")
}

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn call(ws: &mut WsClient, value: serde_json::Value) -> ServerMessage {
    ws.send(WsMessage::text(value.to_string())).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("reply in time")
        .expect("socket open")
        .expect("valid frame");
    parse_frame(frame)
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> ServerMessage {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame in time")
        .expect("channel open");
    parse_frame(frame)
}

#[test]
fn client_message_defaults() {
    let msg = command(json!({ "type": "nack", "queue": "q", "delivery_tag": 3 }));
    assert_eq!(
        msg,
        ClientMessage::Nack {
            queue: "q".into(),
            delivery_tag: 3,
            requeue: true
        }
    );

    let msg = command(json!({ "type": "declare_queue" }));
    assert!(matches!(
        msg,
        ClientMessage::DeclareQueue {
            queue: None,
            durable: false,
            ..
        }
    ));
}

#[test]
fn unknown_exchange_kind_is_rejected() {
    let parsed = serde_json::from_value::<ClientMessage>(json!({
        "type": "declare_exchange",
        "exchange": "e",
        "kind": "headers"
    }));
    assert!(parsed.is_err());
}

#[tokio::test]
async fn test_handle_declare_bind_publish() {
    let broker = Broker::default();
    let (tx, _rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "declare_exchange", "exchange": "logs", "kind": "fanout" })),
    );
    assert_eq!(reply, ServerMessage::Ok);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "declare_queue" })),
    );
    let ServerMessage::DeclareQueueOk { queue } = reply else {
        panic!("expected declare_queue_ok");
    };
    assert!(queue.starts_with("amq.gen-"));

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "bind", "exchange": "logs", "queue": queue })),
    );
    assert_eq!(reply, ServerMessage::Ok);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "publish", "exchange": "logs", "routing_key": "x", "payload": "hi" })),
    );
    assert_eq!(reply, ServerMessage::Published { routed: 1 });
    assert_eq!(broker.queue_stats(&queue).unwrap().ready, 1);
}

#[tokio::test]
async fn test_handle_errors_are_replies() {
    let broker = Broker::default();
    let (tx, _rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "publish", "exchange": "missing", "payload": "hi" })),
    );
    assert_eq!(
        reply,
        ServerMessage::Error {
            message: "unknown exchange 'missing'".into()
        }
    );

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "ack", "queue": "nope", "delivery_tag": 1 })),
    );
    assert!(matches!(reply, ServerMessage::Error { .. }));

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "cancel", "consumer_tag": "ctag-unknown" })),
    );
    assert!(matches!(reply, ServerMessage::Error { .. }));
}

#[tokio::test]
async fn test_handle_consume_forwards_deliveries() {
    let broker = Broker::default();
    broker
        .declare_exchange("jobs", ExchangeKind::Direct, false)
        .unwrap();
    let queue = broker.declare_queue(Some("work"), Default::default()).unwrap();
    broker.bind("jobs", &queue, "resize").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "consume", "queue": "work", "prefetch": 1 })),
    );
    let ServerMessage::ConsumeOk { consumer_tag } = reply else {
        panic!("expected consume_ok");
    };

    broker
        .publish("jobs", "resize", "img-1", Default::default())
        .unwrap();

    let ServerMessage::Delivery {
        queue,
        delivery_tag,
        consumer_tag: delivered_to,
        payload,
        redelivered,
        ..
    } = next_frame(&mut rx).await
    else {
        panic!("expected a delivery frame");
    };
    assert_eq!(queue, "work");
    assert_eq!(payload, "img-1");
    assert_eq!(delivered_to.as_deref(), Some(consumer_tag.as_str()));
    assert!(!redelivered);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "ack", "queue": "work", "delivery_tag": delivery_tag })),
    );
    assert_eq!(reply, ServerMessage::Ok);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "ack", "queue": "work", "delivery_tag": delivery_tag })),
    );
    assert!(matches!(reply, ServerMessage::Error { .. }));
}

#[tokio::test]
async fn test_cancel_returns_unacked_messages() {
    let broker = Broker::default();
    let queue = broker.declare_queue(Some("tasks"), Default::default()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    let ServerMessage::ConsumeOk { consumer_tag } = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "consume", "queue": queue, "prefetch": 5 })),
    ) else {
        panic!("expected consume_ok");
    };

    broker.publish("", "tasks", "t1", Default::default()).unwrap();
    assert!(matches!(next_frame(&mut rx).await, ServerMessage::Delivery { .. }));
    assert_eq!(broker.queue_stats("tasks").unwrap().in_flight, 1);

    let reply = handle_client_message(
        &broker,
        &mut client,
        command(json!({ "type": "cancel", "consumer_tag": consumer_tag })),
    );
    assert_eq!(reply, ServerMessage::Ok);

    // the aborted forwarder drops its consumer on the runtime
    let mut stats = broker.queue_stats("tasks").unwrap();
    for _ in 0..50 {
        if stats.consumers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = broker.queue_stats("tasks").unwrap();
    }
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn integration_websocket_end_to_end() {
    let broker = Broker::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, broker.clone()));

    let url = format!("ws://{addr}");
    let (mut publisher, _) = connect_async(url.as_str()).await.expect("publisher connect");
    let (mut subscriber, _) = connect_async(url.as_str()).await.expect("subscriber connect");

    assert_eq!(
        call(
            &mut subscriber,
            json!({ "type": "declare_queue", "queue": "inbox" })
        )
        .await,
        ServerMessage::DeclareQueueOk {
            queue: "inbox".into()
        }
    );
    assert!(matches!(
        call(&mut subscriber, json!({ "type": "consume", "queue": "inbox" })).await,
        ServerMessage::ConsumeOk { .. }
    ));
    assert_eq!(
        call(
            &mut publisher,
            json!({ "type": "publish", "exchange": "", "routing_key": "inbox", "payload": "hello world" })
        )
        .await,
        ServerMessage::Published { routed: 1 }
    );

    let frame = tokio::time::timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("delivery in time")
        .expect("socket open")
        .expect("valid frame");
    match parse_frame(frame) {
        ServerMessage::Delivery {
            payload,
            routing_key,
            ..
        } => {
            assert_eq!(payload, "hello world");
            assert_eq!(routing_key, "inbox");
        }
        other => panic!("Client did not receive the published message: {other:?}"),
    }

    // disconnecting returns the unacked delivery to the queue
    subscriber.close(None).await.unwrap();
    let mut stats = broker.queue_stats("inbox").unwrap();
    for _ in 0..100 {
        if stats.consumers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = broker.queue_stats("inbox").unwrap();
    }
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.ready, 1);
}
