//! WebSocket transport
//!
//! A thin front end that translates JSON frames into broker calls.
//! Responsibilities:
//! - accept TCP/WebSocket connections, up to `max_connections` at a time
//! - keep a `Client` per connection with the consumers it opened
//! - forward each consumer's deliveries to the socket as `delivery` frames
//! - cancel every consumer of a connection when it goes away, so its
//!   unacked deliveries return to their queues

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::exchange::Exchange;
use crate::broker::message::DeliveryTag;
use crate::broker::queue::QueueOptions;
use crate::broker::Broker;
use crate::client::Client;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::BrokerError;

/// Bind `addr` and serve connections until the listener fails.
pub async fn start_websocket_server(addr: &str, broker: Broker) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, broker).await
}

/// Serve connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: Broker) -> std::io::Result<()> {
    let permits = Arc::new(Semaphore::new(broker.settings().max_connections));

    loop {
        let (stream, peer) = listener.accept().await?;
        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!(%peer, "connection limit reached, rejecting");
            continue;
        };
        let broker = broker.clone();
        tokio::spawn(async move {
            handle_connection(stream, broker).await;
            drop(permit);
        });
    }
}

async fn handle_connection(stream: TcpStream, broker: Broker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    let client_id = client.id.clone();
    info!(client = %client_id, "client connected");

    {
        let client_id = client_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(client = %client_id, error = %e, "failed to send frame");
                    break;
                }
            }
            debug!(client = %client_id, "send loop closed");
        });
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };
        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(command) => handle_client_message(&broker, &mut client, command),
            Err(err) => {
                warn!(
                    client = %client_id,
                    "invalid client message: {err} | {}",
                    text.chars().take(100).collect::<String>()
                );
                ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                }
            }
        };
        if send_frame(&client.sender, &reply).is_err() {
            break;
        }
    }

    let cancelled = client.cancel_all();
    info!(client = %client_id, consumers = cancelled, "client disconnected");
}

/// Serialize `message` and queue it for the socket. Fails once the
/// connection's send loop has gone away.
pub(crate) fn send_frame(
    sender: &mpsc::UnboundedSender<WsMessage>,
    message: &ServerMessage,
) -> Result<(), ()> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {e}");
            return Ok(());
        }
    };
    sender.send(WsMessage::text(json)).map_err(|_| ())
}

fn reply(result: Result<ServerMessage, BrokerError>) -> ServerMessage {
    result.unwrap_or_else(|e| ServerMessage::Error {
        message: e.to_string(),
    })
}

/// Apply one client command to the broker and produce its reply.
pub fn handle_client_message(
    broker: &Broker,
    client: &mut Client,
    message: ClientMessage,
) -> ServerMessage {
    match message {
        ClientMessage::DeclareExchange {
            exchange,
            kind,
            durable,
            alternate_exchange,
        } => {
            let mut declaration = Exchange::new(&exchange, kind, durable);
            declaration.alternate_exchange = alternate_exchange;
            reply(broker.declare_exchange_with(declaration).map(|_| ServerMessage::Ok))
        }
        ClientMessage::DeleteExchange { exchange } => {
            reply(broker.delete_exchange(&exchange).map(|_| ServerMessage::Ok))
        }
        ClientMessage::DeclareQueue {
            queue,
            durable,
            exclusive,
            dead_letter_exchange,
            dead_letter_routing_key,
            max_retry,
            message_ttl_ms,
        } => {
            let options = QueueOptions {
                durable,
                exclusive,
                dead_letter_exchange,
                dead_letter_routing_key,
                max_retry,
                message_ttl_ms,
            };
            reply(
                broker
                    .declare_queue(queue.as_deref(), options)
                    .map(|queue| ServerMessage::DeclareQueueOk { queue }),
            )
        }
        ClientMessage::DeleteQueue { queue } => {
            reply(broker.delete_queue(&queue).map(|_| ServerMessage::Ok))
        }
        ClientMessage::Bind {
            exchange,
            queue,
            routing_key,
        } => reply(
            broker
                .bind(&exchange, &queue, &routing_key)
                .map(|_| ServerMessage::Ok),
        ),
        ClientMessage::Unbind {
            exchange,
            queue,
            routing_key,
        } => reply(
            broker
                .unbind(&exchange, &queue, &routing_key)
                .map(|_| ServerMessage::Ok),
        ),
        ClientMessage::Publish {
            exchange,
            routing_key,
            payload,
            headers,
        } => reply(
            broker
                .publish(&exchange, &routing_key, payload, headers)
                .map(|routed| ServerMessage::Published { routed }),
        ),
        ClientMessage::Consume { queue, prefetch } => {
            let prefetch = prefetch.unwrap_or(broker.settings().default_prefetch);
            let mut consumer = match broker.consume(&queue, prefetch) {
                Ok(consumer) => consumer,
                Err(e) => return reply(Err(e)),
            };
            let consumer_tag = consumer.tag().to_string();
            let sender = client.sender.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    if send_frame(&sender, &ServerMessage::from(delivery)).is_err() {
                        break;
                    }
                }
            });
            client.add_consumer(consumer_tag.clone(), forwarder);
            debug!(client = %client.id, %queue, consumer = %consumer_tag, "consumer started");
            ServerMessage::ConsumeOk { consumer_tag }
        }
        ClientMessage::Cancel { consumer_tag } => {
            if client.cancel_consumer(&consumer_tag) {
                ServerMessage::Ok
            } else {
                ServerMessage::Error {
                    message: format!("unknown consumer '{consumer_tag}'"),
                }
            }
        }
        ClientMessage::Ack {
            queue,
            delivery_tag,
        } => reply(
            broker
                .ack(&queue, DeliveryTag(delivery_tag))
                .map(|_| ServerMessage::Ok),
        ),
        ClientMessage::Nack {
            queue,
            delivery_tag,
            requeue,
        } => reply(
            broker
                .nack(&queue, DeliveryTag(delivery_tag), requeue)
                .map(|_| ServerMessage::Ok),
        ),
    }
}
