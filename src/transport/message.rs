//! JSON protocol spoken over the WebSocket.
//!
//! Every frame is a JSON object with a `type` field. Clients send
//! `ClientMessage`s; each one gets exactly one reply (`ok`,
//! `declare_queue_ok`, `consume_ok`, `published` or `error`). Deliveries are
//! pushed as `delivery` frames at any time after a `consume`.
//!
//! Payloads travel as UTF-8 text on this transport; binary payloads are
//! converted lossily.

use serde::{Deserialize, Serialize};

use crate::broker::exchange::ExchangeKind;
use crate::broker::message::{DeadLetterInfo, Delivery, Headers};

fn default_requeue() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    DeclareExchange {
        exchange: String,
        kind: ExchangeKind,
        #[serde(default)]
        durable: bool,
        #[serde(default)]
        alternate_exchange: Option<String>,
    },
    DeleteExchange {
        exchange: String,
    },
    DeclareQueue {
        #[serde(default)]
        queue: Option<String>,
        #[serde(default)]
        durable: bool,
        #[serde(default)]
        exclusive: bool,
        #[serde(default)]
        dead_letter_exchange: Option<String>,
        #[serde(default)]
        dead_letter_routing_key: Option<String>,
        #[serde(default)]
        max_retry: Option<u32>,
        #[serde(default)]
        message_ttl_ms: Option<u64>,
    },
    DeleteQueue {
        queue: String,
    },
    Bind {
        exchange: String,
        queue: String,
        #[serde(default)]
        routing_key: String,
    },
    Unbind {
        exchange: String,
        queue: String,
        #[serde(default)]
        routing_key: String,
    },
    Publish {
        exchange: String,
        #[serde(default)]
        routing_key: String,
        payload: String,
        #[serde(default)]
        headers: Headers,
    },
    Consume {
        queue: String,
        #[serde(default)]
        prefetch: Option<usize>,
    },
    Cancel {
        consumer_tag: String,
    },
    Ack {
        queue: String,
        delivery_tag: u64,
    },
    Nack {
        queue: String,
        delivery_tag: u64,
        #[serde(default = "default_requeue")]
        requeue: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ok,
    DeclareQueueOk {
        queue: String,
    },
    ConsumeOk {
        consumer_tag: String,
    },
    Published {
        routed: usize,
    },
    Error {
        message: String,
    },
    Delivery {
        queue: String,
        delivery_tag: u64,
        consumer_tag: Option<String>,
        redelivered: bool,
        message_id: String,
        exchange: String,
        routing_key: String,
        payload: String,
        headers: Headers,
        timestamp: i64,
        retry_count: u32,
        dead_letter: Option<DeadLetterInfo>,
    },
}

impl From<Delivery> for ServerMessage {
    fn from(delivery: Delivery) -> Self {
        let message = delivery.message;
        ServerMessage::Delivery {
            queue: delivery.queue,
            delivery_tag: delivery.tag.0,
            consumer_tag: delivery.consumer,
            redelivered: delivery.redelivered,
            message_id: message.message_id,
            exchange: message.exchange,
            routing_key: message.routing_key,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            headers: message.headers,
            timestamp: message.timestamp,
            retry_count: message.retry_count,
            dead_letter: message.dead_letter,
        }
    }
}
