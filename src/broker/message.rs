//! Message definitions for the broker
//!
//! `Message` is the canonical internal representation. Every queue a publish
//! routes to receives its own copy, so `retry_count` and `dead_letter`
//! evolve independently per queue.
//!
//! Notes on fields:
//! - `message_id`: opaque unique id generated by the broker on publish
//! - `exchange` / `routing_key`: where the message was published
//! - `timestamp`: milliseconds since UNIX epoch, set by the broker
//! - `retry_count`: number of requeues (explicit nack or redelivery timeout)
//! - `dead_letter`: lineage, present once the message has been dead-lettered

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: Headers,
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterInfo>,
}

impl Message {
    /// Build a freshly published message stamped with the current time.
    pub fn new(
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            headers,
            timestamp: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            dead_letter: None,
        }
    }
}

/// Why a message left the queue it was in without being acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Consumer nacked with `requeue = false`.
    Rejected,
    /// The message outlived the queue's TTL while waiting.
    Expired,
    /// Requeued more often than the queue's retry limit allows.
    MaxRetries,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::MaxRetries => "max_retries",
        };
        f.write_str(s)
    }
}

/// Lineage recorded on a message every time it is dead-lettered.
///
/// `queue`, `reason`, `exchange` and `routing_key` describe the most recent
/// hop; `count` accumulates across hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterInfo {
    pub queue: String,
    pub reason: DeadLetterReason,
    pub exchange: String,
    pub routing_key: String,
    pub count: u32,
    pub time: i64,
}

/// Per-queue handle for one in-flight delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message handed to a consumer (or returned by `get`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub tag: DeliveryTag,
    pub message: Message,
    /// Set when this message was handed out at least once before.
    pub redelivered: bool,
    /// Consumer tag, `None` for pull-style `get`.
    pub consumer: Option<String>,
}
