//! Observable broker events.
//!
//! Things that are worth knowing about but are not errors for any caller:
//! dropped messages, redelivery timeouts, unroutable publishes and
//! dead-letter loops. Every event is also logged through `tracing`; the
//! broadcast channel lets tests and outer layers observe them.

use serde::Serialize;

use crate::broker::message::DeadLetterReason;

/// Capacity of the event channel. Slow receivers lag instead of blocking.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// Republished through the queue's dead-letter exchange.
    DeadLettered {
        queue: String,
        exchange: String,
        message_id: String,
        reason: DeadLetterReason,
        routed: usize,
    },
    /// Left its queue with nowhere to go.
    MessageDropped {
        queue: String,
        message_id: String,
        reason: DeadLetterReason,
    },
    /// A delivery was not settled within the redelivery window.
    RedeliveryTimeout {
        queue: String,
        delivery_tag: u64,
        consumer: Option<String>,
    },
    /// A publish matched no queue.
    Unroutable {
        exchange: String,
        routing_key: String,
        message_id: String,
    },
    /// A queue's dead-letter exchange routes back into the queue itself.
    DeadLetterCycle { queue: String, exchange: String },
}
