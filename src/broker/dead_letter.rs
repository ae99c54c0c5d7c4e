//! Dead-letter redirector
//!
//! Decides where a message goes once a queue gives up on it. With a
//! dead-letter exchange configured the message is republished there,
//! carrying lineage that records the queue it came from and why. Without
//! one the message is dropped; the broker reports the drop as an event,
//! never as an error to the original publisher.

use crate::broker::exchange::DEFAULT_EXCHANGE;
use crate::broker::message::{DeadLetterInfo, DeadLetterReason, Message};
use crate::broker::queue::{QueueOptions, now_ms};
use crate::broker::router::Router;
use crate::persistence::StoredMessage;

/// A message that left its queue without being acked.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub entry: StoredMessage,
    pub reason: DeadLetterReason,
}

impl DeadLetter {
    pub fn message(&self) -> &Message {
        &self.entry.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Publish `message` to `exchange` with `routing_key`.
    Republish {
        exchange: String,
        routing_key: String,
        message: Message,
    },
    /// No dead-letter exchange: the message is gone.
    Drop,
}

/// Work out what happens to a message dead-lettered from `queue`.
pub fn redirect(dead: &DeadLetter, queue: &str, options: &QueueOptions) -> Redirect {
    let Some(exchange) = options.dead_letter_exchange.as_ref() else {
        return Redirect::Drop;
    };
    let original = dead.message();
    let routing_key = options
        .dead_letter_routing_key
        .clone()
        .unwrap_or_else(|| original.routing_key.clone());

    let count = original.dead_letter.as_ref().map_or(0, |d| d.count) + 1;
    let mut message = original.clone();
    message.dead_letter = Some(DeadLetterInfo {
        queue: queue.to_string(),
        reason: dead.reason,
        exchange: original.exchange.clone(),
        routing_key: original.routing_key.clone(),
        count,
        time: now_ms(),
    });
    message.retry_count = 0;
    message.exchange = exchange.clone();
    message.routing_key = routing_key.clone();

    Redirect::Republish {
        exchange: exchange.clone(),
        routing_key,
        message,
    }
}

/// Would messages dead-lettered from `queue` be routed straight back into it?
///
/// Only direct loops through the queue's own dead-letter exchange are
/// detected. When no dead-letter routing key is set the eventual key is not
/// known, so any binding from the exchange to the queue counts.
pub fn routes_back(router: &Router, queue: &str, options: &QueueOptions) -> bool {
    let Some(dlx) = options.dead_letter_exchange.as_deref() else {
        return false;
    };
    let Some(exchange) = router.exchange(dlx) else {
        return false;
    };
    let key = options.dead_letter_routing_key.as_deref();
    router
        .bindings()
        .all()
        .into_iter()
        .filter(|b| b.exchange == dlx && b.queue == queue)
        .any(|b| match key {
            Some(key) => exchange.kind.matches(&b.routing_key, key),
            None => true,
        })
        || (dlx == DEFAULT_EXCHANGE && key.is_none_or(|k| k == queue))
}
