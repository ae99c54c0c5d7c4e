//! Delivery dispatcher
//!
//! Decides which consumer of a queue receives the next ready message.
//! Consumers are served round-robin, skipping any that have used up their
//! prefetch credit, so a low-prefetch consumer is never starved by one that
//! registered first. The dispatcher lives inside the queue state and is
//! only touched under the queue lock.
//!
//! Deliveries reach consumers through an unbounded channel; the bound comes
//! from prefetch credit, not from the channel. The receiving end is wrapped
//! in `Consumer`, a `Stream` that unregisters itself when dropped.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::broker::message::Delivery;
use crate::broker::queue::Queue;

#[derive(Debug)]
pub(crate) struct ConsumerSlot {
    pub(crate) tag: String,
    /// 0 means unlimited.
    prefetch: usize,
    unacked: usize,
    sender: UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    pub(crate) fn new(tag: String, prefetch: usize, sender: UnboundedSender<Delivery>) -> Self {
        Self {
            tag,
            prefetch,
            unacked: 0,
            sender,
        }
    }

    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.unacked < self.prefetch
    }
}

#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    slots: Vec<ConsumerSlot>,
    cursor: usize,
}

impl Dispatcher {
    pub(crate) fn register(&mut self, slot: ConsumerSlot) {
        self.slots.push(slot);
    }

    /// Unregister a consumer. Dropping the slot closes its channel.
    pub(crate) fn remove(&mut self, tag: &str) -> bool {
        let Some(idx) = self.slots.iter().position(|s| s.tag == tag) else {
            return false;
        };
        self.slots.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.slots.len() {
            self.cursor = 0;
        }
        true
    }

    /// Unregister every consumer, closing all their streams.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        self.cursor = 0;
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Next consumer with spare credit, starting from the round-robin cursor.
    pub(crate) fn next_ready(&self) -> Option<&str> {
        let n = self.slots.len();
        (0..n)
            .map(|offset| &self.slots[(self.cursor + offset) % n])
            .find(|slot| slot.has_credit())
            .map(|slot| slot.tag.as_str())
    }

    /// Hand `delivery` to consumer `tag` and move the cursor past it.
    ///
    /// Gives the delivery back when the consumer is gone or its receiver
    /// was dropped.
    pub(crate) fn deliver(&mut self, tag: &str, delivery: Delivery) -> Result<(), Delivery> {
        let Some(idx) = self.slots.iter().position(|s| s.tag == tag) else {
            return Err(delivery);
        };
        let slot = &mut self.slots[idx];
        slot.sender.send(delivery).map_err(|e| e.0)?;
        slot.unacked += 1;
        self.cursor = (idx + 1) % self.slots.len();
        Ok(())
    }

    /// A delivery held by `tag` was settled; give the credit back.
    pub(crate) fn credit_returned(&mut self, tag: Option<&str>) {
        let Some(tag) = tag else {
            return;
        };
        if let Some(slot) = self.slots.iter_mut().find(|s| s.tag == tag) {
            slot.unacked = slot.unacked.saturating_sub(1);
        }
    }
}

/// Live stream of deliveries for one consumer.
///
/// The stream never ends on its own while the queue exists; it yields
/// `None` only once the queue is deleted. Dropping it cancels the
/// subscription and returns any unacked deliveries to the queue.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    queue_name: String,
    queue: Weak<Queue>,
    receiver: UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub(crate) fn new(
        tag: String,
        queue_name: String,
        queue: Weak<Queue>,
        receiver: UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            tag,
            queue_name,
            queue,
            receiver,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue_name
    }

    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery that is already assigned, without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly cancel. Same as dropping.
    pub fn cancel(self) {}

    /// Close the receiving end while leaving the subscription registered,
    /// as a receiver that vanished without cancelling would.
    #[cfg(test)]
    pub(crate) fn disconnect(&mut self) {
        self.receiver.close();
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel(&self.tag);
            debug!(queue = %self.queue_name, consumer = %self.tag, "consumer cancelled");
        }
    }
}
