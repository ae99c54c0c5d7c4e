//! Queue
//!
//! An ordered, competing-consumer delivery unit. Each message moves through
//! `Ready → InFlight → {acked (removed), requeued (Ready), dead-lettered}`.
//!
//! All state for one queue sits behind one `Mutex`: enqueue, dispatch, ack,
//! nack and the background sweep are serialized per queue, while different
//! queues never contend. Whichever of `ack` and the redelivery sweep takes
//! the lock first settles the delivery; the other sees it gone.
//!
//! Requeue policy: a requeued message (explicit nack, redelivery timeout,
//! consumer cancel, failed dead-letter) goes back to its original sequence
//! position. Since everything behind it was enqueued later, that is at or
//! near the head, so retried messages are redelivered before newer ones.
//!
//! For durable queues every transition is written to the `MessageStore`
//! before it is applied in memory; a failed write leaves memory untouched
//! and fails the operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::dead_letter::DeadLetter;
use crate::broker::dispatcher::{Consumer, ConsumerSlot, Dispatcher};
use crate::broker::message::{DeadLetterReason, Delivery, DeliveryTag, Message};
use crate::persistence::{DeliveryState, MessageStore, StoredMessage};
use crate::utils::error::{BrokerError, Result};

/// Declaration parameters for a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    /// At most one active consumer.
    pub exclusive: bool,
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering; the message's own key when unset.
    pub dead_letter_routing_key: Option<String>,
    /// Requeues allowed before the message is dead-lettered. Filled in with
    /// the broker default on declare.
    pub max_retry: Option<u32>,
    /// Ready messages older than this are dead-lettered as expired.
    pub message_ttl_ms: Option<u64>,
}

impl QueueOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_string());
        self.dead_letter_routing_key = routing_key.map(str::to_string);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn message_ttl_ms(mut self, ttl: u64) -> Self {
        self.message_ttl_ms = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub consumers: usize,
}

/// Result of one sweep over a queue.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Deliveries whose redelivery window elapsed, with their consumer.
    pub timed_out: Vec<(DeliveryTag, Option<String>)>,
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug)]
struct InFlight {
    entry: StoredMessage,
    consumer: Option<String>,
    delivered_at: i64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    next_seq: u64,
    next_tag: u64,
    dispatcher: Dispatcher,
}

impl QueueState {
    /// Put a message back at its original position.
    fn insert_ready(&mut self, entry: StoredMessage) {
        let pos = self.ready.partition_point(|e| e.seq < entry.seq);
        self.ready.insert(pos, entry);
    }
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    options: QueueOptions,
    store: Option<Arc<dyn MessageStore>>,
    state: Mutex<QueueState>,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Millisecond duration on the `i64` clock, saturating at `i64::MAX`.
fn span_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl Queue {
    /// An empty queue. `store` is only used when the queue is durable.
    pub fn new(name: &str, options: QueueOptions, store: Option<Arc<dyn MessageStore>>) -> Self {
        let store = if options.durable { store } else { None };
        Self {
            name: name.to_string(),
            options,
            store,
            state: Mutex::new(QueueState {
                next_seq: 1,
                next_tag: 1,
                ..QueueState::default()
            }),
        }
    }

    /// Rebuild a durable queue from its stored messages.
    ///
    /// Messages that were in flight when the process stopped become ready
    /// again, keeping their original order.
    pub fn recover(name: &str, options: QueueOptions, store: Arc<dyn MessageStore>) -> Result<Self> {
        let stored = store.load_messages(name)?;
        let queue = Self::new(name, options, Some(store));
        {
            let mut state = queue.lock();
            for mut entry in stored {
                entry.state = DeliveryState::Ready;
                state.next_seq = state.next_seq.max(entry.seq + 1);
                state.insert_ready(entry);
            }
            debug!(queue = %name, recovered = state.ready.len(), "queue recovered");
        }
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_retry(&self) -> u32 {
        self.options.max_retry.unwrap_or(u32::MAX)
    }

    /// Append a message to the tail and offer it to waiting consumers.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        let mut state = self.lock();
        let entry = StoredMessage {
            seq: state.next_seq,
            message,
            enqueued_at: now_ms(),
            deliveries: 0,
            state: DeliveryState::Ready,
        };
        if let Some(store) = &self.store {
            store.put_message(&self.name, &entry)?;
        }
        state.next_seq += 1;
        state.ready.push_back(entry);
        self.pump(&mut state);
        Ok(())
    }

    /// Pull one message without a subscription. `None` when nothing is ready.
    pub fn get(&self) -> Result<Option<Delivery>> {
        let mut state = self.lock();
        self.dispatch(&mut state, None, now_ms())
    }

    /// Subscribe a consumer with the given prefetch (0 = unlimited).
    pub fn consume(self: &Arc<Self>, prefetch: usize) -> Result<Consumer> {
        let mut state = self.lock();
        if self.options.exclusive && !state.dispatcher.is_empty() {
            return Err(BrokerError::ExclusiveQueue(self.name.clone()));
        }
        let tag = format!("ctag-{}", Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .dispatcher
            .register(ConsumerSlot::new(tag.clone(), prefetch, tx));
        debug!(queue = %self.name, consumer = %tag, prefetch, "consumer registered");
        self.pump(&mut state);
        Ok(Consumer::new(tag, self.name.clone(), Arc::downgrade(self), rx))
    }

    /// Unregister a consumer and return its unacked deliveries to the queue.
    pub fn cancel(&self, consumer: &str) -> bool {
        let mut state = self.lock();
        let released = self.release_consumer(&mut state, consumer);
        if released {
            self.pump(&mut state);
        }
        released
    }

    /// Acknowledge a delivery, removing the message for good.
    pub fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.lock();
        let flight = state.in_flight.remove(&tag).ok_or_else(|| self.unknown_tag(tag))?;
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_message(&self.name, flight.entry.seq) {
                state.in_flight.insert(tag, flight);
                return Err(e.into());
            }
        }
        state.dispatcher.credit_returned(flight.consumer.as_deref());
        self.pump(&mut state);
        Ok(())
    }

    /// Negatively acknowledge a delivery.
    ///
    /// Returns the message when it has to leave the queue (rejected, or
    /// retries exhausted). Its durable record stays until `forget` is called
    /// once the dead-letter redirect has been carried out.
    pub fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<Option<DeadLetter>> {
        let mut state = self.lock();
        let dead = self.settle_nack(&mut state, tag, requeue)?;
        self.pump(&mut state);
        Ok(dead)
    }

    /// Redeliver timed-out deliveries and expire stale ready messages.
    ///
    /// A `redelivery_timeout_ms` of 0 disables the redelivery check.
    pub fn sweep(&self, now: i64, redelivery_timeout_ms: u64) -> SweepOutcome {
        let mut state = self.lock();
        let mut outcome = SweepOutcome::default();

        if redelivery_timeout_ms > 0 {
            let mut expired: Vec<DeliveryTag> = state
                .in_flight
                .iter()
                .filter(|(_, f)| now.saturating_sub(f.delivered_at) >= span_ms(redelivery_timeout_ms))
                .map(|(tag, _)| *tag)
                .collect();
            expired.sort();
            for tag in expired {
                let consumer = state.in_flight.get(&tag).and_then(|f| f.consumer.clone());
                match self.settle_nack(&mut state, tag, true) {
                    Ok(dead) => {
                        outcome.timed_out.push((tag, consumer));
                        outcome.dead_letters.extend(dead);
                    }
                    Err(e) => {
                        error!(queue = %self.name, %tag, error = %e, "failed to requeue timed-out delivery");
                    }
                }
            }
        }

        if let Some(ttl) = self.options.message_ttl_ms {
            let cutoff = now.saturating_sub(span_ms(ttl));
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.ready)
                .into_iter()
                .partition(|e| e.enqueued_at <= cutoff);
            state.ready = fresh;
            outcome
                .dead_letters
                .extend(stale.into_iter().map(|entry| DeadLetter {
                    entry,
                    reason: DeadLetterReason::Expired,
                }));
        }

        self.pump(&mut state);
        outcome
    }

    /// Drop the durable record of a message that left this queue.
    pub fn forget(&self, seq: u64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_message(&self.name, seq) {
                error!(queue = %self.name, seq, error = %e, "failed to remove dead-lettered message from store");
            }
        }
    }

    /// Put a message that could not be dead-lettered back as ready.
    pub fn restore(&self, mut entry: StoredMessage) {
        let mut state = self.lock();
        entry.state = DeliveryState::Ready;
        self.persist_best_effort(&entry);
        state.insert_ready(entry);
        self.pump(&mut state);
    }

    /// Drop every ready message. In-flight deliveries are left alone.
    ///
    /// On a storage failure the messages already removed from the store
    /// stay purged and the rest stay ready, so memory and store agree.
    pub fn purge(&self) -> Result<usize> {
        let mut state = self.lock();
        let mut purged = 0;
        while let Some(entry) = state.ready.front() {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove_message(&self.name, entry.seq) {
                    warn!(queue = %self.name, purged, error = %e, "purge interrupted by storage failure");
                    return Err(e.into());
                }
            }
            state.ready.pop_front();
            purged += 1;
        }
        Ok(purged)
    }

    /// Close every consumer stream and discard all messages.
    ///
    /// Used on delete; the durable records are removed by the caller.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.dispatcher.clear();
        let dropped = state.ready.len() + state.in_flight.len();
        state.ready.clear();
        state.in_flight.clear();
        dropped
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            consumers: state.dispatcher.len(),
        }
    }

    fn unknown_tag(&self, tag: DeliveryTag) -> BrokerError {
        BrokerError::UnknownTag {
            queue: self.name.clone(),
            tag: tag.0,
        }
    }

    fn persist_best_effort(&self, entry: &StoredMessage) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_message(&self.name, entry) {
                warn!(queue = %self.name, seq = entry.seq, error = %e, "failed to persist requeued message");
            }
        }
    }

    /// Drop the consumer's slot and requeue every delivery it still holds.
    /// Returns `false` when there was neither a slot nor a held delivery.
    fn release_consumer(&self, state: &mut QueueState, consumer: &str) -> bool {
        let removed = state.dispatcher.remove(consumer);
        let held: Vec<DeliveryTag> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.consumer.as_deref() == Some(consumer))
            .map(|(tag, _)| *tag)
            .collect();
        let requeued = held.len();
        for tag in held {
            if let Some(flight) = state.in_flight.remove(&tag) {
                let mut entry = flight.entry;
                entry.state = DeliveryState::Ready;
                self.persist_best_effort(&entry);
                state.insert_ready(entry);
            }
        }
        if requeued > 0 {
            debug!(queue = %self.name, %consumer, requeued, "consumer released");
        }
        removed || requeued > 0
    }

    /// Pop the head and hand it out under a fresh delivery tag.
    fn dispatch(
        &self,
        state: &mut QueueState,
        consumer: Option<&str>,
        now: i64,
    ) -> Result<Option<Delivery>> {
        let Some(mut entry) = state.ready.pop_front() else {
            return Ok(None);
        };
        let tag = DeliveryTag(state.next_tag);
        let redelivered = entry.deliveries > 0;
        entry.deliveries += 1;
        entry.state = DeliveryState::InFlight { tag: tag.0 };
        if let Some(store) = &self.store {
            if let Err(e) = store.put_message(&self.name, &entry) {
                entry.deliveries -= 1;
                entry.state = DeliveryState::Ready;
                state.ready.push_front(entry);
                return Err(e.into());
            }
        }
        state.next_tag += 1;
        let delivery = Delivery {
            queue: self.name.clone(),
            tag,
            message: entry.message.clone(),
            redelivered,
            consumer: consumer.map(str::to_string),
        };
        state.in_flight.insert(
            tag,
            InFlight {
                entry,
                consumer: consumer.map(str::to_string),
                delivered_at: now,
            },
        );
        Ok(Some(delivery))
    }

    fn settle_nack(
        &self,
        state: &mut QueueState,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<Option<DeadLetter>> {
        let flight = state.in_flight.remove(&tag).ok_or_else(|| self.unknown_tag(tag))?;
        let retries = flight.entry.message.retry_count.saturating_add(1);

        let reason = if !requeue {
            Some(DeadLetterReason::Rejected)
        } else if retries > self.max_retry() {
            Some(DeadLetterReason::MaxRetries)
        } else {
            None
        };

        if let Some(reason) = reason {
            state.dispatcher.credit_returned(flight.consumer.as_deref());
            debug!(queue = %self.name, %tag, %reason, "message leaving queue");
            return Ok(Some(DeadLetter {
                entry: flight.entry,
                reason,
            }));
        }

        let mut entry = flight.entry.clone();
        entry.message.retry_count = retries;
        entry.state = DeliveryState::Ready;
        if let Some(store) = &self.store {
            if let Err(e) = store.put_message(&self.name, &entry) {
                state.in_flight.insert(tag, flight);
                return Err(e.into());
            }
        }
        state.dispatcher.credit_returned(flight.consumer.as_deref());
        state.insert_ready(entry);
        Ok(None)
    }

    /// Hand ready messages to consumers with credit, round-robin.
    fn pump(&self, state: &mut QueueState) {
        let now = now_ms();
        while !state.ready.is_empty() {
            let Some(consumer) = state.dispatcher.next_ready().map(str::to_string) else {
                break;
            };
            let delivery = match self.dispatch(state, Some(&consumer), now) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    error!(queue = %self.name, error = %e, "dispatch failed, leaving message ready");
                    break;
                }
            };
            if let Err(undelivered) = state.dispatcher.deliver(&consumer, delivery) {
                // receiver went away without cancelling
                if let Some(flight) = state.in_flight.get_mut(&undelivered.tag) {
                    flight.entry.deliveries = flight.entry.deliveries.saturating_sub(1);
                }
                self.release_consumer(state, &consumer);
            }
        }
    }
}
