//! Broker engine
//!
//! `Broker` is the explicit registry handle for one broker instance: the
//! router (exchanges and bindings), the queues, the optional message store
//! and the event channel. It is cheap to clone and safe to share across
//! tasks and threads.
//!
//! Concurrency and usage notes:
//! - There is no broker-wide lock. The exchange registry and binding table
//!   use reader-writer locks, the queue registry is an `RwLock` that is only
//!   held long enough to clone an `Arc<Queue>`, and each queue serializes
//!   its own operations.
//! - A fan-out publish enqueues into each target queue independently. If
//!   one enqueue fails (storage error) the copies already made stay where
//!   they are: delivery is at-least-once, not exactly-once.
//! - Dead-lettering runs after the source queue's lock has been released,
//!   so no two queue locks are ever held together.
//! - The sweep loop is meant to run as a background task; it redelivers
//!   timed-out deliveries and expires messages past their TTL.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::binding::Binding;
use crate::broker::dead_letter::{self, DeadLetter, Redirect};
use crate::broker::dispatcher::Consumer;
use crate::broker::events::{BrokerEvent, EVENT_CHANNEL_CAPACITY};
use crate::broker::exchange::{Exchange, ExchangeKind};
use crate::broker::message::{Delivery, DeliveryTag, Headers, Message};
use crate::broker::queue::{Queue, QueueOptions, QueueStats, now_ms};
use crate::broker::router::Router;
use crate::config::BrokerSettings;
use crate::persistence::{MessageStore, StoredQueue};
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
struct BrokerInner {
    router: Router,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    store: Option<Arc<dyn MessageStore>>,
    settings: BrokerSettings,
    events: broadcast::Sender<BrokerEvent>,
}

#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// A broker without a message store. Durable declarations are accepted
    /// but nothing outlives the process.
    pub fn new(settings: BrokerSettings) -> Self {
        Self::with_store(settings, None)
    }

    fn with_store(settings: BrokerSettings, store: Option<Arc<dyn MessageStore>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                router: Router::new(),
                queues: RwLock::new(HashMap::new()),
                store,
                settings,
                events,
            }),
        }
    }

    /// A broker backed by `store`, restoring every durable exchange, queue,
    /// binding and message found in it.
    pub fn open(settings: BrokerSettings, store: Arc<dyn MessageStore>) -> Result<Self> {
        let broker = Self::with_store(settings, Some(store.clone()));

        for exchange in store.load_exchanges()? {
            broker.inner.router.declare_exchange(exchange)?;
        }

        {
            let mut queues = broker.write_queues();
            for stored in store.load_queues()? {
                let queue = Queue::recover(&stored.name, stored.options, store.clone())?;
                queues.insert(stored.name, Arc::new(queue));
            }
        }

        let mut restored = 0;
        for binding in store.load_bindings()? {
            if broker.queue(&binding.queue).is_err() {
                warn!(queue = %binding.queue, exchange = %binding.exchange, "skipping binding to missing queue");
                continue;
            }
            match broker.inner.router.bind(&binding) {
                Ok(_) => restored += 1,
                Err(e) => warn!(exchange = %binding.exchange, error = %e, "skipping stored binding"),
            }
        }

        info!(
            exchanges = broker.inner.router.exchanges().len() - 1,
            queues = broker.queue_names().len(),
            bindings = restored,
            "broker state recovered"
        );
        Ok(broker)
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    /// Subscribe to broker events.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn write_queues(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Queue>>> {
        self.inner.queues.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_queue(&self, name: &str) -> bool {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    fn durable_store(&self, durable: bool) -> Option<&Arc<dyn MessageStore>> {
        if durable { self.inner.store.as_ref() } else { None }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.inner.router.exchange(name)
    }

    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.declare_exchange_with(Exchange::new(name, kind, durable))
    }

    /// Declare an exchange with every parameter, including an alternate exchange.
    pub fn declare_exchange_with(&self, exchange: Exchange) -> Result<()> {
        let created = self.inner.router.declare_exchange(exchange.clone())?;
        if !created {
            return Ok(());
        }
        if let Some(store) = self.durable_store(exchange.durable) {
            if let Err(e) = store.save_exchange(&exchange) {
                let _ = self.inner.router.delete_exchange(&exchange.name);
                return Err(e.into());
            }
        }
        info!(exchange = %exchange.name, kind = %exchange.kind, durable = exchange.durable, "exchange declared");
        Ok(())
    }

    /// Delete an exchange and every binding on it.
    pub fn delete_exchange(&self, name: &str) -> Result<()> {
        let exchange = self
            .inner
            .router
            .exchange(name)
            .ok_or_else(|| BrokerError::UnknownExchange(name.to_string()))?;
        if let Some(store) = self.durable_store(exchange.durable) {
            store.delete_exchange(name)?;
        }
        let (_, bindings) = self.inner.router.delete_exchange(name)?;
        self.forget_bindings(&bindings);
        info!(exchange = %name, bindings = bindings.len(), "exchange deleted");
        Ok(())
    }

    /// Declare a queue, generating a unique name when `name` is absent or empty.
    ///
    /// Redeclaring with identical options returns the existing name.
    pub fn declare_queue(&self, name: Option<&str>, options: QueueOptions) -> Result<String> {
        let mut options = options;
        options
            .max_retry
            .get_or_insert(self.inner.settings.default_max_retry);
        if options.message_ttl_ms.is_none() && self.inner.settings.message_ttl_secs > 0 {
            options.message_ttl_ms = Some(self.inner.settings.message_ttl_secs.saturating_mul(1000));
        }

        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => loop {
                let candidate = format!("amq.gen-{}", Uuid::new_v4());
                if !self.has_queue(&candidate) {
                    break candidate;
                }
            },
        };
        if let Ok(existing) = self.queue(&name) {
            return Self::redeclared(&existing, name, &options);
        }

        // store I/O stays outside the registry lock
        let store = self.durable_store(options.durable);
        if let Some(store) = store {
            store.save_queue(&StoredQueue {
                name: name.clone(),
                options: options.clone(),
            })?;
        }

        let raced = {
            let mut queues = self.write_queues();
            match queues.get(&name) {
                Some(existing) => Some(existing.clone()),
                None => {
                    let queue = Queue::new(&name, options.clone(), self.inner.store.clone());
                    queues.insert(name.clone(), Arc::new(queue));
                    None
                }
            }
        };
        if let Some(existing) = raced {
            if let Some(store) = store {
                if existing.options() != &options {
                    self.restore_queue_record(store, &existing);
                }
            }
            return Self::redeclared(&existing, name, &options);
        }

        info!(queue = %name, durable = options.durable, exclusive = options.exclusive, "queue declared");
        self.check_dead_letter_cycle(&name, &options);
        Ok(name)
    }

    fn redeclared(existing: &Queue, name: String, options: &QueueOptions) -> Result<String> {
        if existing.options() == options {
            return Ok(name);
        }
        Err(BrokerError::conflict(
            "queue",
            name,
            format!("existing {:?}", existing.options()),
        ))
    }

    /// Put back the stored declaration of a queue that won a declare race.
    fn restore_queue_record(&self, store: &Arc<dyn MessageStore>, existing: &Queue) {
        let result = if existing.options().durable {
            store.save_queue(&StoredQueue {
                name: existing.name().to_string(),
                options: existing.options().clone(),
            })
        } else {
            store.delete_queue(existing.name())
        };
        if let Err(e) = result {
            warn!(queue = %existing.name(), error = %e, "failed to restore stored queue declaration");
        }
    }

    /// Delete a queue, its bindings and its messages. Open consumer streams end.
    pub fn delete_queue(&self, name: &str) -> Result<usize> {
        let queue = self.queue(name)?;
        if let Some(store) = self.durable_store(queue.options().durable) {
            store.delete_queue(name)?;
        }
        self.write_queues().remove(name);
        let bindings = self.inner.router.bindings().remove_queue(name);
        self.forget_bindings(&bindings);
        let dropped = queue.close();
        info!(queue = %name, dropped, "queue deleted");
        Ok(dropped)
    }

    /// Remove every ready message from a queue.
    pub fn purge_queue(&self, name: &str) -> Result<usize> {
        let purged = self.queue(name)?.purge()?;
        debug!(queue = %name, purged, "queue purged");
        Ok(purged)
    }

    pub fn queue_stats(&self, name: &str) -> Result<QueueStats> {
        Ok(self.queue(name)?.stats())
    }

    pub fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let target = self.queue(queue)?;
        let binding = Binding::new(exchange, queue, routing_key);
        if !self.inner.router.bind(&binding)? {
            return Ok(());
        }
        if self.binding_is_durable(&binding, &target) {
            if let Some(store) = self.inner.store.as_ref() {
                if let Err(e) = store.save_binding(&binding) {
                    let _ = self.inner.router.unbind(&binding);
                    return Err(e.into());
                }
            }
        }
        debug!(exchange, queue, routing_key, "queue bound");
        self.check_dead_letter_cycle(queue, target.options());
        Ok(())
    }

    pub fn unbind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let binding = Binding::new(exchange, queue, routing_key);
        if !self.inner.router.unbind(&binding)? {
            return Ok(());
        }
        self.forget_bindings(std::slice::from_ref(&binding));
        debug!(exchange, queue, routing_key, "queue unbound");
        Ok(())
    }

    fn binding_is_durable(&self, binding: &Binding, queue: &Queue) -> bool {
        queue.options().durable
            && self
                .inner
                .router
                .exchange(&binding.exchange)
                .is_some_and(|e| e.durable)
    }

    fn forget_bindings(&self, bindings: &[Binding]) {
        let Some(store) = self.inner.store.as_ref() else {
            return;
        };
        for binding in bindings {
            if let Err(e) = store.delete_binding(binding) {
                warn!(exchange = %binding.exchange, queue = %binding.queue, error = %e, "failed to remove stored binding");
            }
        }
    }

    fn check_dead_letter_cycle(&self, queue: &str, options: &QueueOptions) {
        if dead_letter::routes_back(&self.inner.router, queue, options) {
            let exchange = options.dead_letter_exchange.clone().unwrap_or_default();
            warn!(queue, exchange = %exchange, "dead-letter exchange routes back into its own queue");
            self.emit(BrokerEvent::DeadLetterCycle {
                queue: queue.to_string(),
                exchange,
            });
        }
    }

    /// Publish a message. Returns the number of queues it was copied into;
    /// 0 means it matched nothing and was dropped.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> Result<usize> {
        let message = Message::new(exchange, routing_key, payload, headers);
        self.route_message(exchange, routing_key, message)
    }

    fn route_message(&self, exchange: &str, routing_key: &str, message: Message) -> Result<usize> {
        let router = &self.inner.router;
        let mut targets = router.route(exchange, routing_key, |q| self.has_queue(q))?;

        if targets.is_empty() {
            if let Some(alternate) = router.exchange(exchange).and_then(|e| e.alternate_exchange) {
                match router.route(&alternate, routing_key, |q| self.has_queue(q)) {
                    Ok(alt_targets) => targets = alt_targets,
                    Err(e) => warn!(exchange, alternate = %alternate, error = %e, "alternate exchange unusable"),
                }
            }
        }

        if targets.is_empty() {
            debug!(exchange, routing_key, message_id = %message.message_id, "message unroutable");
            self.emit(BrokerEvent::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message_id: message.message_id,
            });
            return Ok(0);
        }

        self.enqueue_all(&targets, message)
    }

    fn enqueue_all(&self, targets: &BTreeSet<String>, message: Message) -> Result<usize> {
        let mut delivered = 0;
        for name in targets {
            // deleted between routing and enqueue
            let Ok(queue) = self.queue(name) else {
                continue;
            };
            queue.enqueue(message.clone())?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Subscribe to a queue. The returned stream yields deliveries as they
    /// are assigned; drop it to cancel.
    pub fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer> {
        self.queue(queue)?.consume(prefetch)
    }

    /// Take one ready message without subscribing.
    pub fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.queue(queue)?.get()
    }

    pub fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.queue(queue)?.ack(tag)
    }

    /// Reject a delivery. With `requeue` the message is retried until the
    /// queue's retry limit, then dead-lettered; without it, dead-lettered now.
    pub fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let queue = self.queue(queue)?;
        if let Some(dead) = queue.nack(tag, requeue)? {
            self.dead_letter(&queue, dead);
        }
        Ok(())
    }

    fn dead_letter(&self, queue: &Queue, dead: DeadLetter) {
        let seq = dead.entry.seq;
        let message_id = dead.message().message_id.clone();
        let reason = dead.reason;

        let outcome = match dead_letter::redirect(&dead, queue.name(), queue.options()) {
            Redirect::Drop => None,
            Redirect::Republish {
                exchange,
                routing_key,
                message,
            } => match self.route_message(&exchange, &routing_key, message) {
                Ok(0) => None,
                Ok(routed) => Some((exchange, routed)),
                Err(BrokerError::UnknownExchange(missing)) => {
                    warn!(queue = %queue.name(), exchange = %missing, "dead-letter exchange does not exist");
                    None
                }
                Err(e) => {
                    error!(queue = %queue.name(), %message_id, error = %e, "dead-lettering failed, message restored");
                    queue.restore(dead.entry);
                    return;
                }
            },
        };

        match outcome {
            Some((exchange, routed)) => {
                debug!(queue = %queue.name(), %exchange, %message_id, %reason, "message dead-lettered");
                self.emit(BrokerEvent::DeadLettered {
                    queue: queue.name().to_string(),
                    exchange,
                    message_id,
                    reason,
                    routed,
                });
            }
            None => {
                warn!(queue = %queue.name(), %message_id, %reason, "message dropped");
                self.emit(BrokerEvent::MessageDropped {
                    queue: queue.name().to_string(),
                    message_id,
                    reason,
                });
            }
        }
        queue.forget(seq);
    }

    /// Run one sweep over every queue at time `now` (ms since epoch).
    /// Returns how many deliveries timed out.
    pub fn sweep_at(&self, now: i64) -> usize {
        let queues: Vec<Arc<Queue>> = self
            .inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut timed_out = 0;
        for queue in queues {
            let outcome = queue.sweep(now, self.inner.settings.redelivery_timeout_ms);
            for (tag, consumer) in outcome.timed_out {
                debug!(queue = %queue.name(), %tag, ?consumer, "redelivery timeout");
                self.emit(BrokerEvent::RedeliveryTimeout {
                    queue: queue.name().to_string(),
                    delivery_tag: tag.0,
                    consumer,
                });
                timed_out += 1;
            }
            for dead in outcome.dead_letters {
                self.dead_letter(&queue, dead);
            }
        }
        timed_out
    }

    /// Background loop that sweeps every `sweep_interval_ms`. Never returns.
    ///
    /// Each sweep may touch the store, so it runs on the blocking pool.
    pub async fn run_sweeper(self) {
        let period = Duration::from_millis(self.inner.settings.sweep_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let broker = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || broker.sweep_at(now_ms())).await {
                error!(error = %e, "sweep task failed");
            }
        }
    }
}
