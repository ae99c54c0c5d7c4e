//! Binding table
//!
//! Maps each exchange to the set of `(queue, routing key)` pairs bound to it.
//! Lookups vastly outnumber binds, so the table sits behind an `RwLock`:
//! many concurrent routing reads, exclusive writers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::broker::exchange::ExchangeKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// `(queue, routing key)` as stored under an exchange.
type Target = (String, String);

#[derive(Debug, Default)]
pub struct BindingTable {
    by_exchange: RwLock<HashMap<String, BTreeSet<Target>>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a binding. Returns `false` when it already existed.
    pub fn bind(&self, binding: &Binding) -> bool {
        let mut table = self.by_exchange.write().unwrap_or_else(PoisonError::into_inner);
        table
            .entry(binding.exchange.clone())
            .or_default()
            .insert((binding.queue.clone(), binding.routing_key.clone()))
    }

    /// Remove a binding. Returns `false` when it was not present.
    pub fn unbind(&self, binding: &Binding) -> bool {
        let mut table = self.by_exchange.write().unwrap_or_else(PoisonError::into_inner);
        let Some(targets) = table.get_mut(&binding.exchange) else {
            return false;
        };
        let removed = targets.remove(&(binding.queue.clone(), binding.routing_key.clone()));
        if targets.is_empty() {
            table.remove(&binding.exchange);
        }
        removed
    }

    /// Bindings on `exchange` whose key accepts `routing_key` under `kind` semantics.
    pub fn bindings_for(&self, exchange: &str, routing_key: &str, kind: ExchangeKind) -> Vec<Binding> {
        let table = self.by_exchange.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(exchange)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|(_, key)| kind.matches(key, routing_key))
                    .map(|(queue, key)| Binding::new(exchange, queue, key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every binding currently in the table, sorted.
    pub fn all(&self) -> Vec<Binding> {
        let table = self.by_exchange.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Binding> = table
            .iter()
            .flat_map(|(exchange, targets)| {
                targets
                    .iter()
                    .map(move |(queue, key)| Binding::new(exchange, queue, key))
            })
            .collect();
        out.sort();
        out
    }

    /// Drop every binding that targets `queue`, returning them.
    pub fn remove_queue(&self, queue: &str) -> Vec<Binding> {
        let mut table = self.by_exchange.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        table.retain(|exchange, targets| {
            targets.retain(|(q, key)| {
                if q == queue {
                    removed.push(Binding::new(exchange, q, key));
                    false
                } else {
                    true
                }
            });
            !targets.is_empty()
        });
        removed
    }

    /// Drop every binding on `exchange`, returning them.
    pub fn remove_exchange(&self, exchange: &str) -> Vec<Binding> {
        let mut table = self.by_exchange.write().unwrap_or_else(PoisonError::into_inner);
        table
            .remove(exchange)
            .map(|targets| {
                targets
                    .into_iter()
                    .map(|(queue, key)| Binding::new(exchange, &queue, &key))
                    .collect()
            })
            .unwrap_or_default()
    }
}
