//! Router
//!
//! Owns the exchange registry and the binding table and resolves a publish
//! into the set of queues it must be copied to. Routing has no side effects:
//! it reads the current registry and bindings and nothing else.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::broker::binding::{Binding, BindingTable};
use crate::broker::exchange::{DEFAULT_EXCHANGE, Exchange, ExchangeKind};
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
pub struct Router {
    exchanges: RwLock<HashMap<String, Exchange>>,
    bindings: BindingTable,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// A router holding only the default exchange.
    pub fn new() -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert(
            DEFAULT_EXCHANGE.to_string(),
            Exchange::new(DEFAULT_EXCHANGE, ExchangeKind::Direct, true),
        );
        Self {
            exchanges: RwLock::new(exchanges),
            bindings: BindingTable::new(),
        }
    }

    /// Register an exchange. Returns `true` when it was newly created.
    pub fn declare_exchange(&self, exchange: Exchange) -> Result<bool> {
        if exchange.name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "the default exchange cannot be redeclared".into(),
            ));
        }
        let mut exchanges = self.exchanges.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = exchanges.get(&exchange.name) {
            return match existing.incompatibility(&exchange) {
                Some(reason) => Err(BrokerError::conflict("exchange", &exchange.name, reason)),
                None => Ok(false),
            };
        }
        debug!(exchange = %exchange.name, kind = %exchange.kind, "exchange declared");
        exchanges.insert(exchange.name.clone(), exchange);
        Ok(true)
    }

    /// Remove an exchange together with its bindings, returning both.
    pub fn delete_exchange(&self, name: &str) -> Result<(Exchange, Vec<Binding>)> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "the default exchange cannot be deleted".into(),
            ));
        }
        let removed = self
            .exchanges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| BrokerError::UnknownExchange(name.to_string()))?;
        let bindings = self.bindings.remove_exchange(name);
        Ok((removed, bindings))
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.exchanges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut out: Vec<Exchange> = self
            .exchanges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Add a binding. The exchange must exist; queue existence is the
    /// caller's concern. Returns `false` for a repeated binding.
    pub fn bind(&self, binding: &Binding) -> Result<bool> {
        if binding.exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "queues cannot be bound to the default exchange explicitly".into(),
            ));
        }
        if self.exchange(&binding.exchange).is_none() {
            return Err(BrokerError::UnknownExchange(binding.exchange.clone()));
        }
        Ok(self.bindings.bind(binding))
    }

    pub fn unbind(&self, binding: &Binding) -> Result<bool> {
        if binding.exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "queues cannot be unbound from the default exchange".into(),
            ));
        }
        if self.exchange(&binding.exchange).is_none() {
            return Err(BrokerError::UnknownExchange(binding.exchange.clone()));
        }
        Ok(self.bindings.unbind(binding))
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Resolve a publish to the queues it must be copied into.
    ///
    /// The default exchange routes to the queue named by the routing key,
    /// `known_queue` tells whether such a queue exists.
    pub fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        known_queue: impl Fn(&str) -> bool,
    ) -> Result<BTreeSet<String>> {
        if exchange == DEFAULT_EXCHANGE {
            let mut targets = BTreeSet::new();
            if known_queue(routing_key) {
                targets.insert(routing_key.to_string());
            }
            return Ok(targets);
        }
        let kind = self
            .exchange(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        Ok(self
            .bindings
            .bindings_for(exchange, routing_key, kind)
            .into_iter()
            .map(|b| b.queue)
            .collect())
    }
}
