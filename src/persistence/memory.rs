//! In-memory `MessageStore`.
//!
//! Keeps the same ordering guarantees as the sled store but nothing
//! survives the process. Writes can be made to fail on demand so callers'
//! storage-error paths can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::broker::binding::Binding;
use crate::broker::exchange::Exchange;
use crate::persistence::{MessageStore, StoreResult, StoredMessage, StoredQueue};
use crate::utils::error::StorageError;

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<String, BTreeMap<u64, StoredMessage>>,
    exchanges: BTreeMap<String, Exchange>,
    queues: BTreeMap<String, StoredQueue>,
    bindings: Vec<Binding>,
}

const UNLIMITED: usize = usize::MAX;

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    /// Writes still allowed before they start failing.
    write_budget: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            fail_writes: AtomicBool::new(false),
            write_budget: AtomicUsize::new(UNLIMITED),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again). Either way any
    /// budget set by `fail_writes_after` is lifted.
    pub fn fail_writes(&self, fail: bool) {
        self.write_budget.store(UNLIMITED, Ordering::SeqCst);
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `writes` more writes succeed, then fail every one after them.
    pub fn fail_writes_after(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        self.write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            })
            .map_err(|_| StorageError::Unavailable("write budget exhausted".into()))?;
        Ok(self.lock())
    }
}

impl MessageStore for MemoryStore {
    fn put_message(&self, queue: &str, message: &StoredMessage) -> StoreResult<()> {
        self.writable()?
            .messages
            .entry(queue.to_string())
            .or_default()
            .insert(message.seq, message.clone());
        Ok(())
    }

    fn remove_message(&self, queue: &str, seq: u64) -> StoreResult<()> {
        if let Some(messages) = self.writable()?.messages.get_mut(queue) {
            messages.remove(&seq);
        }
        Ok(())
    }

    fn load_messages(&self, queue: &str) -> StoreResult<Vec<StoredMessage>> {
        Ok(self
            .lock()
            .messages
            .get(queue)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clear_queue(&self, queue: &str) -> StoreResult<usize> {
        Ok(self
            .writable()?
            .messages
            .remove(queue)
            .map(|m| m.len())
            .unwrap_or(0))
    }

    fn save_exchange(&self, exchange: &Exchange) -> StoreResult<()> {
        self.writable()?
            .exchanges
            .insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    fn delete_exchange(&self, name: &str) -> StoreResult<()> {
        self.writable()?.exchanges.remove(name);
        Ok(())
    }

    fn load_exchanges(&self) -> StoreResult<Vec<Exchange>> {
        Ok(self.lock().exchanges.values().cloned().collect())
    }

    fn save_queue(&self, queue: &StoredQueue) -> StoreResult<()> {
        self.writable()?
            .queues
            .insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    fn delete_queue(&self, name: &str) -> StoreResult<()> {
        let mut inner = self.writable()?;
        inner.queues.remove(name);
        inner.messages.remove(name);
        Ok(())
    }

    fn load_queues(&self) -> StoreResult<Vec<StoredQueue>> {
        Ok(self.lock().queues.values().cloned().collect())
    }

    fn save_binding(&self, binding: &Binding) -> StoreResult<()> {
        let mut inner = self.writable()?;
        if !inner.bindings.contains(binding) {
            inner.bindings.push(binding.clone());
        }
        Ok(())
    }

    fn delete_binding(&self, binding: &Binding) -> StoreResult<()> {
        self.writable()?.bindings.retain(|b| b != binding);
        Ok(())
    }

    fn load_bindings(&self) -> StoreResult<Vec<Binding>> {
        Ok(self.lock().bindings.clone())
    }
}
