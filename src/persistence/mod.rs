//! The `persistence` module stores durable broker state.
//!
//! Durable queues write every message to a `MessageStore` before it becomes
//! visible in memory, and update the stored record as it moves between
//! ready and in-flight. On restart the broker reloads each durable queue in
//! sequence order, so both ordering and the ready/in-flight distinction
//! survive. Durable exchanges, queues and their bindings are stored too.
//!
//! Two implementations exist: `SledStore`, backed by the embedded `sled`
//! key-value store, and `MemoryStore`, used by tests and the `memory`
//! backend.

pub mod memory;
pub mod sled_store;

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::broker::binding::Binding;
use crate::broker::exchange::Exchange;
use crate::broker::message::Message;
use crate::broker::queue::QueueOptions;
use crate::utils::error::StorageError;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// Where a stored message sits in its queue's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Ready,
    InFlight { tag: u64 },
}

/// One message in one queue, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Position in the queue. Strictly increasing per queue.
    pub seq: u64,
    pub message: Message,
    /// When the message entered this queue (ms since epoch).
    pub enqueued_at: i64,
    /// How many times it has been handed out from this queue.
    pub deliveries: u32,
    pub state: DeliveryState,
}

/// Durable queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredQueue {
    pub name: String,
    pub options: QueueOptions,
}

/// Storage backend for durable queues and topology.
///
/// Implementations must return messages from `load_messages` in ascending
/// `seq` order and must not report success for writes they did not apply.
pub trait MessageStore: Send + Sync + Debug {
    /// Insert or overwrite the record for `(queue, message.seq)`.
    fn put_message(&self, queue: &str, message: &StoredMessage) -> StoreResult<()>;

    fn remove_message(&self, queue: &str, seq: u64) -> StoreResult<()>;

    fn load_messages(&self, queue: &str) -> StoreResult<Vec<StoredMessage>>;

    /// Remove every message of `queue`, returning how many there were.
    fn clear_queue(&self, queue: &str) -> StoreResult<usize>;

    fn save_exchange(&self, exchange: &Exchange) -> StoreResult<()>;

    fn delete_exchange(&self, name: &str) -> StoreResult<()>;

    fn load_exchanges(&self) -> StoreResult<Vec<Exchange>>;

    fn save_queue(&self, queue: &StoredQueue) -> StoreResult<()>;

    fn delete_queue(&self, name: &str) -> StoreResult<()>;

    fn load_queues(&self) -> StoreResult<Vec<StoredQueue>>;

    fn save_binding(&self, binding: &Binding) -> StoreResult<()>;

    fn delete_binding(&self, binding: &Binding) -> StoreResult<()>;

    fn load_bindings(&self) -> StoreResult<Vec<Binding>>;
}

#[cfg(test)]
mod tests;
