//! Persistence layer backed by `sled`
//!
//! Each durable queue gets its own tree named `queue/<name>`. Keys are the
//! big-endian message sequence number, so iteration yields messages in
//! queue order. Values are JSON-encoded `StoredMessage` records.
//!
//! Topology lives in three trees: `meta/exchanges` and `meta/queues` keyed
//! by name, and `meta/bindings` keyed by `exchange \0 queue \0 routing_key`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use tracing::debug;

use crate::broker::binding::Binding;
use crate::broker::exchange::Exchange;
use crate::persistence::{MessageStore, StoreResult, StoredMessage, StoredQueue};

const EXCHANGES_TREE: &str = "meta/exchanges";
const QUEUES_TREE: &str = "meta/queues";
const BINDINGS_TREE: &str = "meta/bindings";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    flush_every_write: bool,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    ///
    /// With `flush_every_write`, every mutation is flushed to disk before
    /// the call returns.
    pub fn open(path: &str, flush_every_write: bool) -> StoreResult<Self> {
        let db = sled::open(path)?;
        debug!(path, "opened sled store");
        Ok(Self {
            db,
            flush_every_write,
        })
    }

    fn queue_tree(&self, queue: &str) -> StoreResult<Tree> {
        Ok(self.db.open_tree(format!("queue/{queue}"))?)
    }

    fn flush(&self) -> StoreResult<()> {
        if self.flush_every_write {
            self.db.flush()?;
        }
        Ok(())
    }

    fn put<T: Serialize>(&self, tree: &str, key: &[u8], value: &T) -> StoreResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.db.open_tree(tree)?.insert(key, encoded)?;
        self.flush()
    }

    fn delete(&self, tree: &str, key: &[u8]) -> StoreResult<()> {
        self.db.open_tree(tree)?.remove(key)?;
        self.flush()
    }

    fn load_all<T: DeserializeOwned>(tree: &Tree) -> StoreResult<Vec<T>> {
        tree.iter()
            .values()
            .map(|value| -> StoreResult<T> { Ok(serde_json::from_slice(&value?)?) })
            .collect()
    }
}

fn binding_key(binding: &Binding) -> Vec<u8> {
    format!(
        "{}\0{}\0{}",
        binding.exchange, binding.queue, binding.routing_key
    )
    .into_bytes()
}

impl MessageStore for SledStore {
    fn put_message(&self, queue: &str, message: &StoredMessage) -> StoreResult<()> {
        let encoded = serde_json::to_vec(message)?;
        self.queue_tree(queue)?
            .insert(message.seq.to_be_bytes(), encoded)?;
        self.flush()
    }

    fn remove_message(&self, queue: &str, seq: u64) -> StoreResult<()> {
        self.queue_tree(queue)?.remove(seq.to_be_bytes())?;
        self.flush()
    }

    fn load_messages(&self, queue: &str) -> StoreResult<Vec<StoredMessage>> {
        Self::load_all(&self.queue_tree(queue)?)
    }

    fn clear_queue(&self, queue: &str) -> StoreResult<usize> {
        let tree = self.queue_tree(queue)?;
        let count = tree.len();
        tree.clear()?;
        self.flush()?;
        Ok(count)
    }

    fn save_exchange(&self, exchange: &Exchange) -> StoreResult<()> {
        self.put(EXCHANGES_TREE, exchange.name.as_bytes(), exchange)
    }

    fn delete_exchange(&self, name: &str) -> StoreResult<()> {
        self.delete(EXCHANGES_TREE, name.as_bytes())
    }

    fn load_exchanges(&self) -> StoreResult<Vec<Exchange>> {
        Self::load_all(&self.db.open_tree(EXCHANGES_TREE)?)
    }

    fn save_queue(&self, queue: &StoredQueue) -> StoreResult<()> {
        self.put(QUEUES_TREE, queue.name.as_bytes(), queue)
    }

    fn delete_queue(&self, name: &str) -> StoreResult<()> {
        self.delete(QUEUES_TREE, name.as_bytes())?;
        self.db.drop_tree(format!("queue/{name}"))?;
        Ok(())
    }

    fn load_queues(&self) -> StoreResult<Vec<StoredQueue>> {
        Self::load_all(&self.db.open_tree(QUEUES_TREE)?)
    }

    fn save_binding(&self, binding: &Binding) -> StoreResult<()> {
        self.put(BINDINGS_TREE, &binding_key(binding), binding)
    }

    fn delete_binding(&self, binding: &Binding) -> StoreResult<()> {
        self.delete(BINDINGS_TREE, &binding_key(binding))
    }

    fn load_bindings(&self) -> StoreResult<Vec<Binding>> {
        Self::load_all(&self.db.open_tree(BINDINGS_TREE)?)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("flush_every_write", &self.flush_every_write)
            .finish()
    }
}
