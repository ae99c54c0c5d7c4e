use tempfile::tempdir;

use crate::broker::binding::Binding;
use crate::broker::exchange::{Exchange, ExchangeKind};
use crate::broker::message::{Headers, Message};
use crate::broker::queue::QueueOptions;
use crate::persistence::{
    DeliveryState, MemoryStore, MessageStore, SledStore, StoredMessage, StoredQueue,
};
use crate::utils::error::StorageError;

fn stored(seq: u64, payload: &str) -> StoredMessage {
    StoredMessage {
        seq,
        message: Message::new("", "q", payload, Headers::new()),
        enqueued_at: 1_700_000_000_000,
        deliveries: 0,
        state: DeliveryState::Ready,
    }
}

fn payloads(messages: &[StoredMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8_lossy(&m.message.payload).into_owned())
        .collect()
}

/// Shared checks every store implementation must pass.
fn exercise_messages(store: &dyn MessageStore) {
    // inserted out of order, loaded by sequence
    for (seq, payload) in [(3, "c"), (1, "a"), (300, "z"), (2, "b")] {
        store.put_message("q", &stored(seq, payload)).unwrap();
    }
    store.put_message("other", &stored(1, "elsewhere")).unwrap();
    assert_eq!(payloads(&store.load_messages("q").unwrap()), ["a", "b", "c", "z"]);

    let mut updated = stored(2, "b");
    updated.deliveries = 1;
    updated.state = DeliveryState::InFlight { tag: 7 };
    store.put_message("q", &updated).unwrap();
    let loaded = store.load_messages("q").unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded[1].state, DeliveryState::InFlight { tag: 7 });

    store.remove_message("q", 1).unwrap();
    store.remove_message("q", 42).unwrap();
    assert_eq!(payloads(&store.load_messages("q").unwrap()), ["b", "c", "z"]);

    assert_eq!(store.clear_queue("q").unwrap(), 3);
    assert!(store.load_messages("q").unwrap().is_empty());
    assert_eq!(store.load_messages("other").unwrap().len(), 1);
    assert!(store.load_messages("never").unwrap().is_empty());
}

fn exercise_topology(store: &dyn MessageStore) {
    let exchange = Exchange::new("orders", ExchangeKind::Topic, true).with_alternate("ae");
    store.save_exchange(&exchange).unwrap();
    store.save_exchange(&exchange).unwrap();
    assert_eq!(store.load_exchanges().unwrap(), vec![exchange]);

    let queue = StoredQueue {
        name: "book".into(),
        options: QueueOptions::default().durable().dead_letter("dlx", Some("dead")),
    };
    store.save_queue(&queue).unwrap();
    assert_eq!(store.load_queues().unwrap(), vec![queue]);

    let binding = Binding::new("orders", "book", "order.*");
    store.save_binding(&binding).unwrap();
    store.save_binding(&binding).unwrap();
    assert_eq!(store.load_bindings().unwrap(), vec![binding.clone()]);

    store.delete_binding(&binding).unwrap();
    store.delete_exchange("orders").unwrap();
    store.put_message("book", &stored(1, "x")).unwrap();
    store.delete_queue("book").unwrap();
    assert!(store.load_bindings().unwrap().is_empty());
    assert!(store.load_exchanges().unwrap().is_empty());
    assert!(store.load_queues().unwrap().is_empty());
    assert!(store.load_messages("book").unwrap().is_empty());
}

#[test]
fn test_sled_messages() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), false).unwrap();
    exercise_messages(&store);
}

#[test]
fn test_sled_topology() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), true).unwrap();
    exercise_topology(&store);
}

#[test]
fn test_sled_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap();
    {
        let store = SledStore::open(path, true).unwrap();
        store.put_message("q", &stored(1, "kept")).unwrap();
        store
            .save_exchange(&Exchange::new("logs", ExchangeKind::Fanout, true))
            .unwrap();
    }
    let store = SledStore::open(path, true).unwrap();
    assert_eq!(payloads(&store.load_messages("q").unwrap()), ["kept"]);
    assert_eq!(store.load_exchanges().unwrap()[0].name, "logs");
}

#[test]
fn test_memory_messages() {
    exercise_messages(&MemoryStore::new());
}

#[test]
fn test_memory_topology() {
    exercise_topology(&MemoryStore::new());
}

#[test]
fn test_memory_fail_writes() {
    let store = MemoryStore::new();
    store.put_message("q", &stored(1, "a")).unwrap();

    store.fail_writes(true);
    assert!(matches!(
        store.put_message("q", &stored(2, "b")),
        Err(StorageError::Unavailable(_))
    ));
    assert!(store.remove_message("q", 1).is_err());
    assert!(store.save_binding(&Binding::new("e", "q", "")).is_err());
    // reads keep working
    assert_eq!(payloads(&store.load_messages("q").unwrap()), ["a"]);

    store.fail_writes(false);
    store.put_message("q", &stored(2, "b")).unwrap();
    assert_eq!(store.load_messages("q").unwrap().len(), 2);
}

#[test]
fn test_stored_message_json_shape() {
    let mut message = stored(9, "x");
    message.state = DeliveryState::InFlight { tag: 4 };
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["seq"], 9);
    assert_eq!(value["state"]["state"], "in_flight");
    assert_eq!(value["state"]["tag"], 4);
}

#[test]
fn test_memory_write_budget() {
    let store = MemoryStore::new();
    store.fail_writes_after(2);
    store.put_message("q", &stored(1, "a")).unwrap();
    store.put_message("q", &stored(2, "b")).unwrap();
    assert!(matches!(
        store.put_message("q", &stored(3, "c")),
        Err(StorageError::Unavailable(_))
    ));
    assert!(store.remove_message("q", 1).is_err());
    assert_eq!(payloads(&store.load_messages("q").unwrap()), ["a", "b"]);

    // lifting the failure also lifts the budget
    store.fail_writes(false);
    store.put_message("q", &stored(3, "c")).unwrap();
    store.remove_message("q", 1).unwrap();
    assert_eq!(payloads(&store.load_messages("q").unwrap()), ["b", "c"]);
}
