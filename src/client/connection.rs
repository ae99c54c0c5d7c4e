use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tungstenite::protocol::Message as WsMessage;

/// Represents a connected WebSocket client.
///
/// Each client is uniquely identified by an `id`, has a channel (`sender`)
/// for frames going back over its socket, and owns one forwarding task per
/// active consumer. Aborting a forwarding task drops its `Consumer`, which
/// returns unacked deliveries to the queue.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for the client (`client-<uuid>`).
    pub id: String,

    /// Channel to send WebSocket messages to the client.
    pub sender: UnboundedSender<WsMessage>,

    consumers: HashMap<String, JoinHandle<()>>,
}

impl Client {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", uuid::Uuid::new_v4()),
            sender,
            consumers: HashMap::new(),
        }
    }

    pub fn add_consumer(&mut self, consumer_tag: String, forwarder: JoinHandle<()>) {
        if let Some(previous) = self.consumers.insert(consumer_tag, forwarder) {
            previous.abort();
        }
    }

    /// Stop forwarding for `consumer_tag`. Returns `false` if it was unknown.
    pub fn cancel_consumer(&mut self, consumer_tag: &str) -> bool {
        match self.consumers.remove(consumer_tag) {
            Some(forwarder) => {
                forwarder.abort();
                true
            }
            None => false,
        }
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.consumers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Cancel every consumer this client holds.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.consumers.len();
        for (_, forwarder) in self.consumers.drain() {
            forwarder.abort();
        }
        count
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
