//! The broker core: exchanges, bindings, routing, queues, dispatch and
//! dead-lettering. `Broker` in `engine` ties the pieces together.

pub mod binding;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod router;

pub use dispatcher::Consumer;
pub use engine::Broker;
pub use events::BrokerEvent;
pub use exchange::{Exchange, ExchangeKind};
pub use message::{Delivery, DeliveryTag, Headers, Message};
pub use queue::{QueueOptions, QueueStats};
