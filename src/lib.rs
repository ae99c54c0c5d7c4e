//! # popmq
//!
//! `popmq` is a message broker core with exchange-style routing,
//! competing-consumer queues, acknowledgment-based redelivery and
//! dead-letter handling, plus a small JSON-over-WebSocket front end.
//!
//! ## Core Modules
//!
//! - `broker`: exchanges, bindings, the router, queues, the delivery
//!   dispatcher and the dead-letter redirector, tied together by `Broker`.
//! - `client`: per-connection state kept by the WebSocket front end.
//! - `config`: loading settings from files and environment variables.
//! - `persistence`: the `MessageStore` interface and its sled and in-memory
//!   implementations.
//! - `transport`: the WebSocket server and its JSON protocol.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::{Broker, Consumer, Delivery, DeliveryTag, ExchangeKind, QueueOptions};
pub use utils::error::{BrokerError, Result};
