//! The `client` module defines the state kept for one WebSocket connection.
//!
//! A `Client` carries the connection's identifier, the channel for frames
//! going back to it, and the consumers it opened, so that a disconnect can
//! cancel all of them.

pub mod connection;
pub use connection::Client;

#[cfg(test)]
mod tests;
