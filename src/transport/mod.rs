//! The `transport` module exposes the broker over WebSockets.
//!
//! It defines the JSON protocol spoken with clients and the server that
//! accepts connections, parses commands and forwards them to the `Broker`.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;
