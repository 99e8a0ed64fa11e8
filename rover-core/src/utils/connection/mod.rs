//! Connection handling.
//!
//! # Modules
//! - `protocol`: JSON commands, replies and frame messages
//! - `outbox`: serialized single-writer queue towards the peer
//! - `session`: the per-connection command loop and its cleanup
//! - `server`: axum routes, session registry and the listener

pub mod outbox;
pub mod protocol;
/// HTTP and WebSocket server, including the session registry.
pub mod server;
pub mod session;
