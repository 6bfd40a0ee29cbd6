//! Signaling transport: named-event pub/sub over a persistent connection.
//!
//! The call core only sees the `SignalTransport` trait. The production
//! implementation speaks Socket.IO over a WebSocket (`websocket.rs`); tests use
//! the in-memory hub in `memory.rs`.

#[cfg(test)]
pub mod memory;
pub mod router;
pub mod socketio;
pub mod websocket;

pub use router::{EventHandler, ListenerId};

/// Why an emit did not go out.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("failed to encode {event} payload: {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Contract the call core consumes.
///
/// `emit` is fire-and-forget with no delivery guarantee (at most once). A
/// disconnected transport reports `NotConnected` instead of queueing, so the
/// caller can treat the signal as not sent.
pub trait SignalTransport: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TransportError>;

    fn on(&self, event: &str, handler: EventHandler) -> ListenerId;

    fn off(&self, event: &str, id: ListenerId) -> bool;

    /// Advisory only: never wait on it.
    fn is_connected(&self) -> bool;
}
