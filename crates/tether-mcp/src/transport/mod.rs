//! Transport contract and its implementations.
//!
//! A transport moves whole frames (one JSON document each) between two peers.
//! It never interprets them; decoding is the engine's job.

mod http_client;
mod memory;
mod sse;
mod stdio;
mod websocket;

pub use http_client::StreamableHttpClientTransport;
pub use memory::MemoryTransport;
pub use sse::{SseEvent, SseParser};
pub use stdio::{StdioCommand, StdioTransport};
pub use websocket::{serve_websocket, WebSocketTransport};

use crate::error::{TransportError, TransportResult};
use crate::protocol::RequestId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Grace period `close()` waits for queued writes to flush.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Header carrying the streamable HTTP session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Header a reconnecting SSE client sends to resume a stream.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub type MessageCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(TransportError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks a transport invokes as frames arrive and its state changes.
#[derive(Clone, Default)]
pub struct TransportHandlers {
    pub on_message: Option<MessageCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_close: Option<CloseCallback>,
}

impl TransportHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }
}

/// A pluggable frame transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin reading. Idempotent.
    async fn start(&self) -> TransportResult<()>;

    /// Queue one frame for the peer.
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()>;

    /// Queue a frame that belongs to an inbound request (a response, or a
    /// notification emitted while handling it).
    async fn send_related(&self, frame: Vec<u8>, related: &RequestId) -> TransportResult<()> {
        let _ = related;
        self.send(frame).await
    }

    /// Flush and release the connection. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    /// Install callbacks. Must be called before `start()`.
    fn set_handlers(&self, handlers: TransportHandlers);

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Session identifier, for transports that have one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Raw credentials presented by the peer (e.g. a bearer token).
    fn credentials(&self) -> Option<String> {
        None
    }
}

/// Callback slot shared by a transport and its background tasks.
///
/// Enforces the callback lifecycle: close fires once, and nothing fires after it.
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handlers: RwLock<TransportHandlers>,
    closed: AtomicBool,
}

impl HandlerSlot {
    pub(crate) fn set(&self, handlers: TransportHandlers) {
        if let Ok(mut slot) = self.handlers.write() {
            *slot = handlers;
        }
    }

    fn current(&self) -> TransportHandlers {
        self.handlers
            .read()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub(crate) fn emit_message(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if let Some(cb) = self.current().on_message {
            cb(frame);
        }
    }

    pub(crate) fn emit_error(&self, error: TransportError) {
        if self.is_closed() {
            return;
        }
        if let Some(cb) = self.current().on_error {
            cb(error);
        }
    }

    /// Fire the close callback. Returns `false` if it already fired.
    pub(crate) fn emit_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(cb) = self.current().on_close {
            cb();
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub(crate) fn bearer_token(header: &str) -> Option<String> {
    let header = header.trim();
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_slot_close_fires_once() {
        let slot = HandlerSlot::default();
        let closes = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        let m = messages.clone();
        slot.set(
            TransportHandlers::new()
                .on_message(move |_| {
                    m.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        );

        slot.emit_message(b"{}".to_vec());
        assert!(slot.emit_close());
        assert!(!slot.emit_close());
        slot.emit_message(b"{}".to_vec());

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc".to_string()));
        assert_eq!(bearer_token("bearer  xyz "), Some("xyz".to_string()));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
