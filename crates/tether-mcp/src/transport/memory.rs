//! In-process transport pair.

use super::{HandlerSlot, Transport, TransportHandlers};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::trace;

/// One end of a connected in-memory transport pair.
///
/// Frames sent on one end are delivered to the other end's message callback.
/// Frames that arrive before `start()` are held until it is called.
pub struct MemoryTransport {
    label: &'static str,
    peer: OnceLock<Weak<MemoryTransport>>,
    slot: HandlerSlot,
    started: AtomicBool,
    backlog: Mutex<Vec<Vec<u8>>>,
    sends: AtomicUsize,
    credentials: Mutex<Option<String>>,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let left = Arc::new(Self::new("left"));
        let right = Arc::new(Self::new("right"));
        let _ = left.peer.set(Arc::downgrade(&right));
        let _ = right.peer.set(Arc::downgrade(&left));
        (left, right)
    }

    fn new(label: &'static str) -> Self {
        Self {
            label,
            peer: OnceLock::new(),
            slot: HandlerSlot::default(),
            started: AtomicBool::new(false),
            backlog: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
            credentials: Mutex::new(None),
        }
    }

    /// Number of frames passed to `send` so far.
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Credentials this end reports as presented by its peer.
    pub fn set_credentials(&self, token: impl Into<String>) {
        if let Ok(mut creds) = self.credentials.lock() {
            *creds = Some(token.into());
        }
    }

    fn peer(&self) -> Option<Arc<MemoryTransport>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn deliver(&self, frame: Vec<u8>) {
        if let Ok(mut backlog) = self.backlog.lock() {
            if !self.started.load(Ordering::SeqCst) {
                backlog.push(frame);
                return;
            }
        }
        self.slot.emit_message(frame);
    }

    fn shut(&self) {
        self.slot.emit_close();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> TransportResult<()> {
        let pending = match self.backlog.lock() {
            Ok(mut backlog) => {
                if self.started.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                std::mem::take(&mut *backlog)
            }
            Err(_) => {
                self.started.store(true, Ordering::SeqCst);
                Vec::new()
            }
        };
        for frame in pending {
            self.slot.emit_message(frame);
        }
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.slot.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        trace!(side = self.label, frame = %String::from_utf8_lossy(&frame), "memory send");
        match self.peer() {
            Some(peer) if !peer.slot.is_closed() => {
                peer.deliver(frame);
                Ok(())
            }
            _ => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.shut();
        if let Some(peer) = self.peer() {
            peer.shut();
        }
        Ok(())
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.slot.set(handlers);
    }

    fn is_connected(&self) -> bool {
        !self.slot.is_closed()
    }

    fn credentials(&self) -> Option<String> {
        self.credentials.lock().ok().and_then(|c| c.clone())
    }
}
