//! Outbound requests awaiting a response.

use super::handler::ProgressCallback;
use crate::error::McpResult;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type ResultSink = oneshot::Sender<McpResult<Value>>;

pub(crate) struct PendingRequest {
    pub id: i64,
    pub method: String,
    pub sent_at: Instant,
    pub sink: ResultSink,
    pub on_progress: Option<ProgressCallback>,
}

/// Pending requests keyed by id. Ordered so a drain visits ids ascending.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: BTreeMap<i64, PendingRequest>,
}

impl PendingTable {
    pub fn insert(&mut self, request: PendingRequest) {
        self.entries.insert(request.id, request);
    }

    /// Remove a request so it can be resolved. `None` if already resolved.
    pub fn take(&mut self, id: i64) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    pub fn progress_callback(&self, id: i64) -> Option<ProgressCallback> {
        self.entries.get(&id).and_then(|p| p.on_progress.clone())
    }

    pub fn ids(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }

    /// Remove everything, in ascending id order.
    pub fn drain_in_order(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
