//! Registry of import-batch subscriptions and their progress handlers.
//!
//! The registry outlives the connection: entries survive disconnects and
//! reconnect attempts, and the channel replays a subscribe frame for every
//! entry each time the connection is re-established.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::realtime::protocol::ImportProgress;

/// Callback invoked for every progress snapshot of a subscribed batch
pub type ProgressHandler = Arc<dyn Fn(ImportProgress) -> anyhow::Result<()> + Send + Sync>;

/// Connection-independent map of batch id to progress handler
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    handlers: Arc<DashMap<String, ProgressHandler>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a batch; a second registration for the same
    /// batch silently replaces the first
    pub fn insert(&self, batch_id: impl Into<String>, handler: ProgressHandler) {
        let batch_id = batch_id.into();
        debug!(batch_id = %batch_id, "Registered import subscription");
        self.handlers.insert(batch_id, handler);
    }

    pub fn remove(&self, batch_id: &str) -> bool {
        let removed = self.handlers.remove(batch_id).is_some();
        if removed {
            debug!(batch_id = %batch_id, "Removed import subscription");
        }
        removed
    }

    pub fn contains(&self, batch_id: &str) -> bool {
        self.handlers.contains_key(batch_id)
    }

    /// Batch ids to replay on reconnect
    pub fn batch_ids(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver a snapshot to the handler for its batch, if one is registered
    pub fn dispatch(&self, progress: ImportProgress) {
        if let Some(handler) = self.handlers.get(&progress.batch_id) {
            let batch_id = progress.batch_id.clone();
            if let Err(e) = handler(progress) {
                debug!(batch_id = %batch_id, error = %e, "Progress handler returned an error");
            }
        } else {
            debug!(batch_id = %progress.batch_id, "Progress for unsubscribed batch dropped");
        }
    }
}
