//! Refcounted registry of metadata stores.
//!
//! Several queue instances in one process may watch the same coordination
//! root (e.g. two tables over one path, or a table re-attached during a
//! reload). They must share one [`QueueMetadata`] so settings and claims stay
//! coherent. The registry is an explicit value owned by the host, handed to
//! each queue instance; there is no process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CoordinationError, QueueError};
use crate::keeper::CoordinationClient;
use crate::metadata::{QueueMetadata, QueueMetadataRef};
use crate::settings::QueueSettings;

struct Entry {
    metadata: QueueMetadataRef,
    refs: usize,
}

/// Keyed, refcounted map from coordination root path to shared metadata.
#[derive(Default)]
pub struct MetadataRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the shared metadata for `root`, attaching it on first use.
    /// Every `attach` must be paired with a `detach` (or `remove`).
    pub async fn attach(
        &self,
        keeper: Arc<dyn CoordinationClient>,
        root: &str,
        replica_id: &str,
        settings: QueueSettings,
    ) -> Result<QueueMetadataRef, QueueError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(root) {
            entry.refs += 1;
            debug!(root, refs = entry.refs, "Reusing attached metadata");
            return Ok(Arc::clone(&entry.metadata));
        }

        let metadata = QueueMetadata::attach(keeper, root, replica_id, settings).await?;
        entries.insert(
            root.to_string(),
            Entry {
                metadata: Arc::clone(&metadata),
                refs: 1,
            },
        );
        Ok(metadata)
    }

    /// Drop one reference. The entry is forgotten when the last reference
    /// goes; keeper state stays intact for future attachers.
    pub async fn detach(&self, root: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(root) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(root);
                debug!(root, "Detached last metadata reference");
            }
        }
    }

    /// Drop one reference and, if it was the last in this process, remove
    /// the table's entire keeper subtree. Used by table drop.
    pub async fn remove(&self, root: &str) -> Result<(), CoordinationError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(root) else {
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }
        let metadata = match entries.remove(root) {
            Some(entry) => entry.metadata,
            None => return Ok(()),
        };
        drop(entries);
        metadata.drop_all().await
    }

    /// Current reference count for a root. Zero when unattached.
    pub async fn ref_count(&self, root: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(root)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }
}
