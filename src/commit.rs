//! Commit protocol for one processing iteration.
//!
//! Ordering is deliberate: rows reach the sink first, then (when configured)
//! source objects are deleted, and only then does the metadata transaction
//! record the outcomes. A crash between the steps leaves objects in
//! Processing with a finite lease, so they are retried rather than lost;
//! the one irreversible step, deletion, happens only for rows the sink has
//! already accepted.

use std::sync::Arc;

use tracing::{info, warn};

use crate::emit;
use crate::error::QueueError;
use crate::iterator::FileIterator;
use crate::metadata::{CommitBatch, QueueMetadataRef};
use crate::metrics::events::{ObjectsDeleted, RowsProcessed};
use crate::settings::AfterProcessing;
use crate::source::{ProcessingSource, RowSink};
use crate::store::ObjectStoreClientRef;

/// What one iteration accomplished, fed back into the polling backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationSummary {
    pub rows: u64,
    pub processed: usize,
    pub failed: usize,
}

/// Drives the commit phase at the end of each iteration.
pub(crate) struct CommitCoordinator {
    metadata: QueueMetadataRef,
    store: ObjectStoreClientRef,
    target: String,
}

impl CommitCoordinator {
    pub(crate) fn new(metadata: QueueMetadataRef, store: ObjectStoreClientRef) -> Self {
        let target = metadata.target().to_string();
        Self {
            metadata,
            store,
            target,
        }
    }

    /// Flush buffered rows to the sink and commit every pending outcome in
    /// one metadata transaction. On sink failure the objects are committed
    /// as Failed (consuming a retry) instead of Processed; on metadata
    /// failure nothing applies and the claims simply expire.
    pub(crate) async fn commit(
        &self,
        sources: &mut [ProcessingSource],
        iterator: &mut FileIterator,
        sink: &Arc<dyn RowSink>,
    ) -> Result<IterationSummary, QueueError> {
        let mut rows = Vec::new();
        for source in sources.iter_mut() {
            rows.append(&mut source.take_rows());
        }
        let row_count = rows.len() as u64;

        let mut fatal_sink_error = None;
        let insert_error = if rows.is_empty() {
            None
        } else {
            match sink.insert(rows).await {
                Ok(()) => None,
                Err(err) => {
                    warn!(target = %self.target, error = %err, "Sink insertion failed");
                    if err.is_fatal() {
                        fatal_sink_error = Some(err.to_string());
                    }
                    Some(err.to_string())
                }
            }
        };

        let mut entries = Vec::new();
        for source in sources.iter_mut() {
            entries.extend(source.drain_entries(insert_error.as_deref()));
        }
        if entries.is_empty() {
            return Ok(IterationSummary::default());
        }

        let bucket_advances = iterator.bucket_advances(&entries);
        let batch = CommitBatch {
            entries,
            bucket_advances,
        };

        // Deletion precedes the metadata write: once an object's record says
        // Processed, nothing would come back to delete it.
        let settings = self.metadata.settings();
        if settings.after_processing == AfterProcessing::Delete && insert_error.is_none() {
            let keys = batch.processed_keys();
            if !keys.is_empty() {
                let removed = self.store.delete_if_exists(&keys).await?;
                emit!(ObjectsDeleted {
                    count: removed,
                    target: self.target.clone(),
                });
            }
        }

        let stats = self.metadata.apply_commit_batch(&batch).await?;
        iterator.confirm_advances(&batch.bucket_advances);
        iterator.release_finished_buckets().await;

        let committed_rows = if insert_error.is_none() { row_count } else { 0 };
        if committed_rows > 0 {
            emit!(RowsProcessed {
                rows: committed_rows,
                target: self.target.clone(),
            });
        }
        info!(
            target = %self.target,
            rows = committed_rows,
            processed = stats.processed,
            failed = stats.failed,
            "Iteration commit finished"
        );

        if let Some(message) = fatal_sink_error {
            return Err(crate::error::SinkError::fatal(message).into());
        }
        Ok(IterationSummary {
            rows: committed_rows,
            processed: stats.processed,
            failed: stats.failed,
        })
    }
}
