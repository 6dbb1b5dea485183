//! Worker-side processing: read a claimed object, parse it, buffer rows.
//!
//! The parsing format and the row consumer are host concerns behind the
//! [`RecordParser`] and [`RowSink`] traits; the queue only moves bytes and
//! tracks outcomes. All sources of an iteration share one
//! [`ProcessingProgress`], so the commit thresholds apply to the iteration as
//! a whole and the first source to cross one ends the filling phase for all.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{CoordinationError, DecodeSnafu, ParseError, SinkError};
use crate::iterator::FileIterator;
use crate::metadata::{CommitEntry, CommitOutcome};
use crate::metrics::events::ObjectParseFailed;
use crate::settings::QueueSettings;
use crate::store::ObjectStoreClientRef;

// ============ Host Seams ============

/// Decodes one object's bytes into rows.
#[async_trait]
pub trait RecordParser: Send + Sync {
    async fn parse(&self, key: &str, data: Bytes) -> Result<Vec<serde_json::Value>, ParseError>;
}

/// Receives the rows of a committed batch.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn insert(&self, rows: Vec<serde_json::Value>) -> Result<(), SinkError>;
}

/// Newline-delimited JSON, one row per non-empty line.
#[derive(Debug, Default)]
pub struct NdjsonParser;

#[async_trait]
impl RecordParser for NdjsonParser {
    async fn parse(&self, key: &str, data: Bytes) -> Result<Vec<serde_json::Value>, ParseError> {
        let text = String::from_utf8_lossy(&data);
        let mut rows = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: serde_json::Value = serde_json::from_str(line).context(DecodeSnafu { key })?;
            rows.push(row);
        }
        Ok(rows)
    }
}

// ============ Commit Thresholds ============

/// The iteration-wide limits that trigger a commit. Zero disables a limit.
#[derive(Debug, Clone, Copy)]
pub struct CommitThresholds {
    pub max_files: u64,
    pub max_rows: u64,
    pub max_bytes: u64,
    pub max_elapsed_secs: u64,
}

impl CommitThresholds {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_files: settings.max_processed_files_before_commit,
            max_rows: settings.max_processed_rows_before_commit,
            max_bytes: settings.max_processed_bytes_before_commit,
            max_elapsed_secs: settings.max_processing_time_secs_before_commit,
        }
    }
}

/// Shared per-iteration counters. Each limit compares with `>=`; the first
/// one crossed ends the iteration's filling phase.
#[derive(Debug)]
pub struct ProcessingProgress {
    files: AtomicU64,
    rows: AtomicU64,
    bytes: AtomicU64,
    started: Instant,
}

impl Default for ProcessingProgress {
    fn default() -> Self {
        Self {
            files: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl ProcessingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successfully parsed object.
    pub fn record(&self, rows: u64, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// The name of the first crossed threshold, if any.
    pub fn threshold_crossed(&self, thresholds: &CommitThresholds) -> Option<&'static str> {
        if thresholds.max_files > 0 && self.files.load(Ordering::Relaxed) >= thresholds.max_files {
            return Some("max_processed_files_before_commit");
        }
        if thresholds.max_rows > 0 && self.rows.load(Ordering::Relaxed) >= thresholds.max_rows {
            return Some("max_processed_rows_before_commit");
        }
        if thresholds.max_bytes > 0 && self.bytes.load(Ordering::Relaxed) >= thresholds.max_bytes {
            return Some("max_processed_bytes_before_commit");
        }
        if thresholds.max_elapsed_secs > 0
            && self.started.elapsed().as_secs() >= thresholds.max_elapsed_secs
        {
            return Some("max_processing_time_secs_before_commit");
        }
        None
    }
}

// ============ Processing Source ============

/// One worker of an iteration: pulls claims from the shared iterator, reads
/// and parses objects, and accumulates rows plus pending outcomes until the
/// commit phase collects them.
pub struct ProcessingSource {
    worker_id: usize,
    target: String,
    iterator: Arc<tokio::sync::Mutex<FileIterator>>,
    store: ObjectStoreClientRef,
    parser: Arc<dyn RecordParser>,
    progress: Arc<ProcessingProgress>,
    thresholds: CommitThresholds,
    shutdown: CancellationToken,
    pending: Vec<CommitEntry>,
    rows: Vec<serde_json::Value>,
}

impl ProcessingSource {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: usize,
        target: String,
        iterator: Arc<tokio::sync::Mutex<FileIterator>>,
        store: ObjectStoreClientRef,
        parser: Arc<dyn RecordParser>,
        progress: Arc<ProcessingProgress>,
        thresholds: CommitThresholds,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            target,
            iterator,
            store,
            parser,
            progress,
            thresholds,
            shutdown,
            pending: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Pull and process claims until the iterator runs dry, a threshold is
    /// crossed, or shutdown. Object-level failures become pending Failed
    /// outcomes; only coordination errors abort the worker.
    pub async fn run(&mut self) -> Result<(), CoordinationError> {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(threshold) = self.progress.threshold_crossed(&self.thresholds) {
                debug!(
                    target = %self.target,
                    worker = self.worker_id,
                    threshold,
                    "Commit threshold crossed"
                );
                break;
            }
            let claim = {
                let mut iterator = self.iterator.lock().await;
                iterator.next().await?
            };
            let Some(claim) = claim else {
                break;
            };

            let size = claim.size;
            match self.store.read(&claim.key).await {
                Ok(data) => match self.parser.parse(&claim.key, data).await {
                    Ok(parsed) => {
                        let row_count = parsed.len() as u64;
                        self.rows.extend(parsed);
                        self.pending.push(CommitEntry {
                            claim,
                            outcome: CommitOutcome::Processed,
                            rows: row_count,
                            bytes: size,
                        });
                        self.progress.record(row_count, size);
                    }
                    Err(err) => {
                        emit!(ObjectParseFailed {
                            target: self.target.clone(),
                        });
                        warn!(
                            target = %self.target,
                            worker = self.worker_id,
                            key = %claim.key,
                            error = %err,
                            "Failed to parse object"
                        );
                        self.pending.push(CommitEntry {
                            claim,
                            outcome: CommitOutcome::Failed {
                                error: err.to_string(),
                            },
                            rows: 0,
                            bytes: size,
                        });
                    }
                },
                Err(err) => {
                    warn!(
                        target = %self.target,
                        worker = self.worker_id,
                        key = %claim.key,
                        error = %err,
                        "Failed to read object"
                    );
                    self.pending.push(CommitEntry {
                        claim,
                        outcome: CommitOutcome::Failed {
                            error: err.to_string(),
                        },
                        rows: 0,
                        bytes: 0,
                    });
                }
            }
        }
        Ok(())
    }

    /// Buffered rows, handed to the sink at commit time.
    pub fn take_rows(&mut self) -> Vec<serde_json::Value> {
        std::mem::take(&mut self.rows)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain the pending outcomes. When the sink insertion failed, every
    /// Processed outcome is downgraded to Failed so nothing is lost silently.
    pub(crate) fn drain_entries(&mut self, insert_error: Option<&str>) -> Vec<CommitEntry> {
        let mut entries = std::mem::take(&mut self.pending);
        if let Some(error) = insert_error {
            for entry in &mut entries {
                if matches!(entry.outcome, CommitOutcome::Processed) {
                    entry.outcome = CommitOutcome::Failed {
                        error: error.to_string(),
                    };
                    entry.rows = 0;
                }
            }
        }
        entries
    }
}
