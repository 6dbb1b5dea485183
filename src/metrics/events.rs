//! Internal events for skua metrics emission.
//!
//! Each event struct represents a measurable occurrence in the queue.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! metric through the `metrics` facade.
//!
//! ## Target Labels
//!
//! Queue-level metrics include a `target` label (the table name, derived from
//! the coordination root path) so multiple queue tables in one process stay
//! distinguishable. Raw store-request metrics are process-wide and unlabeled.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============ Store Requests ============

/// Object-store operation type for request metrics.
#[derive(Debug, Clone, Copy)]
pub enum StoreOperation {
    List,
    Get,
    Delete,
}

impl StoreOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::List => "list",
            StoreOperation::Get => "get",
            StoreOperation::Delete => "delete",
        }
    }
}

/// Outcome of an object-store request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for every object-store request.
pub struct StoreRequest {
    pub operation: StoreOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StoreRequest {
    fn emit(self) {
        counter!(
            "skua_store_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted with the latency of an object-store request.
pub struct StoreRequestDuration {
    pub operation: StoreOperation,
    pub duration: Duration,
}

impl InternalEvent for StoreRequestDuration {
    fn emit(self) {
        histogram!(
            "skua_store_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============ Claims ============

/// Event emitted when a replica wins a claim on an object.
pub struct ObjectClaimed {
    /// Target label for multi-table deployments.
    pub target: String,
}

impl InternalEvent for ObjectClaimed {
    fn emit(self) {
        trace!(target = %self.target, "Object claimed");
        counter!("skua_objects_claimed_total", "target" => self.target).increment(1);
    }
}

/// Event emitted when a claim attempt loses a cross-replica race.
pub struct ClaimConflict {
    pub target: String,
}

impl InternalEvent for ClaimConflict {
    fn emit(self) {
        trace!(target = %self.target, "Claim conflict");
        counter!("skua_claim_conflicts_total", "target" => self.target).increment(1);
    }
}

// ============ Processing ============

/// Event emitted when the scheduler starts a processing iteration.
pub struct IterationStarted {
    pub target: String,
}

impl InternalEvent for IterationStarted {
    fn emit(self) {
        trace!(target = %self.target, "Iteration started");
        counter!("skua_iterations_total", "target" => self.target).increment(1);
    }
}

/// Event emitted when rows are handed to the sink.
pub struct RowsProcessed {
    pub rows: u64,
    pub target: String,
}

impl InternalEvent for RowsProcessed {
    fn emit(self) {
        trace!(rows = self.rows, target = %self.target, "Rows processed");
        counter!("skua_rows_processed_total", "target" => self.target).increment(self.rows);
    }
}

/// Event emitted when an object fails to parse.
pub struct ObjectParseFailed {
    pub target: String,
}

impl InternalEvent for ObjectParseFailed {
    fn emit(self) {
        counter!("skua_parse_failures_total", "target" => self.target).increment(1);
    }
}

/// Event emitted with the scheduler's current polling interval.
pub struct PollingInterval {
    pub interval_ms: u64,
    pub target: String,
}

impl InternalEvent for PollingInterval {
    fn emit(self) {
        gauge!("skua_polling_interval_ms", "target" => self.target).set(self.interval_ms as f64);
    }
}

// ============ Commits ============

/// Event emitted when a commit batch is submitted to the metadata store.
pub struct CommitRequested {
    pub objects: usize,
    pub target: String,
}

impl InternalEvent for CommitRequested {
    fn emit(self) {
        trace!(objects = self.objects, target = %self.target, "Commit requested");
        counter!("skua_commit_requests_total", "target" => self.target).increment(1);
    }
}

/// Event emitted when a commit batch applies successfully.
pub struct CommitSucceeded {
    pub processed: usize,
    pub failed: usize,
    pub target: String,
}

impl InternalEvent for CommitSucceeded {
    fn emit(self) {
        trace!(
            processed = self.processed,
            failed = self.failed,
            target = %self.target,
            "Commit succeeded"
        );
        counter!("skua_commits_total", "status" => "success", "target" => self.target.clone())
            .increment(1);
        counter!("skua_objects_processed_total", "target" => self.target.clone())
            .increment(self.processed as u64);
        counter!("skua_objects_failed_total", "target" => self.target)
            .increment(self.failed as u64);
    }
}

/// Event emitted when a commit batch is rejected.
pub struct CommitFailed {
    pub target: String,
}

impl InternalEvent for CommitFailed {
    fn emit(self) {
        counter!("skua_commits_total", "status" => "failure", "target" => self.target)
            .increment(1);
    }
}

/// Event emitted when source objects are deleted after processing.
pub struct ObjectsDeleted {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for ObjectsDeleted {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Source objects deleted");
        counter!("skua_objects_deleted_total", "target" => self.target)
            .increment(self.count as u64);
    }
}

// ============ Cleanup ============

/// Event emitted when terminal object records are evicted.
pub struct TrackedRecordsEvicted {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for TrackedRecordsEvicted {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Tracked records evicted");
        counter!("skua_tracked_records_evicted_total", "target" => self.target)
            .increment(self.count as u64);
    }
}

/// Event emitted with the duration of a cleanup pass.
pub struct CleanupDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for CleanupDuration {
    fn emit(self) {
        histogram!("skua_cleanup_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}
