//! Error types for skua using snafu.
//!
//! Expected cross-replica races (claim conflicts, lost bucket acquisitions)
//! are modelled as outcome enums on the metadata operations, not as errors.
//! The enums here cover the genuinely exceptional conditions.

use snafu::prelude::*;

use crate::settings::QueueMode;

// ============ Coordination Errors ============

/// Errors surfaced by the coordination-service client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// Node creation hit an existing node.
    #[snafu(display("Node already exists: {path}"))]
    NodeExists { path: String },

    /// Node operation targeted a missing node.
    #[snafu(display("Node not found: {path}"))]
    NoNode { path: String },

    /// Conditional update found a different node version.
    #[snafu(display("Version mismatch at {path}"))]
    BadVersion { path: String },

    /// Failed to encode a node payload.
    #[snafu(display("Failed to encode node payload: {source}"))]
    EncodePayload { source: serde_json::Error },

    /// Failed to decode a node payload.
    #[snafu(display("Failed to decode node payload at {path}: {source}"))]
    DecodePayload {
        path: String,
        source: serde_json::Error,
    },

    /// Backend-specific failure (connection loss, session expiry, ...).
    #[snafu(display("Coordination backend error: {message}"))]
    Backend { message: String },
}

impl CoordinationError {
    /// Check whether this error is a benign concurrency conflict: another
    /// actor mutated the node first. Callers treat these as "lost the race",
    /// never as hard failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoordinationError::NodeExists { .. } | CoordinationError::BadVersion { .. }
        )
    }
}

// ============ Storage Errors ============

/// Errors that can occur during object-store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },
}

impl StoreError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Settings Errors ============

/// Errors raised by settings validation and alteration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SettingsError {
    /// `processing_threads_num` must be non-zero.
    #[snafu(display("Setting `processing_threads_num` cannot be set to zero"))]
    ZeroProcessingThreads,

    /// Ordered mode needs at least one bucket.
    #[snafu(display("Setting `buckets` cannot be zero in ordered mode"))]
    ZeroBuckets,

    /// Polling interval bounds are inverted.
    #[snafu(display(
        "Setting `polling_min_timeout_ms` ({min}) must be less or equal to `polling_max_timeout_ms` ({max})"
    ))]
    PollingIntervalOrder { min: u64, max: u64 },

    /// Cleanup interval bounds are inverted.
    #[snafu(display(
        "Setting `cleanup_interval_min_ms` ({min}) must be less or equal to `cleanup_interval_max_ms` ({max})"
    ))]
    CleanupIntervalOrder { min: u64, max: u64 },

    /// TTL/limit tracking is an unordered-mode feature.
    #[snafu(display(
        "Settings `tracked_files_limit` and `tracked_file_ttl_secs` are only supported in unordered mode"
    ))]
    OrderedModeTracking,

    /// Deletion after processing is an unordered-mode feature.
    #[snafu(display("Setting `after_processing = delete` is only supported in unordered mode"))]
    OrderedModeDelete,

    /// The setting is not in the alterable whitelist for this mode.
    #[snafu(display("Changing setting `{name}` is not allowed in {mode} mode"))]
    NotAlterable { name: String, mode: QueueMode },

    /// Structural settings require all dependents detached.
    #[snafu(display(
        "Changing setting `{name}` is allowed only with detached dependents (attached: {dependents})"
    ))]
    StructuralWithDependents { name: String, dependents: usize },

    /// The stored settings snapshot is structurally incompatible.
    #[snafu(display("Stored table settings are incompatible: {detail}"))]
    IncompatibleSnapshot { detail: String },
}

// ============ Parse / Sink Errors ============

/// Errors reported by the external record-parsing layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParseError {
    /// Input bytes do not form valid records.
    #[snafu(display("Malformed object {key}: {message}"))]
    Malformed { key: String, message: String },

    /// Record decoding failed.
    #[snafu(display("Failed to decode record in {key}: {source}"))]
    Decode {
        key: String,
        source: serde_json::Error,
    },
}

/// Errors reported by the downstream row sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Insertion of a row block failed.
    ///
    /// `fatal` marks failures of the sink itself (e.g. the destination is
    /// gone): the whole batch is failed and nothing advances past Processing.
    #[snafu(display("Sink insertion failed: {message}"))]
    Insert { message: String, fatal: bool },
}

impl SinkError {
    /// Failure of this insertion only; objects are retried individually.
    pub fn insert(message: impl Into<String>) -> Self {
        SinkError::Insert {
            message: message.into(),
            fatal: false,
        }
    }

    /// Failure of the sink itself; the whole batch is failed.
    pub fn fatal(message: impl Into<String>) -> Self {
        SinkError::Insert {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::Insert { fatal, .. } => *fatal,
        }
    }
}

// ============ Top-level Queue Errors ============

/// Top-level errors for queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Coordination-service error.
    #[snafu(display("Coordination error: {source}"))]
    Coordination { source: CoordinationError },

    /// Object-store error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StoreError },

    /// Settings validation or alteration error.
    #[snafu(display("Settings error: {source}"))]
    Settings { source: SettingsError },

    /// Downstream sink error.
    #[snafu(display("Sink error: {source}"))]
    Sink { source: SinkError },

    /// Worker task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

impl From<CoordinationError> for QueueError {
    fn from(source: CoordinationError) -> Self {
        QueueError::Coordination { source }
    }
}

impl From<StoreError> for QueueError {
    fn from(source: StoreError) -> Self {
        QueueError::Storage { source }
    }
}

impl From<SettingsError> for QueueError {
    fn from(source: SettingsError) -> Self {
        QueueError::Settings { source }
    }
}

impl From<SinkError> for QueueError {
    fn from(source: SinkError) -> Self {
        QueueError::Sink { source }
    }
}
