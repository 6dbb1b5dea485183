//! Table settings: the typed knobs of a queue table, their validation rules,
//! and the per-mode whitelists governing which of them can change after the
//! table exists.
//!
//! A settings snapshot is persisted in the coordination service when a table
//! is first attached, so every replica of the same table runs with the same
//! values. Alterations go through [`QueueSettingsPatch`] and are rejected
//! synchronously when the target setting is not alterable in the table's mode.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

// ============ Mode Enums ============

/// Processing-order guarantee of a queue table. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Any replica may take any object; no ordering between objects.
    Unordered,
    /// Objects sharing an ordering prefix are processed serially, in
    /// ascending key order, tracked by per-bucket high-water-marks.
    Ordered,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Unordered => write!(f, "unordered"),
            QueueMode::Ordered => write!(f, "ordered"),
        }
    }
}

/// What happens to a source object once it is committed as processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterProcessing {
    /// Leave the object in place.
    Keep,
    /// Delete the object from the store (unordered mode only).
    Delete,
}

// ============ Settings ============

fn default_processing_threads() -> usize {
    1
}

fn default_loading_retries() -> u32 {
    10
}

fn default_after_processing() -> AfterProcessing {
    AfterProcessing::Keep
}

fn default_polling_min_timeout_ms() -> u64 {
    1_000
}

fn default_polling_max_timeout_ms() -> u64 {
    10_000
}

fn default_polling_backoff_ms() -> u64 {
    1_000
}

fn default_cleanup_interval_min_ms() -> u64 {
    10_000
}

fn default_cleanup_interval_max_ms() -> u64 {
    30_000
}

fn default_tracked_files_limit() -> u64 {
    1_000
}

fn default_buckets() -> u64 {
    1
}

fn default_list_objects_batch_size() -> usize {
    1_000
}

fn default_max_processed_files_before_commit() -> u64 {
    100
}

fn default_lease_timeout_ms() -> u64 {
    60_000
}

/// All tunables of a queue table.
///
/// The struct is cheap to clone; running code takes a clone under the
/// settings lock and works from the copy so alterations never race an
/// in-flight iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Processing-order mode. Fixed at creation, never alterable.
    pub mode: QueueMode,

    /// Worker sources spawned per iteration.
    #[serde(default = "default_processing_threads")]
    pub processing_threads_num: usize,

    /// Failed objects are retried up to this many times before the failure
    /// becomes terminal. Zero means no retries.
    #[serde(default = "default_loading_retries")]
    pub loading_retries: u32,

    /// Disposition of source objects after successful processing.
    #[serde(default = "default_after_processing")]
    pub after_processing: AfterProcessing,

    /// Floor of the polling interval; the interval resets here whenever an
    /// iteration processes rows.
    #[serde(default = "default_polling_min_timeout_ms")]
    pub polling_min_timeout_ms: u64,

    /// Ceiling of the polling interval.
    #[serde(default = "default_polling_max_timeout_ms")]
    pub polling_max_timeout_ms: u64,

    /// Additive step applied to the polling interval after an empty iteration.
    #[serde(default = "default_polling_backoff_ms")]
    pub polling_backoff_ms: u64,

    /// Lower bound of the randomized cleanup cadence (unordered tracking).
    #[serde(default = "default_cleanup_interval_min_ms")]
    pub cleanup_interval_min_ms: u64,

    /// Upper bound of the randomized cleanup cadence.
    #[serde(default = "default_cleanup_interval_max_ms")]
    pub cleanup_interval_max_ms: u64,

    /// Maximum number of terminal object records retained before the oldest
    /// are evicted. Zero disables the limit. Unordered mode only.
    #[serde(default = "default_tracked_files_limit")]
    pub tracked_files_limit: u64,

    /// Terminal object records older than this many seconds are evicted.
    /// Zero disables the TTL. Unordered mode only.
    #[serde(default)]
    pub tracked_file_ttl_secs: u64,

    /// Number of ordering buckets (ordered mode). Structural: alterable only
    /// while no dependents are attached.
    #[serde(default = "default_buckets")]
    pub buckets: u64,

    /// Claim pre-filtering through the deterministic hash ring.
    #[serde(default)]
    pub enable_hash_ring_filtering: bool,

    /// Store listings are consumed in batches of this many entries.
    #[serde(default = "default_list_objects_batch_size")]
    pub list_objects_batch_size: usize,

    /// Commit threshold: objects processed. Zero disables.
    #[serde(default = "default_max_processed_files_before_commit")]
    pub max_processed_files_before_commit: u64,

    /// Commit threshold: rows buffered. Zero disables.
    #[serde(default)]
    pub max_processed_rows_before_commit: u64,

    /// Commit threshold: bytes read. Zero disables.
    #[serde(default)]
    pub max_processed_bytes_before_commit: u64,

    /// Commit threshold: seconds elapsed since the iteration started.
    /// Zero disables.
    #[serde(default)]
    pub max_processing_time_secs_before_commit: u64,

    /// How long a Processing claim or bucket lease stays valid before other
    /// replicas may steal it. A tunable, not a correctness knob: an expired
    /// lease simply makes the work reclaimable.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// Ordered mode bootstrap: keys less or equal to this are treated as
    /// already processed when the table is first attached.
    #[serde(default)]
    pub last_processed_key: Option<String>,
}

impl QueueSettings {
    /// Settings for a new table in the given mode, everything else default.
    /// Record tracking defaults on only in unordered mode, where it applies.
    pub fn new(mode: QueueMode) -> Self {
        let tracked_files_limit = match mode {
            QueueMode::Unordered => default_tracked_files_limit(),
            QueueMode::Ordered => 0,
        };
        Self {
            mode,
            processing_threads_num: default_processing_threads(),
            loading_retries: default_loading_retries(),
            after_processing: default_after_processing(),
            polling_min_timeout_ms: default_polling_min_timeout_ms(),
            polling_max_timeout_ms: default_polling_max_timeout_ms(),
            polling_backoff_ms: default_polling_backoff_ms(),
            cleanup_interval_min_ms: default_cleanup_interval_min_ms(),
            cleanup_interval_max_ms: default_cleanup_interval_max_ms(),
            tracked_files_limit,
            tracked_file_ttl_secs: 0,
            buckets: default_buckets(),
            enable_hash_ring_filtering: false,
            list_objects_batch_size: default_list_objects_batch_size(),
            max_processed_files_before_commit: default_max_processed_files_before_commit(),
            max_processed_rows_before_commit: 0,
            max_processed_bytes_before_commit: 0,
            max_processing_time_secs_before_commit: 0,
            lease_timeout_ms: default_lease_timeout_ms(),
            last_processed_key: None,
        }
    }

    /// Validate the settings as a whole.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.processing_threads_num == 0 {
            return Err(SettingsError::ZeroProcessingThreads);
        }
        if self.polling_min_timeout_ms > self.polling_max_timeout_ms {
            return Err(SettingsError::PollingIntervalOrder {
                min: self.polling_min_timeout_ms,
                max: self.polling_max_timeout_ms,
            });
        }
        if self.cleanup_interval_min_ms > self.cleanup_interval_max_ms {
            return Err(SettingsError::CleanupIntervalOrder {
                min: self.cleanup_interval_min_ms,
                max: self.cleanup_interval_max_ms,
            });
        }
        if self.mode == QueueMode::Ordered {
            if self.buckets == 0 {
                return Err(SettingsError::ZeroBuckets);
            }
            if self.after_processing == AfterProcessing::Delete {
                return Err(SettingsError::OrderedModeDelete);
            }
            if self.tracked_file_ttl_secs > 0 || self.tracked_files_limit > 0 {
                return Err(SettingsError::OrderedModeTracking);
            }
        }
        Ok(())
    }

    /// Whether terminal-record eviction runs for this table.
    pub fn tracking_enabled(&self) -> bool {
        self.mode == QueueMode::Unordered
            && (self.tracked_file_ttl_secs > 0 || self.tracked_files_limit > 0)
    }
}

// ============ Alteration ============

/// Settings alterable at any time in unordered mode.
const ALTERABLE_UNORDERED: &[&str] = &[
    "processing_threads_num",
    "loading_retries",
    "after_processing",
    "tracked_files_limit",
    "tracked_file_ttl_secs",
    "polling_min_timeout_ms",
    "polling_max_timeout_ms",
    "polling_backoff_ms",
    "cleanup_interval_min_ms",
    "cleanup_interval_max_ms",
    "enable_hash_ring_filtering",
    "list_objects_batch_size",
    "max_processed_files_before_commit",
    "max_processed_rows_before_commit",
    "max_processed_bytes_before_commit",
    "max_processing_time_secs_before_commit",
    "lease_timeout_ms",
];

/// Settings alterable in ordered mode. Thread count, tracking, and the hash
/// ring are excluded; `buckets` is allowed but structural.
const ALTERABLE_ORDERED: &[&str] = &[
    "loading_retries",
    "after_processing",
    "polling_min_timeout_ms",
    "polling_max_timeout_ms",
    "polling_backoff_ms",
    "list_objects_batch_size",
    "max_processed_files_before_commit",
    "max_processed_rows_before_commit",
    "max_processed_bytes_before_commit",
    "max_processing_time_secs_before_commit",
    "lease_timeout_ms",
    "buckets",
];

/// Settings whose change reshapes persisted coordination state and therefore
/// requires every dependent consumer to be detached first.
const STRUCTURAL: &[&str] = &["buckets"];

/// A sparse set of setting changes. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettingsPatch {
    pub processing_threads_num: Option<usize>,
    pub loading_retries: Option<u32>,
    pub after_processing: Option<AfterProcessing>,
    pub tracked_files_limit: Option<u64>,
    pub tracked_file_ttl_secs: Option<u64>,
    pub polling_min_timeout_ms: Option<u64>,
    pub polling_max_timeout_ms: Option<u64>,
    pub polling_backoff_ms: Option<u64>,
    pub cleanup_interval_min_ms: Option<u64>,
    pub cleanup_interval_max_ms: Option<u64>,
    pub enable_hash_ring_filtering: Option<bool>,
    pub list_objects_batch_size: Option<usize>,
    pub max_processed_files_before_commit: Option<u64>,
    pub max_processed_rows_before_commit: Option<u64>,
    pub max_processed_bytes_before_commit: Option<u64>,
    pub max_processing_time_secs_before_commit: Option<u64>,
    pub lease_timeout_ms: Option<u64>,
    pub buckets: Option<u64>,
}

impl QueueSettingsPatch {
    /// Names of the settings this patch touches.
    pub fn changed_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        macro_rules! touched {
            ($field:ident) => {
                if self.$field.is_some() {
                    names.push(stringify!($field));
                }
            };
        }
        touched!(processing_threads_num);
        touched!(loading_retries);
        touched!(after_processing);
        touched!(tracked_files_limit);
        touched!(tracked_file_ttl_secs);
        touched!(polling_min_timeout_ms);
        touched!(polling_max_timeout_ms);
        touched!(polling_backoff_ms);
        touched!(cleanup_interval_min_ms);
        touched!(cleanup_interval_max_ms);
        touched!(enable_hash_ring_filtering);
        touched!(list_objects_batch_size);
        touched!(max_processed_files_before_commit);
        touched!(max_processed_rows_before_commit);
        touched!(max_processed_bytes_before_commit);
        touched!(max_processing_time_secs_before_commit);
        touched!(lease_timeout_ms);
        touched!(buckets);
        names
    }

    /// Check the patch against the per-mode whitelist and the structural
    /// rules. Returns before any change is applied, so a rejected alter has
    /// no partial effect.
    pub fn check_alterable(
        &self,
        mode: QueueMode,
        attached_dependents: usize,
    ) -> Result<(), SettingsError> {
        let allowed = match mode {
            QueueMode::Unordered => ALTERABLE_UNORDERED,
            QueueMode::Ordered => ALTERABLE_ORDERED,
        };
        for name in self.changed_names() {
            if !allowed.contains(&name) {
                return Err(SettingsError::NotAlterable {
                    name: name.to_string(),
                    mode,
                });
            }
            if STRUCTURAL.contains(&name) && attached_dependents > 0 {
                return Err(SettingsError::StructuralWithDependents {
                    name: name.to_string(),
                    dependents: attached_dependents,
                });
            }
        }
        Ok(())
    }

    /// Produce the patched settings. Call [`QueueSettings::validate`] on the
    /// result before persisting it.
    pub fn apply(&self, base: &QueueSettings) -> QueueSettings {
        let mut next = base.clone();
        macro_rules! patch {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    next.$field = value.clone();
                }
            };
        }
        patch!(processing_threads_num);
        patch!(loading_retries);
        patch!(after_processing);
        patch!(tracked_files_limit);
        patch!(tracked_file_ttl_secs);
        patch!(polling_min_timeout_ms);
        patch!(polling_max_timeout_ms);
        patch!(polling_backoff_ms);
        patch!(cleanup_interval_min_ms);
        patch!(cleanup_interval_max_ms);
        patch!(enable_hash_ring_filtering);
        patch!(list_objects_batch_size);
        patch!(max_processed_files_before_commit);
        patch!(max_processed_rows_before_commit);
        patch!(max_processed_bytes_before_commit);
        patch!(max_processing_time_secs_before_commit);
        patch!(lease_timeout_ms);
        patch!(buckets);
        next
    }
}
