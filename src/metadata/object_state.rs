//! Durable per-object processing records.
//!
//! Every discovered object gets exactly one record in the coordination
//! namespace, keyed by a hash of its key. The record is the source of truth
//! for the object's lifecycle: Processing (leased to one replica), Processed
//! (terminal), or Failed (retryable until the retry budget is spent, then
//! terminal).

use std::hash::Hasher;

use chrono::Utc;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::keeper::NodeVersion;

/// Lifecycle state of an object record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    /// Leased to one replica until `lease_expires_ms`.
    Processing,
    /// Successfully committed. Terminal.
    Processed,
    /// Failed; retryable while `retry_count` is under the budget.
    Failed,
}

/// The durable record stored at `objects/<key-hash>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub key: String,
    pub version_token: String,
    pub state: ObjectState,
    /// Replica currently holding the Processing lease.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Lease deadline (epoch ms). Meaningful only in Processing state.
    #[serde(default)]
    pub lease_expires_ms: Option<i64>,
    /// When the record became terminal (epoch ms). Drives eviction order.
    #[serde(default)]
    pub processed_at_ms: Option<i64>,
}

impl ObjectRecord {
    /// A fresh Processing record for a newly claimed object.
    pub fn processing(
        key: &str,
        version_token: &str,
        owner: &str,
        retry_count: u32,
        lease_timeout_ms: u64,
    ) -> Self {
        Self {
            key: key.to_string(),
            version_token: version_token.to_string(),
            state: ObjectState::Processing,
            owner: Some(owner.to_string()),
            retry_count,
            last_error: None,
            lease_expires_ms: Some(now_ms() + lease_timeout_ms as i64),
            processed_at_ms: None,
        }
    }

    /// Whether a Processing lease has lapsed and the object is reclaimable.
    pub fn lease_expired(&self, now_ms: i64) -> bool {
        match self.lease_expires_ms {
            Some(deadline) => deadline <= now_ms,
            None => true,
        }
    }

    /// Whether a Failed record has exhausted its retry budget.
    pub fn is_terminal_failure(&self, loading_retries: u32) -> bool {
        self.state == ObjectState::Failed && self.retry_count >= loading_retries
    }

    /// Whether the record is finished for good and eligible for eviction.
    pub fn is_terminal(&self, loading_retries: u32) -> bool {
        self.state == ObjectState::Processed || self.is_terminal_failure(loading_retries)
    }
}

/// Result of a claim attempt. Losing a race is an outcome here, not an error.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This replica now owns the object.
    Acquired(ObjectClaim),
    /// Another replica holds a live Processing lease.
    AlreadyOwned { owner: String },
    /// The object was committed earlier; never reprocess.
    AlreadyProcessed,
    /// The object failed its full retry budget; never reprocess.
    FailedTerminal,
}

/// A successfully acquired claim, carrying everything commit needs to write
/// the outcome with an exact precondition.
#[derive(Debug, Clone)]
pub struct ObjectClaim {
    pub key: String,
    pub size: u64,
    pub version_token: String,
    /// Retry count recorded in the claim (previous failures).
    pub retry_count: u32,
    /// Version of the object node as written by this claim; the commit
    /// transaction requires it unchanged.
    pub node_version: NodeVersion,
    /// Ordering bucket, when the table runs in ordered mode.
    pub bucket: Option<u64>,
}

/// Node name for an object key: FxHash64 of the key, hex-encoded. Keys can
/// contain `/` so they cannot be node names themselves.
pub fn object_node_name(key: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    format!("{:016x}", hasher.finish())
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
