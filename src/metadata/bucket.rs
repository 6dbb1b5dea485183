//! Ordered-mode buckets: hashing, locks, and high-water-marks.
//!
//! Objects that must be mutually ordered share an ordering prefix (the
//! directory part of their key) and therefore a bucket. Each bucket is
//! processed serially: one replica holds the bucket lock at a time, and the
//! bucket's high-water-mark records the largest committed key, so nothing at
//! or below it is ever offered again.
//!
//! Bucket state lives in two nodes: `buckets/<id>/lock` (the lease) and
//! `buckets/<id>/processed` (the high-water-mark). The lock node's version is
//! stable for the whole tenure of an owner, which lets commit transactions
//! assert ownership with a single version check.

use std::hash::Hasher;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::keeper::NodeVersion;

/// Bucket for an object key: FxHash of the key's ordering prefix, modulo the
/// bucket count. Objects in one directory always land in one bucket.
pub fn bucket_for_key(key: &str, buckets: u64) -> u64 {
    let prefix = match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    };
    let mut hasher = FxHasher::default();
    hasher.write(prefix.as_bytes());
    hasher.finish() % buckets.max(1)
}

/// Payload of a `buckets/<id>/lock` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketLock {
    pub owner: String,
    /// Lease deadline (epoch ms). An expired lock is stealable via CAS.
    pub lease_expires_ms: i64,
}

impl BucketLock {
    pub fn expired(&self, now_ms: i64) -> bool {
        self.lease_expires_ms <= now_ms
    }
}

/// Payload of a `buckets/<id>/processed` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketProgress {
    /// Largest committed key in this bucket. Only ever advances.
    pub high_water_mark: String,
}

/// An owned bucket, held by the iterator between acquisition and release.
#[derive(Debug, Clone)]
pub struct BucketLease {
    pub bucket_id: u64,
    /// Version of the lock node as written at acquisition. Commit
    /// transactions check it to prove the lease was not stolen.
    pub lock_version: NodeVersion,
    /// High-water-mark observed at acquisition, advanced locally after each
    /// successful commit.
    pub high_water_mark: Option<String>,
}

impl BucketLease {
    /// Whether a key is past the high-water-mark and may be offered.
    pub fn admits(&self, key: &str) -> bool {
        match &self.high_water_mark {
            Some(hwm) => key > hwm.as_str(),
            None => true,
        }
    }
}

/// Result of a bucket acquisition attempt.
#[derive(Debug)]
pub enum BucketAcquisition {
    Acquired(BucketLease),
    /// Another replica holds a live lock.
    Busy { owner: String },
}

/// One bucket's high-water-mark advancement inside a commit batch.
#[derive(Debug, Clone)]
pub struct BucketAdvance {
    pub bucket_id: u64,
    /// Expected lock version; proves this replica still owns the bucket.
    pub lock_version: NodeVersion,
    /// Whether a `processed` node already exists (Set) or not (Create).
    pub progress_exists: bool,
    pub new_high_water_mark: String,
}
