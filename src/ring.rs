//! Deterministic key→replica pre-filter.
//!
//! When `enable_hash_ring_filtering` is on, each replica only attempts to
//! claim the keys that hash onto its slot, cutting cross-replica claim
//! contention. The filter is advisory: claims stay atomic either way, and a
//! replica set change simply reshuffles future attempts.

use std::hash::Hasher;

use rustc_hash::FxHasher;

/// A replica's view of the ring at iteration start: how many replicas are
/// registered and which slot is ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingView {
    pub replica_count: usize,
    pub self_index: usize,
}

impl RingView {
    /// Build a view from the sorted active-replica list. Returns `None` when
    /// filtering would be pointless (we are absent, alone, or the list is
    /// empty), in which case every key is attempted.
    pub fn from_replicas(replicas: &[String], self_id: &str) -> Option<Self> {
        if replicas.len() < 2 {
            return None;
        }
        let self_index = replicas.iter().position(|r| r == self_id)?;
        Some(Self {
            replica_count: replicas.len(),
            self_index,
        })
    }

    /// Whether this replica's slot owns the key.
    pub fn owns(&self, key: &str) -> bool {
        let mut hasher = FxHasher::default();
        hasher.write(key.as_bytes());
        (hasher.finish() as usize) % self.replica_count == self.self_index
    }
}
