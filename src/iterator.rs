//! Per-iteration sequence of claimable objects.
//!
//! A [`FileIterator`] is built from a fresh store listing at the start of
//! every processing iteration and discarded at the end, so a crashed or
//! aborted iteration costs nothing: the next one re-lists and re-filters.
//! Workers pull claims from a shared iterator until it is exhausted or a
//! commit threshold fires.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CoordinationError;
use crate::metadata::bucket::{BucketAcquisition, BucketAdvance, BucketLease, bucket_for_key};
use crate::metadata::object_state::{ClaimOutcome, ObjectClaim};
use crate::metadata::{CommitEntry, CommitOutcome, QueueMetadataRef};
use crate::ring::RingView;
use crate::settings::QueueMode;
use crate::store::DiscoveredObject;

/// Candidate filter supplied by the host (e.g. a filename glob).
pub type ObjectPredicate<'a> = &'a (dyn Fn(&DiscoveredObject) -> bool + Send + Sync);

enum Policy {
    Unordered {
        candidates: VecDeque<DiscoveredObject>,
        ring: Option<RingView>,
    },
    Ordered {
        /// Listing grouped by bucket, each queue in ascending key order.
        pending: BTreeMap<u64, VecDeque<DiscoveredObject>>,
        owned: HashMap<u64, BucketLease>,
        /// Buckets another replica holds; skipped for this iteration.
        busy: HashSet<u64>,
    },
}

/// One iteration's view of the store listing, yielding claimed objects.
pub struct FileIterator {
    metadata: QueueMetadataRef,
    shutdown: CancellationToken,
    policy: Policy,
    finished: bool,
}

impl FileIterator {
    /// Build an iterator over a listing. `objects` must be sorted by key, as
    /// [`crate::store::ObjectStoreClient::list`] returns them.
    pub(crate) async fn new(
        metadata: QueueMetadataRef,
        mut objects: Vec<DiscoveredObject>,
        predicate: Option<ObjectPredicate<'_>>,
        shutdown: CancellationToken,
    ) -> Result<Self, CoordinationError> {
        if let Some(predicate) = predicate {
            objects.retain(|object| predicate(object));
        }
        let settings = metadata.settings();
        let policy = match settings.mode {
            QueueMode::Unordered => {
                let ring = if settings.enable_hash_ring_filtering {
                    let replicas = metadata.active_replicas().await?;
                    RingView::from_replicas(&replicas, metadata.replica_id())
                } else {
                    None
                };
                Policy::Unordered {
                    candidates: objects.into(),
                    ring,
                }
            }
            QueueMode::Ordered => {
                let mut pending: BTreeMap<u64, VecDeque<DiscoveredObject>> = BTreeMap::new();
                for object in objects {
                    let bucket = bucket_for_key(&object.key, settings.buckets);
                    pending.entry(bucket).or_default().push_back(object);
                }
                Policy::Ordered {
                    pending,
                    owned: HashMap::new(),
                    busy: HashSet::new(),
                }
            }
        };
        Ok(Self {
            metadata,
            shutdown,
            policy,
            finished: false,
        })
    }

    /// No more claims will come from this iterator.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Claim the next processable object, or `None` when the iteration is
    /// over (listing exhausted, every reachable bucket drained, or shutdown).
    pub async fn next(&mut self) -> Result<Option<ObjectClaim>, CoordinationError> {
        if self.shutdown.is_cancelled() {
            self.finished = true;
            return Ok(None);
        }
        match &mut self.policy {
            Policy::Unordered { .. } => self.next_unordered().await,
            Policy::Ordered { .. } => self.next_ordered().await,
        }
    }

    async fn next_unordered(&mut self) -> Result<Option<ObjectClaim>, CoordinationError> {
        loop {
            if self.shutdown.is_cancelled() {
                self.finished = true;
                return Ok(None);
            }
            let Policy::Unordered { candidates, ring } = &mut self.policy else {
                return Ok(None);
            };
            let Some(object) = candidates.pop_front() else {
                self.finished = true;
                return Ok(None);
            };
            if let Some(ring) = ring {
                if !ring.owns(&object.key) {
                    trace!(key = %object.key, "Key belongs to another ring slot");
                    continue;
                }
            }
            match self.metadata.claim(&object, None).await? {
                ClaimOutcome::Acquired(claim) => return Ok(Some(claim)),
                ClaimOutcome::AlreadyOwned { owner } => {
                    trace!(key = %object.key, owner = %owner, "Skipping owned object");
                }
                ClaimOutcome::AlreadyProcessed | ClaimOutcome::FailedTerminal => {}
            }
        }
    }

    async fn next_ordered(&mut self) -> Result<Option<ObjectClaim>, CoordinationError> {
        let bucket_ids: Vec<u64> = match &self.policy {
            Policy::Ordered { pending, .. } => pending.keys().copied().collect(),
            Policy::Unordered { .. } => return Ok(None),
        };

        for bucket_id in bucket_ids {
            if self.shutdown.is_cancelled() {
                self.finished = true;
                return Ok(None);
            }
            if self.bucket_is_busy(bucket_id) {
                continue;
            }
            if !self.ensure_bucket_owned(bucket_id).await? {
                continue;
            }
            let Policy::Ordered { pending, owned, .. } = &mut self.policy else {
                return Ok(None);
            };
            let Some(lease) = owned.get(&bucket_id) else {
                continue;
            };
            let Some(queue) = pending.get_mut(&bucket_id) else {
                continue;
            };
            while let Some(object) = queue.pop_front() {
                if !lease.admits(&object.key) {
                    trace!(
                        key = %object.key,
                        bucket = bucket_id,
                        "Key at or below high-water-mark"
                    );
                    continue;
                }
                match self.metadata.claim(&object, Some(bucket_id)).await? {
                    ClaimOutcome::Acquired(claim) => return Ok(Some(claim)),
                    ClaimOutcome::AlreadyOwned { owner } => {
                        // Stale Processing record from a previous bucket
                        // owner; it becomes reclaimable when its lease lapses.
                        debug!(key = %object.key, owner = %owner, "Skipping owned object");
                    }
                    ClaimOutcome::AlreadyProcessed | ClaimOutcome::FailedTerminal => {}
                }
            }
        }

        self.finished = true;
        Ok(None)
    }

    fn bucket_is_busy(&self, bucket_id: u64) -> bool {
        match &self.policy {
            Policy::Ordered { busy, .. } => busy.contains(&bucket_id),
            Policy::Unordered { .. } => false,
        }
    }

    /// Acquire the bucket lock lazily. Returns false when another replica
    /// holds it, marking the bucket busy for the rest of the iteration.
    async fn ensure_bucket_owned(&mut self, bucket_id: u64) -> Result<bool, CoordinationError> {
        let already_owned = match &self.policy {
            Policy::Ordered { owned, .. } => owned.contains_key(&bucket_id),
            Policy::Unordered { .. } => return Ok(false),
        };
        if already_owned {
            return Ok(true);
        }
        let acquisition = self.metadata.try_acquire_bucket(bucket_id).await?;
        let Policy::Ordered { owned, busy, .. } = &mut self.policy else {
            return Ok(false);
        };
        match acquisition {
            BucketAcquisition::Acquired(lease) => {
                owned.insert(bucket_id, lease);
                Ok(true)
            }
            BucketAcquisition::Busy { owner } => {
                trace!(bucket = bucket_id, owner = %owner, "Bucket busy");
                busy.insert(bucket_id);
                Ok(false)
            }
        }
    }

    /// High-water-mark advances implied by this batch: one per owned bucket,
    /// covering the contiguous Processed prefix of the bucket's keys. A
    /// non-Processed entry caps the advance below its key, so a retryable
    /// failure stays above the mark and is offered again next iteration.
    pub(crate) fn bucket_advances(&self, entries: &[CommitEntry]) -> Vec<BucketAdvance> {
        let Policy::Ordered { owned, .. } = &self.policy else {
            return Vec::new();
        };
        let mut per_bucket: BTreeMap<u64, Vec<(&str, bool)>> = BTreeMap::new();
        for entry in entries {
            let Some(bucket_id) = entry.claim.bucket else {
                continue;
            };
            let processed = matches!(entry.outcome, CommitOutcome::Processed);
            per_bucket
                .entry(bucket_id)
                .or_default()
                .push((entry.claim.key.as_str(), processed));
        }
        per_bucket
            .into_iter()
            .filter_map(|(bucket_id, mut outcomes)| {
                let lease = owned.get(&bucket_id)?;
                outcomes.sort_by(|a, b| a.0.cmp(b.0));
                let mut new_high_water_mark = None;
                for (key, processed) in outcomes {
                    if !processed {
                        break;
                    }
                    new_high_water_mark = Some(key.to_string());
                }
                let new_high_water_mark = new_high_water_mark?;
                if !lease.admits(&new_high_water_mark) {
                    return None;
                }
                Some(BucketAdvance {
                    bucket_id,
                    lock_version: lease.lock_version,
                    progress_exists: lease.high_water_mark.is_some(),
                    new_high_water_mark,
                })
            })
            .collect()
    }

    /// Adopt committed high-water-marks into the held leases. Call only
    /// after the commit transaction applied.
    pub(crate) fn confirm_advances(&mut self, advances: &[BucketAdvance]) {
        let Policy::Ordered { owned, .. } = &mut self.policy else {
            return;
        };
        for advance in advances {
            if let Some(lease) = owned.get_mut(&advance.bucket_id) {
                lease.high_water_mark = Some(advance.new_high_water_mark.clone());
            }
        }
    }

    /// Release ownership of buckets with no pending candidates left.
    pub(crate) async fn release_finished_buckets(&mut self) {
        let drained: Vec<u64> = match &self.policy {
            Policy::Ordered { pending, owned, .. } => owned
                .keys()
                .filter(|id| pending.get(id).map(|q| q.is_empty()).unwrap_or(true))
                .copied()
                .collect(),
            Policy::Unordered { .. } => return,
        };
        for bucket_id in drained {
            self.release_bucket(bucket_id).await;
        }
    }

    /// Release every held bucket; called when the iteration ends.
    pub(crate) async fn release_all_buckets(&mut self) {
        let held: Vec<u64> = match &self.policy {
            Policy::Ordered { owned, .. } => owned.keys().copied().collect(),
            Policy::Unordered { .. } => return,
        };
        for bucket_id in held {
            self.release_bucket(bucket_id).await;
        }
    }

    async fn release_bucket(&mut self, bucket_id: u64) {
        let lease = match &mut self.policy {
            Policy::Ordered { owned, .. } => owned.remove(&bucket_id),
            Policy::Unordered { .. } => None,
        };
        if let Some(lease) = lease {
            self.metadata.release_bucket(&lease).await;
        }
    }
}
