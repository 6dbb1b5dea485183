//! Shared processing metadata for one queue table.
//!
//! [`QueueMetadata`] owns the table's subtree in the coordination namespace:
//!
//! ```text
//! <root>/settings            settings snapshot + structural parameters
//! <root>/objects/<key-hash>  one ObjectRecord per discovered object
//! <root>/buckets/<id>/lock   bucket lease (ordered mode)
//! <root>/buckets/<id>/processed  bucket high-water-mark (ordered mode)
//! <root>/replicas/<id>       ephemeral liveness node per replica
//! ```
//!
//! Claims are atomic create-or-CAS operations on object records; commits are
//! single `multi` transactions with per-node version preconditions, so an
//! interleaved writer rejects the whole batch and nothing applies partially.

pub mod bucket;
pub mod object_state;
pub mod registry;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{
    CoordinationError, DecodePayloadSnafu, EncodePayloadSnafu, IncompatibleSnapshotSnafu,
    QueueError,
};
use crate::keeper::{CoordinationClient, NodeMode, NodeVersion, TxnOp};
use crate::metrics::events::{
    ClaimConflict, CleanupDuration, CommitFailed, CommitRequested, CommitSucceeded,
    ObjectClaimed, TrackedRecordsEvicted,
};
use crate::settings::{QueueMode, QueueSettings, QueueSettingsPatch};
use crate::store::DiscoveredObject;

use bucket::{BucketAcquisition, BucketAdvance, BucketLease, BucketLock, BucketProgress};
use object_state::{
    ClaimOutcome, ObjectClaim, ObjectRecord, ObjectState, now_ms, object_node_name,
};

// ============ Commit Batches ============

/// Outcome of processing one claimed object.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Processed,
    Failed { error: String },
}

/// One claimed object's result, queued for the next commit.
#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub claim: ObjectClaim,
    pub outcome: CommitOutcome,
    pub rows: u64,
    pub bytes: u64,
}

/// Everything one commit writes: per-object outcomes plus the bucket
/// high-water-marks they advance.
#[derive(Debug, Default)]
pub struct CommitBatch {
    pub entries: Vec<CommitEntry>,
    pub bucket_advances: Vec<BucketAdvance>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys committed as Processed, for post-processing deletion.
    pub fn processed_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, CommitOutcome::Processed))
            .map(|e| e.claim.key.clone())
            .collect()
    }
}

/// Tallies from a successfully applied commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitStats {
    pub processed: usize,
    pub failed: usize,
}

// ============ Metadata Store ============

/// A reference-counted metadata store handle.
pub type QueueMetadataRef = Arc<QueueMetadata>;

/// Coordination-backed processing state of one queue table, shared by every
/// in-process consumer of the same root path (see [`registry::MetadataRegistry`]).
pub struct QueueMetadata {
    keeper: Arc<dyn CoordinationClient>,
    root: String,
    target: String,
    replica_id: String,
    /// Effective settings plus the version of the keeper snapshot they came
    /// from. Copied out before use; alterations CAS against the version.
    settings: Mutex<(QueueSettings, NodeVersion)>,
}

impl std::fmt::Debug for QueueMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueMetadata<{}>", self.root)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CoordinationError> {
    serde_json::to_vec(value).context(EncodePayloadSnafu)
}

fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T, CoordinationError> {
    serde_json::from_slice(data).context(DecodePayloadSnafu { path })
}

impl QueueMetadata {
    /// Attach to (or initialize) the table state under `root`.
    ///
    /// The first attacher persists the settings snapshot; later attachers
    /// load it, verify structural compatibility with their local
    /// configuration, and adopt the stored values. The replica is registered
    /// for liveness before returning.
    pub async fn attach(
        keeper: Arc<dyn CoordinationClient>,
        root: &str,
        replica_id: &str,
        settings: QueueSettings,
    ) -> Result<QueueMetadataRef, QueueError> {
        settings.validate()?;
        let root = root.trim_matches('/').to_string();
        let target = root.rsplit('/').next().unwrap_or(&root).to_string();
        let settings_path = format!("{root}/settings");

        let (effective, version) = match keeper.get(&settings_path).await? {
            Some(node) => {
                let stored: QueueSettings = decode(&settings_path, &node.data)?;
                check_snapshot_compatible(&stored, &settings)?;
                (stored, node.version)
            }
            None => {
                match keeper
                    .create(&settings_path, encode(&settings)?, NodeMode::Persistent)
                    .await
                {
                    Ok(()) => {
                        bootstrap_buckets(keeper.as_ref(), &root, &settings).await?;
                        info!(target = %target, "Initialized table metadata");
                    }
                    // Lost the initialization race; adopt the winner's snapshot.
                    Err(err) if err.is_conflict() => {}
                    Err(err) => return Err(err.into()),
                }
                let node = keeper.get(&settings_path).await?.context(
                    crate::error::BackendSnafu {
                        message: format!("settings node vanished at {settings_path}"),
                    },
                )?;
                let stored: QueueSettings = decode(&settings_path, &node.data)?;
                check_snapshot_compatible(&stored, &settings)?;
                (stored, node.version)
            }
        };

        let metadata = Arc::new(Self {
            keeper,
            root,
            target,
            replica_id: replica_id.to_string(),
            settings: Mutex::new((effective, version)),
        });
        metadata.register_replica().await;
        Ok(metadata)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Copy of the effective settings.
    pub fn settings(&self) -> QueueSettings {
        self.lock_settings().0.clone()
    }

    fn lock_settings(&self) -> MutexGuard<'_, (QueueSettings, NodeVersion)> {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn object_path(&self, key: &str) -> String {
        format!("{}/objects/{}", self.root, object_node_name(key))
    }

    fn bucket_lock_path(&self, bucket_id: u64) -> String {
        format!("{}/buckets/{bucket_id}/lock", self.root)
    }

    fn bucket_progress_path(&self, bucket_id: u64) -> String {
        format!("{}/buckets/{bucket_id}/processed", self.root)
    }

    fn replica_path(&self) -> String {
        format!("{}/replicas/{}", self.root, self.replica_id)
    }

    // ============ Claims ============

    /// Try to take ownership of an object. At most one replica can hold a
    /// live Processing lease per object; everyone else gets a non-Acquired
    /// outcome and moves on.
    pub async fn claim(
        &self,
        object: &DiscoveredObject,
        bucket: Option<u64>,
    ) -> Result<ClaimOutcome, CoordinationError> {
        let settings = self.settings();
        let path = self.object_path(&object.key);

        // One retry after a benign conflict, then report the loss: the
        // iterator will simply move to the next candidate.
        for _ in 0..2 {
            match self.keeper.get(&path).await? {
                None => {
                    let record = ObjectRecord::processing(
                        &object.key,
                        &object.version_token,
                        &self.replica_id,
                        0,
                        settings.lease_timeout_ms,
                    );
                    match self
                        .keeper
                        .create(&path, encode(&record)?, NodeMode::Persistent)
                        .await
                    {
                        Ok(()) => {
                            return self.claimed(object, bucket, 0, &path).await;
                        }
                        Err(err) if err.is_conflict() => continue,
                        Err(err) => return Err(err),
                    }
                }
                Some(node) => {
                    let record: ObjectRecord = decode(&path, &node.data)?;
                    match record.state {
                        ObjectState::Processed => return Ok(ClaimOutcome::AlreadyProcessed),
                        ObjectState::Failed => {
                            if record.is_terminal_failure(settings.loading_retries) {
                                return Ok(ClaimOutcome::FailedTerminal);
                            }
                            let retry = ObjectRecord::processing(
                                &object.key,
                                &object.version_token,
                                &self.replica_id,
                                record.retry_count,
                                settings.lease_timeout_ms,
                            );
                            match self
                                .keeper
                                .set(&path, encode(&retry)?, Some(node.version))
                                .await
                            {
                                Ok(()) => {
                                    return self
                                        .claimed(object, bucket, record.retry_count, &path)
                                        .await;
                                }
                                Err(err) if err.is_conflict() => continue,
                                Err(err) => return Err(err),
                            }
                        }
                        ObjectState::Processing => {
                            if !record.lease_expired(now_ms()) {
                                let owner =
                                    record.owner.unwrap_or_else(|| "unknown".to_string());
                                return Ok(ClaimOutcome::AlreadyOwned { owner });
                            }
                            // Lapsed lease: steal, keeping the retry history.
                            let steal = ObjectRecord::processing(
                                &object.key,
                                &object.version_token,
                                &self.replica_id,
                                record.retry_count,
                                settings.lease_timeout_ms,
                            );
                            match self
                                .keeper
                                .set(&path, encode(&steal)?, Some(node.version))
                                .await
                            {
                                Ok(()) => {
                                    return self
                                        .claimed(object, bucket, record.retry_count, &path)
                                        .await;
                                }
                                Err(err) if err.is_conflict() => continue,
                                Err(err) => return Err(err),
                            }
                        }
                    }
                }
            }
        }

        emit!(ClaimConflict {
            target: self.target.clone(),
        });
        Ok(ClaimOutcome::AlreadyOwned {
            owner: "unknown".to_string(),
        })
    }

    /// Finish a won claim: read back the node version the commit transaction
    /// will require untouched.
    async fn claimed(
        &self,
        object: &DiscoveredObject,
        bucket: Option<u64>,
        retry_count: u32,
        path: &str,
    ) -> Result<ClaimOutcome, CoordinationError> {
        let node = match self.keeper.get(path).await? {
            Some(node) => node,
            // Deleted between our write and the read-back; treat as lost.
            None => {
                return Ok(ClaimOutcome::AlreadyOwned {
                    owner: "unknown".to_string(),
                });
            }
        };
        let record: ObjectRecord = decode(path, &node.data)?;
        if record.owner.as_deref() != Some(self.replica_id.as_str()) {
            let owner = record.owner.unwrap_or_else(|| "unknown".to_string());
            return Ok(ClaimOutcome::AlreadyOwned { owner });
        }
        emit!(ObjectClaimed {
            target: self.target.clone(),
        });
        debug!(target = %self.target, key = %object.key, "Claimed object");
        Ok(ClaimOutcome::Acquired(ObjectClaim {
            key: object.key.clone(),
            size: object.size,
            version_token: object.version_token.clone(),
            retry_count,
            node_version: node.version,
            bucket,
        }))
    }

    // ============ Buckets ============

    /// Try to take the lock on an ordering bucket. Expired locks are stolen
    /// via CAS; live locks report Busy.
    pub async fn try_acquire_bucket(
        &self,
        bucket_id: u64,
    ) -> Result<BucketAcquisition, CoordinationError> {
        let settings = self.settings();
        let lock_path = self.bucket_lock_path(bucket_id);
        let lock = BucketLock {
            owner: self.replica_id.clone(),
            lease_expires_ms: now_ms() + settings.lease_timeout_ms as i64,
        };

        match self.keeper.get(&lock_path).await? {
            None => match self
                .keeper
                .create(&lock_path, encode(&lock)?, NodeMode::Persistent)
                .await
            {
                Ok(()) => self.bucket_acquired(bucket_id, &lock_path).await,
                Err(err) if err.is_conflict() => Ok(BucketAcquisition::Busy {
                    owner: "unknown".to_string(),
                }),
                Err(err) => Err(err),
            },
            Some(node) => {
                let held: BucketLock = decode(&lock_path, &node.data)?;
                if !held.expired(now_ms()) && held.owner != self.replica_id {
                    return Ok(BucketAcquisition::Busy { owner: held.owner });
                }
                match self
                    .keeper
                    .set(&lock_path, encode(&lock)?, Some(node.version))
                    .await
                {
                    Ok(()) => self.bucket_acquired(bucket_id, &lock_path).await,
                    Err(err) if err.is_conflict() => Ok(BucketAcquisition::Busy {
                        owner: held.owner,
                    }),
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn bucket_acquired(
        &self,
        bucket_id: u64,
        lock_path: &str,
    ) -> Result<BucketAcquisition, CoordinationError> {
        let lock_version = match self.keeper.get(lock_path).await? {
            Some(node) => node.version,
            None => {
                return Ok(BucketAcquisition::Busy {
                    owner: "unknown".to_string(),
                });
            }
        };
        let progress_path = self.bucket_progress_path(bucket_id);
        let high_water_mark = match self.keeper.get(&progress_path).await? {
            Some(node) => {
                let progress: BucketProgress = decode(&progress_path, &node.data)?;
                Some(progress.high_water_mark)
            }
            None => None,
        };
        debug!(
            target = %self.target,
            bucket = bucket_id,
            hwm = high_water_mark.as_deref().unwrap_or("-"),
            "Acquired bucket"
        );
        Ok(BucketAcquisition::Acquired(BucketLease {
            bucket_id,
            lock_version,
            high_water_mark,
        }))
    }

    /// Give a bucket back. Best-effort: a failure only delays reacquisition
    /// until the lease deadline.
    pub async fn release_bucket(&self, lease: &BucketLease) {
        let lock_path = self.bucket_lock_path(lease.bucket_id);
        match self
            .keeper
            .delete(&lock_path, Some(lease.lock_version))
            .await
        {
            Ok(()) => {
                debug!(target = %self.target, bucket = lease.bucket_id, "Released bucket");
            }
            Err(err) if err.is_conflict() || matches!(err, CoordinationError::NoNode { .. }) => {
                debug!(
                    target = %self.target,
                    bucket = lease.bucket_id,
                    "Bucket lock already replaced"
                );
            }
            Err(err) => {
                warn!(
                    target = %self.target,
                    bucket = lease.bucket_id,
                    error = %err,
                    "Failed to release bucket"
                );
            }
        }
    }

    // ============ Commit ============

    /// Apply a commit batch as one transaction: every object outcome, plus a
    /// lock check and high-water-mark write per advanced bucket. Any
    /// precondition mismatch rejects the whole batch with no side effects.
    pub async fn apply_commit_batch(
        &self,
        batch: &CommitBatch,
    ) -> Result<CommitStats, CoordinationError> {
        if batch.is_empty() {
            return Ok(CommitStats::default());
        }
        let settings = self.settings();
        let now = now_ms();
        let mut stats = CommitStats::default();
        let mut ops = Vec::with_capacity(batch.entries.len() + batch.bucket_advances.len() * 2);

        for entry in &batch.entries {
            let claim = &entry.claim;
            let record = match &entry.outcome {
                CommitOutcome::Processed => {
                    stats.processed += 1;
                    ObjectRecord {
                        key: claim.key.clone(),
                        version_token: claim.version_token.clone(),
                        state: ObjectState::Processed,
                        owner: None,
                        retry_count: claim.retry_count,
                        last_error: None,
                        lease_expires_ms: None,
                        processed_at_ms: Some(now),
                    }
                }
                CommitOutcome::Failed { error } => {
                    stats.failed += 1;
                    let retry_count = claim.retry_count + 1;
                    let terminal = retry_count >= settings.loading_retries;
                    ObjectRecord {
                        key: claim.key.clone(),
                        version_token: claim.version_token.clone(),
                        state: ObjectState::Failed,
                        owner: None,
                        retry_count,
                        last_error: Some(error.clone()),
                        lease_expires_ms: None,
                        processed_at_ms: terminal.then_some(now),
                    }
                }
            };
            ops.push(TxnOp::Set {
                path: self.object_path(&claim.key),
                data: encode(&record)?,
                expected_version: Some(claim.node_version),
            });
        }

        for advance in &batch.bucket_advances {
            ops.push(TxnOp::Check {
                path: self.bucket_lock_path(advance.bucket_id),
                expected_version: advance.lock_version,
            });
            let progress = BucketProgress {
                high_water_mark: advance.new_high_water_mark.clone(),
            };
            let path = self.bucket_progress_path(advance.bucket_id);
            let data = encode(&progress)?;
            if advance.progress_exists {
                ops.push(TxnOp::Set {
                    path,
                    data,
                    // The lock check above is the single-writer guard.
                    expected_version: None,
                });
            } else {
                ops.push(TxnOp::Create { path, data });
            }
        }

        emit!(CommitRequested {
            objects: batch.entries.len(),
            target: self.target.clone(),
        });
        match self.keeper.multi(ops).await {
            Ok(()) => {
                emit!(CommitSucceeded {
                    processed: stats.processed,
                    failed: stats.failed,
                    target: self.target.clone(),
                });
                info!(
                    target = %self.target,
                    processed = stats.processed,
                    failed = stats.failed,
                    "Committed batch"
                );
                Ok(stats)
            }
            Err(err) => {
                emit!(CommitFailed {
                    target: self.target.clone(),
                });
                Err(err)
            }
        }
    }

    // ============ Replica Liveness ============

    /// Advisory registration; failures are logged, never fatal.
    pub async fn register_replica(&self) {
        let path = self.replica_path();
        match self
            .keeper
            .create(&path, Vec::new(), NodeMode::Ephemeral)
            .await
        {
            Ok(()) => debug!(target = %self.target, replica = %self.replica_id, "Registered replica"),
            Err(CoordinationError::NodeExists { .. }) => {}
            Err(err) => {
                warn!(target = %self.target, error = %err, "Failed to register replica");
            }
        }
    }

    /// Advisory unregistration, used at shutdown and during long idle spells.
    pub async fn unregister_replica(&self) {
        let path = self.replica_path();
        match self.keeper.delete(&path, None).await {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
            Err(err) => {
                warn!(target = %self.target, error = %err, "Failed to unregister replica");
            }
        }
    }

    /// Sorted ids of currently registered replicas.
    pub async fn active_replicas(&self) -> Result<Vec<String>, CoordinationError> {
        let mut replicas = self
            .keeper
            .list_children(&format!("{}/replicas", self.root))
            .await?;
        replicas.sort();
        Ok(replicas)
    }

    // ============ Cleanup ============

    /// Evict terminal records past the TTL, then trim to the tracked-record
    /// limit oldest-first. Processing records are never touched. Returns how
    /// many records were evicted.
    pub async fn cleanup_pass(&self) -> Result<usize, CoordinationError> {
        let settings = self.settings();
        if !settings.tracking_enabled() {
            return Ok(0);
        }
        let start = Instant::now();
        let objects_root = format!("{}/objects", self.root);
        let children = self.keeper.list_children(&objects_root).await?;

        // (processed_at, path, version) of every terminal record.
        let mut terminal = Vec::new();
        for child in children {
            let path = format!("{objects_root}/{child}");
            let Some(node) = self.keeper.get(&path).await? else {
                continue;
            };
            let record: ObjectRecord = decode(&path, &node.data)?;
            if record.is_terminal(settings.loading_retries) {
                terminal.push((record.processed_at_ms.unwrap_or(0), path, node.version));
            }
        }
        terminal.sort();

        let now = now_ms();
        let ttl_ms = settings.tracked_file_ttl_secs as i64 * 1_000;
        let mut evict = Vec::new();
        let mut kept = Vec::new();
        for entry in terminal {
            if ttl_ms > 0 && entry.0 + ttl_ms <= now {
                evict.push(entry);
            } else {
                kept.push(entry);
            }
        }
        if settings.tracked_files_limit > 0 && kept.len() > settings.tracked_files_limit as usize {
            let excess = kept.len() - settings.tracked_files_limit as usize;
            evict.extend(kept.drain(..excess));
        }

        let mut evicted = 0;
        for (_, path, version) in evict {
            match self.keeper.delete(&path, Some(version)).await {
                Ok(()) => evicted += 1,
                // Another replica's cleanup got there first, or the record
                // was just reclaimed; both fine.
                Err(err)
                    if err.is_conflict() || matches!(err, CoordinationError::NoNode { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        if evicted > 0 {
            emit!(TrackedRecordsEvicted {
                count: evicted,
                target: self.target.clone(),
            });
            info!(target = %self.target, evicted, "Evicted tracked records");
        }
        emit!(CleanupDuration {
            duration: start.elapsed(),
            target: self.target.clone(),
        });
        Ok(evicted)
    }

    /// Run cleanup passes until shutdown, sleeping a uniformly random
    /// interval in the configured window between passes.
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let metadata = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (min, max) = {
                    let settings = metadata.settings();
                    (settings.cleanup_interval_min_ms, settings.cleanup_interval_max_ms)
                };
                let interval = if max > min {
                    rand::rng().random_range(min..=max)
                } else {
                    min
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(interval)) => {}
                }
                if let Err(err) = metadata.cleanup_pass().await {
                    warn!(target = %metadata.target, error = %err, "Cleanup pass failed");
                }
            }
            debug!(target = %metadata.target, "Cleanup task stopped");
        })
    }

    // ============ Settings ============

    /// Alter settings through the per-mode whitelist, CAS the keeper
    /// snapshot, and adopt the new values locally. A rejected alter has no
    /// effect anywhere.
    pub async fn alter_settings(
        &self,
        patch: &QueueSettingsPatch,
        attached_dependents: usize,
    ) -> Result<QueueSettings, QueueError> {
        let (current, version) = self.lock_settings().clone();
        patch.check_alterable(current.mode, attached_dependents)?;
        let next = patch.apply(&current);
        next.validate()?;

        let settings_path = format!("{}/settings", self.root);
        self.keeper
            .set(&settings_path, encode(&next)?, Some(version))
            .await?;
        let new_version = match self.keeper.get(&settings_path).await? {
            Some(node) => node.version,
            None => version,
        };
        *self.lock_settings() = (next.clone(), new_version);
        info!(
            target = %self.target,
            changed = ?patch.changed_names(),
            "Altered settings"
        );
        Ok(next)
    }

    /// Remove every trace of the table from the coordination namespace.
    pub async fn drop_all(&self) -> Result<(), CoordinationError> {
        info!(target = %self.target, "Dropping table metadata");
        self.keeper.delete_subtree(&self.root).await
    }
}

/// Structural parameters are fixed at creation; a mismatch means the caller
/// is attaching with a configuration that cannot share this table's state.
fn check_snapshot_compatible(
    stored: &QueueSettings,
    local: &QueueSettings,
) -> Result<(), QueueError> {
    ensure!(
        stored.mode == local.mode,
        IncompatibleSnapshotSnafu {
            detail: format!("mode is {}, attach requested {}", stored.mode, local.mode),
        }
    );
    if stored.mode == QueueMode::Ordered {
        ensure!(
            stored.buckets == local.buckets,
            IncompatibleSnapshotSnafu {
                detail: format!(
                    "buckets is {}, attach requested {}",
                    stored.buckets, local.buckets
                ),
            }
        );
    }
    Ok(())
}

/// First-attach bootstrap: a configured `last_processed_key` becomes every
/// bucket's initial high-water-mark so historical objects are skipped.
async fn bootstrap_buckets(
    keeper: &dyn CoordinationClient,
    root: &str,
    settings: &QueueSettings,
) -> Result<(), CoordinationError> {
    if settings.mode != QueueMode::Ordered {
        return Ok(());
    }
    let Some(last_processed) = &settings.last_processed_key else {
        return Ok(());
    };
    let progress = BucketProgress {
        high_water_mark: last_processed.clone(),
    };
    for bucket_id in 0..settings.buckets {
        let path = format!("{root}/buckets/{bucket_id}/processed");
        match keeper
            .create(&path, encode(&progress)?, NodeMode::Persistent)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::memory::InMemoryKeeper;
    use crate::settings::QueueMode;

    fn object(key: &str) -> DiscoveredObject {
        DiscoveredObject {
            key: key.to_string(),
            size: 42,
            version_token: "etag-1".to_string(),
        }
    }

    async fn attach(
        keeper: &InMemoryKeeper,
        replica: &str,
        settings: QueueSettings,
    ) -> QueueMetadataRef {
        QueueMetadata::attach(
            Arc::new(keeper.session()),
            "tables/events",
            replica,
            settings,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_committed() {
        let keeper = InMemoryKeeper::new();
        let settings = QueueSettings::new(QueueMode::Unordered);
        let a = attach(&keeper, "replica-a", settings.clone()).await;
        let b = attach(&keeper, "replica-b", settings).await;

        let claim = match a.claim(&object("data/x.ndjson"), None).await.unwrap() {
            ClaimOutcome::Acquired(claim) => claim,
            other => panic!("expected acquisition, got {other:?}"),
        };
        assert!(matches!(
            b.claim(&object("data/x.ndjson"), None).await.unwrap(),
            ClaimOutcome::AlreadyOwned { ref owner } if owner == "replica-a"
        ));

        let batch = CommitBatch {
            entries: vec![CommitEntry {
                claim,
                outcome: CommitOutcome::Processed,
                rows: 10,
                bytes: 42,
            }],
            bucket_advances: Vec::new(),
        };
        let stats = a.apply_commit_batch(&batch).await.unwrap();
        assert_eq!(stats.processed, 1);

        assert!(matches!(
            b.claim(&object("data/x.ndjson"), None).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Unordered);
        settings.lease_timeout_ms = 0; // expire immediately
        let a = attach(&keeper, "replica-a", settings.clone()).await;
        let b = attach(&keeper, "replica-b", settings).await;

        assert!(matches!(
            a.claim(&object("data/x.ndjson"), None).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));
        // Replica a never commits; its zero-length lease has lapsed.
        assert!(matches!(
            b.claim(&object("data/x.ndjson"), None).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn failure_commits_count_retries_until_terminal() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Unordered);
        settings.loading_retries = 2;
        settings.lease_timeout_ms = 0;
        let metadata = attach(&keeper, "replica-a", settings).await;

        for attempt in 0..2u32 {
            let claim = match metadata.claim(&object("bad.ndjson"), None).await.unwrap() {
                ClaimOutcome::Acquired(claim) => claim,
                other => panic!("attempt {attempt}: expected acquisition, got {other:?}"),
            };
            assert_eq!(claim.retry_count, attempt);
            let batch = CommitBatch {
                entries: vec![CommitEntry {
                    claim,
                    outcome: CommitOutcome::Failed {
                        error: "parse error".to_string(),
                    },
                    rows: 0,
                    bytes: 0,
                }],
                bucket_advances: Vec::new(),
            };
            metadata.apply_commit_batch(&batch).await.unwrap();
        }

        assert!(matches!(
            metadata.claim(&object("bad.ndjson"), None).await.unwrap(),
            ClaimOutcome::FailedTerminal
        ));
    }

    #[tokio::test]
    async fn stale_claim_version_rejects_whole_batch() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Unordered);
        settings.lease_timeout_ms = 0;
        let a = attach(&keeper, "replica-a", settings.clone()).await;
        let b = attach(&keeper, "replica-b", settings).await;

        let stale = match a.claim(&object("x.ndjson"), None).await.unwrap() {
            ClaimOutcome::Acquired(claim) => claim,
            other => panic!("expected acquisition, got {other:?}"),
        };
        let fresh_other = match a.claim(&object("y.ndjson"), None).await.unwrap() {
            ClaimOutcome::Acquired(claim) => claim,
            other => panic!("expected acquisition, got {other:?}"),
        };
        // b steals x after a's lease lapses, bumping the node version.
        assert!(matches!(
            b.claim(&object("x.ndjson"), None).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));

        let batch = CommitBatch {
            entries: vec![
                CommitEntry {
                    claim: stale,
                    outcome: CommitOutcome::Processed,
                    rows: 1,
                    bytes: 1,
                },
                CommitEntry {
                    claim: fresh_other.clone(),
                    outcome: CommitOutcome::Processed,
                    rows: 1,
                    bytes: 1,
                },
            ],
            bucket_advances: Vec::new(),
        };
        let err = a.apply_commit_batch(&batch).await.unwrap_err();
        assert!(err.is_conflict());

        // Nothing applied: y is still owned by a, not processed.
        assert!(matches!(
            b.claim(&object("y.ndjson"), None).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn bucket_lock_is_exclusive_and_releasable() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Ordered);
        settings.buckets = 2;
        let a = attach(&keeper, "replica-a", settings.clone()).await;
        let b = attach(&keeper, "replica-b", settings).await;

        let lease = match a.try_acquire_bucket(0).await.unwrap() {
            BucketAcquisition::Acquired(lease) => lease,
            BucketAcquisition::Busy { owner } => panic!("bucket busy: {owner}"),
        };
        assert!(matches!(
            b.try_acquire_bucket(0).await.unwrap(),
            BucketAcquisition::Busy { ref owner } if owner == "replica-a"
        ));

        a.release_bucket(&lease).await;
        assert!(matches!(
            b.try_acquire_bucket(0).await.unwrap(),
            BucketAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn stolen_bucket_rejects_old_owners_commit() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Ordered);
        settings.buckets = 1;
        settings.lease_timeout_ms = 0; // locks expire immediately
        let a = attach(&keeper, "replica-a", settings.clone()).await;
        let b = attach(&keeper, "replica-b", settings).await;

        let lease = match a.try_acquire_bucket(0).await.unwrap() {
            BucketAcquisition::Acquired(lease) => lease,
            BucketAcquisition::Busy { owner } => panic!("bucket busy: {owner}"),
        };
        // The zero-length lease lapses and b steals the bucket.
        assert!(matches!(
            b.try_acquire_bucket(0).await.unwrap(),
            BucketAcquisition::Acquired(_)
        ));

        let claim = match a.claim(&object("data/001.ndjson"), Some(0)).await.unwrap() {
            ClaimOutcome::Acquired(claim) => claim,
            other => panic!("expected acquisition, got {other:?}"),
        };
        let batch = CommitBatch {
            entries: vec![CommitEntry {
                claim,
                outcome: CommitOutcome::Processed,
                rows: 1,
                bytes: 1,
            }],
            bucket_advances: vec![BucketAdvance {
                bucket_id: 0,
                lock_version: lease.lock_version,
                progress_exists: false,
                new_high_water_mark: "data/001.ndjson".to_string(),
            }],
        };
        let err = a.apply_commit_batch(&batch).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn cleanup_evicts_by_ttl_then_limit_oldest_first() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Unordered);
        settings.tracked_files_limit = 2;
        settings.tracked_file_ttl_secs = 0; // limit only
        let metadata = attach(&keeper, "replica-a", settings).await;

        for key in ["a.ndjson", "b.ndjson", "c.ndjson"] {
            let claim = match metadata.claim(&object(key), None).await.unwrap() {
                ClaimOutcome::Acquired(claim) => claim,
                other => panic!("expected acquisition, got {other:?}"),
            };
            let batch = CommitBatch {
                entries: vec![CommitEntry {
                    claim,
                    outcome: CommitOutcome::Processed,
                    rows: 1,
                    bytes: 1,
                }],
                bucket_advances: Vec::new(),
            };
            metadata.apply_commit_batch(&batch).await.unwrap();
            // Distinct processed_at timestamps for a deterministic order.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let evicted = metadata.cleanup_pass().await.unwrap();
        assert_eq!(evicted, 1);
        // The oldest record went; the newest two survive as Processed.
        assert!(matches!(
            metadata.claim(&object("a.ndjson"), None).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));
        assert!(matches!(
            metadata.claim(&object("c.ndjson"), None).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        ));
    }

    #[tokio::test]
    async fn cleanup_evicts_records_past_ttl() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Unordered);
        settings.tracked_files_limit = 0;
        settings.tracked_file_ttl_secs = 60;
        let metadata = attach(&keeper, "replica-a", settings).await;

        for key in ["old.ndjson", "fresh.ndjson"] {
            let claim = match metadata.claim(&object(key), None).await.unwrap() {
                ClaimOutcome::Acquired(claim) => claim,
                other => panic!("expected acquisition, got {other:?}"),
            };
            let batch = CommitBatch {
                entries: vec![CommitEntry {
                    claim,
                    outcome: CommitOutcome::Processed,
                    rows: 1,
                    bytes: 1,
                }],
                bucket_advances: Vec::new(),
            };
            metadata.apply_commit_batch(&batch).await.unwrap();
        }

        // Backdate one record two minutes, past the 60s TTL.
        let session = keeper.session();
        let path = format!(
            "tables/events/objects/{}",
            object_node_name("old.ndjson")
        );
        let node = session.get(&path).await.unwrap().unwrap();
        let mut record: ObjectRecord = serde_json::from_slice(&node.data).unwrap();
        record.processed_at_ms = Some(now_ms() - 120_000);
        session
            .set(&path, serde_json::to_vec(&record).unwrap(), None)
            .await
            .unwrap();

        let evicted = metadata.cleanup_pass().await.unwrap();
        assert_eq!(evicted, 1);
        // The expired record is gone (its object is claimable again); the
        // fresh one survives as Processed.
        assert!(matches!(
            metadata.claim(&object("old.ndjson"), None).await.unwrap(),
            ClaimOutcome::Acquired(_)
        ));
        assert!(matches!(
            metadata.claim(&object("fresh.ndjson"), None).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        ));
    }

    #[tokio::test]
    async fn second_attach_adopts_stored_snapshot() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Unordered);
        settings.loading_retries = 7;
        let _first = attach(&keeper, "replica-a", settings).await;

        // Attacher with different non-structural values adopts the stored ones.
        let second = attach(&keeper, "replica-b", QueueSettings::new(QueueMode::Unordered)).await;
        assert_eq!(second.settings().loading_retries, 7);

        // A structural mismatch is rejected outright.
        let err = QueueMetadata::attach(
            Arc::new(keeper.session()),
            "tables/events",
            "replica-c",
            QueueSettings::new(QueueMode::Ordered),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Settings {
                source: crate::error::SettingsError::IncompatibleSnapshot { .. }
            }
        ));
    }

    #[tokio::test]
    async fn alter_updates_keeper_and_local_copy() {
        let keeper = InMemoryKeeper::new();
        let metadata = attach(&keeper, "replica-a", QueueSettings::new(QueueMode::Unordered)).await;

        let patch = QueueSettingsPatch {
            loading_retries: Some(3),
            ..Default::default()
        };
        let next = metadata.alter_settings(&patch, 1).await.unwrap();
        assert_eq!(next.loading_retries, 3);
        assert_eq!(metadata.settings().loading_retries, 3);

        // Re-attach sees the altered snapshot.
        let reattached = attach(&keeper, "replica-b", QueueSettings::new(QueueMode::Unordered)).await;
        assert_eq!(reattached.settings().loading_retries, 3);
    }

    #[tokio::test]
    async fn last_processed_key_bootstraps_watermarks() {
        let keeper = InMemoryKeeper::new();
        let mut settings = QueueSettings::new(QueueMode::Ordered);
        settings.buckets = 2;
        settings.last_processed_key = Some("data/099.ndjson".to_string());
        let metadata = attach(&keeper, "replica-a", settings).await;

        for bucket_id in 0..2 {
            let lease = match metadata.try_acquire_bucket(bucket_id).await.unwrap() {
                BucketAcquisition::Acquired(lease) => lease,
                BucketAcquisition::Busy { owner } => panic!("bucket busy: {owner}"),
            };
            assert_eq!(lease.high_water_mark.as_deref(), Some("data/099.ndjson"));
            assert!(!lease.admits("data/050.ndjson"));
            assert!(lease.admits("data/100.ndjson"));
        }
    }

    #[tokio::test]
    async fn replica_registration_feeds_active_list() {
        let keeper = InMemoryKeeper::new();
        let settings = QueueSettings::new(QueueMode::Unordered);
        let a = attach(&keeper, "replica-a", settings.clone()).await;
        let _b = attach(&keeper, "replica-b", settings).await;

        assert_eq!(a.active_replicas().await.unwrap(), vec![
            "replica-a",
            "replica-b"
        ]);
        a.unregister_replica().await;
        assert_eq!(a.active_replicas().await.unwrap(), vec!["replica-b"]);
    }
}
