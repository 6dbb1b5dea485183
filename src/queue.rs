//! The queue table host object.
//!
//! An [`ObjectQueue`] ties one watched store prefix to one coordination root:
//! it owns the polling task, hands out iterators and sources, counts attached
//! dependents (the consumers that make polling worthwhile), and mediates
//! settings alterations. Metadata is shared through the host's
//! [`MetadataRegistry`], so several instances over one root stay coherent.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::commit::IterationSummary;
use crate::error::QueueError;
use crate::iterator::{FileIterator, ObjectPredicate};
use crate::keeper::CoordinationClient;
use crate::metadata::QueueMetadataRef;
use crate::metadata::registry::MetadataRegistry;
use crate::scheduler;
use crate::settings::{QueueSettings, QueueSettingsPatch};
use crate::source::{RecordParser, RowSink};
use crate::store::ObjectStoreClientRef;

/// Host-provided identity and configuration of one queue instance.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Coordination root path for the table, e.g. `tables/events`.
    pub root_path: String,
    /// Stable id of this replica within the table.
    pub replica_id: String,
    pub settings: QueueSettings,
}

pub(crate) struct QueueInner {
    pub(crate) target: String,
    pub(crate) metadata: QueueMetadataRef,
    pub(crate) store: ObjectStoreClientRef,
    pub(crate) parser: Arc<dyn RecordParser>,
    pub(crate) sink: Arc<dyn RowSink>,
    pub(crate) dependents: AtomicUsize,
    pub(crate) shutdown: CancellationToken,
}

/// One attached queue table instance.
pub struct ObjectQueue {
    inner: Arc<QueueInner>,
    registry: Arc<MetadataRegistry>,
    root: String,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ObjectQueue {
    /// Attach to the table, sharing metadata through `registry`. The queue
    /// starts inert; call [`start`](Self::start) to begin polling.
    pub async fn attach(
        registry: Arc<MetadataRegistry>,
        keeper: Arc<dyn CoordinationClient>,
        store: ObjectStoreClientRef,
        parser: Arc<dyn RecordParser>,
        sink: Arc<dyn RowSink>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let metadata = registry
            .attach(
                keeper,
                &config.root_path,
                &config.replica_id,
                config.settings,
            )
            .await?;
        let inner = Arc::new(QueueInner {
            target: metadata.target().to_string(),
            metadata,
            store,
            parser,
            sink,
            dependents: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });
        Ok(Self {
            inner,
            registry,
            root: config.root_path.trim_matches('/').to_string(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Spawn the polling loop (and, when record tracking applies, the
    /// cleanup loop). Idempotent per instance lifetime is not needed; call
    /// once after attach.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(scheduler::run_queue_loop(
            Arc::clone(&self.inner),
        )));
        if self.inner.metadata.settings().tracking_enabled() {
            tasks.push(
                self.inner
                    .metadata
                    .spawn_cleanup(self.inner.shutdown.child_token()),
            );
        }
        info!(target = %self.inner.target, "Queue started");
    }

    /// Run one processing iteration immediately, outside the polling cadence.
    pub async fn run_iteration(&self) -> Result<IterationSummary, QueueError> {
        scheduler::run_iteration(&self.inner).await
    }

    /// Build an iterator over the current store listing, optionally filtered.
    /// Mostly useful to hosts driving processing manually.
    pub async fn create_iterator(
        &self,
        predicate: Option<ObjectPredicate<'_>>,
    ) -> Result<FileIterator, QueueError> {
        let settings = self.inner.metadata.settings();
        let listing = self.inner.store.list(settings.list_objects_batch_size).await?;
        let iterator = FileIterator::new(
            Arc::clone(&self.inner.metadata),
            listing,
            predicate,
            self.inner.shutdown.child_token(),
        )
        .await?;
        Ok(iterator)
    }

    pub fn get_settings(&self) -> QueueSettings {
        self.inner.metadata.settings()
    }

    /// Alter settings, subject to the per-mode whitelist. Structural changes
    /// require every dependent detached first.
    pub async fn alter_settings(
        &self,
        patch: &QueueSettingsPatch,
    ) -> Result<QueueSettings, QueueError> {
        self.inner
            .metadata
            .alter_settings(patch, self.dependents())
            .await
    }

    /// Register a consumer. Iterations only run while at least one dependent
    /// is attached.
    pub fn attach_dependent(&self) -> usize {
        let count = self.inner.dependents.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target = %self.inner.target, dependents = count, "Dependent attached");
        count
    }

    pub fn detach_dependent(&self) -> usize {
        let count = self
            .inner
            .dependents
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .unwrap_or(0);
        debug!(target = %self.inner.target, dependents = count, "Dependent detached");
        count
    }

    pub fn dependents(&self) -> usize {
        self.inner.dependents.load(Ordering::SeqCst)
    }

    /// Stop background tasks, unregister the replica, and release this
    /// instance's metadata reference. Keeper state stays for future attaches.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                debug!(target = %self.inner.target, error = %err, "Background task panicked");
            }
        }
        self.inner.metadata.unregister_replica().await;
        self.registry.detach(&self.root).await;
        info!(target = %self.inner.target, "Queue stopped");
    }

    /// Shut down and drop the table: when this instance held the last
    /// in-process reference, the whole coordination subtree is removed.
    pub async fn drop_table(self) -> Result<(), QueueError> {
        self.inner.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                debug!(target = %self.inner.target, error = %err, "Background task panicked");
            }
        }
        drop(tasks);
        self.inner.metadata.unregister_replica().await;
        self.registry.remove(&self.root).await?;
        info!(target = %self.inner.target, "Queue dropped");
        Ok(())
    }
}
