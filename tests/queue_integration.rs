//! Multi-replica queue scenarios over a local object store and an in-process
//! coordination service.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use skua::{
    AfterProcessing, CoordinationClient, CoordinationError, InMemoryKeeper, MetadataRegistry,
    NdjsonParser, NodeMode, NodeVersion, ObjectQueue, ObjectStoreClient, ParseError, QueueConfig,
    QueueMode, QueueSettings, RecordParser, RowSink, SinkError, TxnOp, VersionedNode,
};

// ============ Test Fixtures ============

struct CollectingSink {
    rows: Mutex<Vec<serde_json::Value>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
        })
    }

    async fn ids(&self) -> Vec<i64> {
        self.rows
            .lock()
            .await
            .iter()
            .filter_map(|row| row["id"].as_i64())
            .collect()
    }
}

#[async_trait]
impl RowSink for CollectingSink {
    async fn insert(&self, mut rows: Vec<serde_json::Value>) -> Result<(), SinkError> {
        self.rows.lock().await.append(&mut rows);
        Ok(())
    }
}

struct RefusingSink;

#[async_trait]
impl RowSink for RefusingSink {
    async fn insert(&self, _rows: Vec<serde_json::Value>) -> Result<(), SinkError> {
        Err(SinkError::insert("destination refused the block"))
    }
}

struct BrokenParser;

#[async_trait]
impl RecordParser for BrokenParser {
    async fn parse(
        &self,
        key: &str,
        _data: bytes::Bytes,
    ) -> Result<Vec<serde_json::Value>, ParseError> {
        Err(ParseError::Malformed {
            key: key.to_string(),
            message: "unreadable".to_string(),
        })
    }
}

/// Parser that rejects one specific key and handles the rest as NDJSON.
struct FaultyKeyParser {
    bad_key: String,
}

#[async_trait]
impl RecordParser for FaultyKeyParser {
    async fn parse(
        &self,
        key: &str,
        data: bytes::Bytes,
    ) -> Result<Vec<serde_json::Value>, ParseError> {
        if key == self.bad_key {
            return Err(ParseError::Malformed {
                key: key.to_string(),
                message: "unreadable".to_string(),
            });
        }
        NdjsonParser.parse(key, data).await
    }
}

/// Coordination client that delegates everything but fails `multi` while
/// armed, simulating an outage exactly at commit time.
struct CommitFaultClient {
    inner: skua::InMemorySession,
    fail_multi: AtomicBool,
}

impl CommitFaultClient {
    fn new(inner: skua::InMemorySession) -> Self {
        Self {
            inner,
            fail_multi: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.fail_multi.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationClient for CommitFaultClient {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: NodeMode,
    ) -> Result<(), CoordinationError> {
        self.inner.create(path, data, mode).await
    }

    async fn get(&self, path: &str) -> Result<Option<VersionedNode>, CoordinationError> {
        self.inner.get(path).await
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<NodeVersion>,
    ) -> Result<(), CoordinationError> {
        self.inner.set(path, data, expected_version).await
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<NodeVersion>,
    ) -> Result<(), CoordinationError> {
        self.inner.delete(path, expected_version).await
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.inner.list_children(path).await
    }

    async fn multi(&self, ops: Vec<TxnOp>) -> Result<(), CoordinationError> {
        if self.fail_multi.load(Ordering::SeqCst) {
            return Err(CoordinationError::Backend {
                message: "connection lost".to_string(),
            });
        }
        self.inner.multi(ops).await
    }

    async fn delete_subtree(&self, path: &str) -> Result<(), CoordinationError> {
        self.inner.delete_subtree(path).await
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.inner.close().await
    }
}

fn write_objects(dir: &TempDir, count: usize) {
    for i in 0..count {
        let path = dir.path().join(format!("part-{i:03}.ndjson"));
        fs::write(path, format!("{{\"id\":{i}}}\n")).unwrap();
    }
}

async fn make_queue(
    keeper: Arc<dyn CoordinationClient>,
    dir: &TempDir,
    replica_id: &str,
    settings: QueueSettings,
    sink: Arc<dyn RowSink>,
) -> ObjectQueue {
    let registry = Arc::new(MetadataRegistry::new());
    let store = Arc::new(ObjectStoreClient::local(dir.path().to_str().unwrap()).unwrap());
    let queue = ObjectQueue::attach(
        registry,
        keeper,
        store,
        Arc::new(NdjsonParser),
        sink,
        QueueConfig {
            root_path: "tables/events".to_string(),
            replica_id: replica_id.to_string(),
            settings,
        },
    )
    .await
    .unwrap();
    queue.attach_dependent();
    queue
}

// ============ Scenarios ============

#[tokio::test]
async fn single_replica_processes_each_object_once() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 5);
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        QueueSettings::new(QueueMode::Unordered),
        sink.clone(),
    )
    .await;

    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.rows, 5);

    let mut ids = sink.ids().await;
    ids.sort();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);

    // Nothing to do on the next pass.
    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(sink.ids().await.len(), 5);
    queue.shutdown().await;
}

#[tokio::test]
async fn delete_after_processing_removes_source_objects() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 3);
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let mut settings = QueueSettings::new(QueueMode::Unordered);
    settings.after_processing = AfterProcessing::Delete;
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        settings,
        sink.clone(),
    )
    .await;

    queue.run_iteration().await.unwrap();
    assert_eq!(sink.ids().await.len(), 3);
    let leftover: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftover.is_empty(), "source objects should be gone");
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_replicas_never_process_the_same_object() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 20);
    let keeper = InMemoryKeeper::new();
    let sink_a = CollectingSink::new();
    let sink_b = CollectingSink::new();

    // Separate registries: the replicas model two independent processes
    // sharing only the store and the coordination service.
    let queue_a = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-a",
        QueueSettings::new(QueueMode::Unordered),
        sink_a.clone(),
    )
    .await;
    let queue_b = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-b",
        QueueSettings::new(QueueMode::Unordered),
        sink_b.clone(),
    )
    .await;

    let (ra, rb) = tokio::join!(queue_a.run_iteration(), queue_b.run_iteration());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.processed + rb.processed, 20);

    let ids_a = sink_a.ids().await;
    let ids_b = sink_b.ids().await;
    let union: HashSet<i64> = ids_a.iter().chain(ids_b.iter()).copied().collect();
    assert_eq!(ids_a.len() + ids_b.len(), 20, "an object was processed twice");
    assert_eq!(union.len(), 20);

    queue_a.shutdown().await;
    queue_b.shutdown().await;
}

#[tokio::test]
async fn ordered_watermark_gates_offers() {
    let dir = tempfile::tempdir().unwrap();
    // Keys 007 and 012, with the table bootstrapped at watermark 010:
    // 007 must never be offered, 012 must be.
    fs::write(dir.path().join("part-007.ndjson"), "{\"id\":7}\n").unwrap();
    fs::write(dir.path().join("part-012.ndjson"), "{\"id\":12}\n").unwrap();
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let mut settings = QueueSettings::new(QueueMode::Ordered);
    settings.buckets = 1;
    settings.last_processed_key = Some("part-010.ndjson".to_string());
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        settings,
        sink.clone(),
    )
    .await;

    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(sink.ids().await, vec![12]);

    // A later arrival above the new watermark is picked up next pass.
    fs::write(dir.path().join("part-013.ndjson"), "{\"id\":13}\n").unwrap();
    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(sink.ids().await, vec![12, 13]);
    queue.shutdown().await;
}

#[tokio::test]
async fn ordered_retryable_failure_is_reoffered() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 3);
    let keeper = InMemoryKeeper::new();
    let sink_a = CollectingSink::new();
    let sink_b = CollectingSink::new();

    let mut settings = QueueSettings::new(QueueMode::Ordered);
    settings.buckets = 1;
    let registry = Arc::new(MetadataRegistry::new());
    let store = Arc::new(ObjectStoreClient::local(dir.path().to_str().unwrap()).unwrap());
    let queue_a = ObjectQueue::attach(
        registry,
        Arc::new(keeper.session()),
        store,
        Arc::new(FaultyKeyParser {
            bad_key: "part-000.ndjson".to_string(),
        }),
        sink_a.clone(),
        QueueConfig {
            root_path: "tables/events".to_string(),
            replica_id: "replica-a".to_string(),
            settings: settings.clone(),
        },
    )
    .await
    .unwrap();
    queue_a.attach_dependent();

    // The smallest key fails but the rest of the bucket commits: the
    // watermark must not advance past the failure.
    let summary = queue_a.run_iteration().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 2);
    assert_eq!(sink_a.ids().await, vec![1, 2]);
    queue_a.shutdown().await;

    // A healthy replica still gets the failed object offered.
    let queue_b = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-b",
        settings,
        sink_b.clone(),
    )
    .await;
    let summary = queue_b.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(sink_b.ids().await, vec![0]);
    queue_b.shutdown().await;
}

#[tokio::test]
async fn commit_fault_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 2);
    let keeper = InMemoryKeeper::new();
    let sink_a = CollectingSink::new();
    let sink_b = CollectingSink::new();

    let fault_client = Arc::new(CommitFaultClient::new(keeper.session()));
    let mut settings = QueueSettings::new(QueueMode::Unordered);
    settings.lease_timeout_ms = 500;
    let queue_a = make_queue(
        fault_client.clone(),
        &dir,
        "replica-a",
        settings.clone(),
        sink_a.clone(),
    )
    .await;

    // The outage hits exactly at commit time: the iteration fails and no
    // object record moves past Processing.
    fault_client.arm();
    let err = queue_a.run_iteration().await.unwrap_err();
    assert!(matches!(err, skua::QueueError::Coordination { .. }));

    // A healthy replica sees live leases first, then reclaims after expiry.
    let queue_b = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-b",
        settings,
        sink_b.clone(),
    )
    .await;
    let summary = queue_b.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 0, "leases should still be live");

    tokio::time::sleep(Duration::from_millis(600)).await;
    let summary = queue_b.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 2);
    let mut ids = sink_b.ids().await;
    ids.sort();
    assert_eq!(ids, vec![0, 1]);

    queue_a.shutdown().await;
    queue_b.shutdown().await;
}

#[tokio::test]
async fn parse_failures_retry_until_terminal() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 1);
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let mut settings = QueueSettings::new(QueueMode::Unordered);
    settings.loading_retries = 2;
    settings.lease_timeout_ms = 0;
    let registry = Arc::new(MetadataRegistry::new());
    let store = Arc::new(ObjectStoreClient::local(dir.path().to_str().unwrap()).unwrap());
    let queue = ObjectQueue::attach(
        registry,
        Arc::new(keeper.session()),
        store,
        Arc::new(BrokenParser),
        sink.clone(),
        QueueConfig {
            root_path: "tables/events".to_string(),
            replica_id: "replica-0".to_string(),
            settings,
        },
    )
    .await
    .unwrap();
    queue.attach_dependent();

    // Two failing attempts exhaust the retry budget.
    for _ in 0..2 {
        let summary = queue.run_iteration().await.unwrap();
        assert_eq!(summary.failed, 1);
    }
    // Terminal: the object is no longer offered.
    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.processed, 0);
    assert!(sink.ids().await.is_empty());
    queue.shutdown().await;
}

#[tokio::test]
async fn sink_refusal_consumes_a_retry_not_the_object() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 1);
    let keeper = InMemoryKeeper::new();

    let mut settings = QueueSettings::new(QueueMode::Unordered);
    settings.lease_timeout_ms = 0;
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        settings.clone(),
        Arc::new(RefusingSink),
    )
    .await;

    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.rows, 0);
    queue.shutdown().await;

    // The object is still retryable by a healthy consumer.
    let sink = CollectingSink::new();
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-1",
        settings,
        sink.clone(),
    )
    .await;
    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(sink.ids().await, vec![0]);
    queue.shutdown().await;
}

#[tokio::test]
async fn polling_loop_picks_up_new_objects() {
    let dir = tempfile::tempdir().unwrap();
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let mut settings = QueueSettings::new(QueueMode::Unordered);
    settings.polling_min_timeout_ms = 10;
    settings.polling_max_timeout_ms = 50;
    settings.polling_backoff_ms = 10;
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        settings,
        sink.clone(),
    )
    .await;
    queue.start().await;

    write_objects(&dir, 3);
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if sink.ids().await.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("polling loop never processed the objects");

    queue.shutdown().await;
}

#[tokio::test]
async fn structural_alter_requires_detached_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let mut settings = QueueSettings::new(QueueMode::Ordered);
    settings.buckets = 2;
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        settings,
        sink,
    )
    .await;

    let patch = skua::QueueSettingsPatch {
        buckets: Some(4),
        ..Default::default()
    };
    let err = queue.alter_settings(&patch).await.unwrap_err();
    assert!(matches!(
        err,
        skua::QueueError::Settings {
            source: skua::SettingsError::StructuralWithDependents { .. }
        }
    ));

    queue.detach_dependent();
    let altered = queue.alter_settings(&patch).await.unwrap();
    assert_eq!(altered.buckets, 4);
    queue.shutdown().await;
}

#[tokio::test]
async fn drop_table_clears_coordination_state() {
    let dir = tempfile::tempdir().unwrap();
    write_objects(&dir, 1);
    let keeper = InMemoryKeeper::new();
    let sink = CollectingSink::new();

    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        QueueSettings::new(QueueMode::Unordered),
        sink.clone(),
    )
    .await;
    queue.run_iteration().await.unwrap();
    queue.drop_table().await.unwrap();

    let observer = keeper.session();
    assert!(!observer.exists("tables/events/settings").await.unwrap());
    assert!(
        observer
            .list_children("tables/events/objects")
            .await
            .unwrap()
            .is_empty()
    );

    // A fresh attach reprocesses from scratch.
    let sink2 = CollectingSink::new();
    let queue = make_queue(
        Arc::new(keeper.session()),
        &dir,
        "replica-0",
        QueueSettings::new(QueueMode::Unordered),
        sink2.clone(),
    )
    .await;
    let summary = queue.run_iteration().await.unwrap();
    assert_eq!(summary.processed, 1);
    queue.shutdown().await;
}
