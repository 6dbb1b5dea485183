//! skua: a distributed object-store queue.
//!
//! Replicas watch one bucket/prefix, agree through a shared coordination
//! service on who processes which newly-arrived object, and commit progress
//! atomically. The crate provides:
//!
//! - `store` - Object-store access (S3, Azure, local) via `object_store`
//! - `keeper` - Coordination-service client trait + in-process implementation
//! - `metadata` - Durable processing state: claims, buckets, commits, cleanup
//! - `iterator` - Per-iteration sequence of claimable objects
//! - `source` - Worker processing and the parser/sink host seams
//! - `scheduler`/`queue` - Polling loop and the table host object
//! - `settings` - Typed table settings with per-mode alter rules
//! - `ring` - Deterministic key→replica claim pre-filter
//! - `metrics` - Internal-event metric emission
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skua::{
//!     InMemoryKeeper, MetadataRegistry, NdjsonParser, ObjectQueue, ObjectStoreClient,
//!     QueueConfig, QueueMode, QueueSettings, RowSink, SinkError,
//! };
//!
//! struct PrintSink;
//!
//! #[async_trait::async_trait]
//! impl RowSink for PrintSink {
//!     async fn insert(&self, rows: Vec<serde_json::Value>) -> Result<(), SinkError> {
//!         println!("{} rows", rows.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), skua::QueueError> {
//! let keeper = InMemoryKeeper::new();
//! let registry = Arc::new(MetadataRegistry::new());
//! let queue = ObjectQueue::attach(
//!     registry,
//!     Arc::new(keeper.session()),
//!     Arc::new(ObjectStoreClient::for_url("s3://bucket/incoming")?),
//!     Arc::new(NdjsonParser),
//!     Arc::new(PrintSink),
//!     QueueConfig {
//!         root_path: "tables/events".into(),
//!         replica_id: "replica-0".into(),
//!         settings: QueueSettings::new(QueueMode::Unordered),
//!     },
//! )
//! .await?;
//! queue.attach_dependent();
//! queue.start().await;
//! # Ok(())
//! # }
//! ```

pub mod commit;
pub mod error;
pub mod iterator;
pub mod keeper;
pub mod metadata;
pub mod metrics;
pub mod queue;
pub mod ring;
mod scheduler;
pub mod settings;
pub mod source;
pub mod store;
pub mod tracing;

// Re-export commonly used items
pub use commit::IterationSummary;
pub use error::{
    CoordinationError, ParseError, QueueError, SettingsError, SinkError, StoreError,
};
pub use iterator::{FileIterator, ObjectPredicate};
pub use keeper::memory::{InMemoryKeeper, InMemorySession};
pub use keeper::{CoordinationClient, NodeMode, NodeVersion, TxnOp, VersionedNode};
pub use metadata::object_state::{ClaimOutcome, ObjectClaim, ObjectRecord, ObjectState};
pub use metadata::registry::MetadataRegistry;
pub use metadata::{CommitBatch, CommitEntry, CommitOutcome, QueueMetadata, QueueMetadataRef};
pub use queue::{ObjectQueue, QueueConfig};
pub use ring::RingView;
pub use settings::{AfterProcessing, QueueMode, QueueSettings, QueueSettingsPatch};
pub use source::{
    CommitThresholds, NdjsonParser, ProcessingProgress, ProcessingSource, RecordParser, RowSink,
};
pub use store::{DiscoveredObject, ObjectStoreClient, ObjectStoreClientRef, StoreBackend};
pub use tracing::init_tracing;
