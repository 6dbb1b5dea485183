//! Coordination-service client abstraction.
//!
//! The metadata store talks to a small hierarchical namespace of versioned
//! nodes: get/create/set/delete plus an all-or-nothing `multi` transaction.
//! The trait keeps the metadata logic independent of the backing service; the
//! in-process [`memory::InMemoryKeeper`] backs tests and single-node use.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CoordinationError;

pub mod memory;

/// Monotonic version stamp of a node. Every successful create or set assigns
/// a fresh stamp, so a version observed once is never reused, even when a
/// node is deleted and recreated at the same path.
pub type NodeVersion = u64;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Survives until explicitly deleted.
    Persistent,
    /// Removed automatically when the creating session closes.
    Ephemeral,
}

/// A node's payload together with the version it was read at.
#[derive(Debug, Clone)]
pub struct VersionedNode {
    pub data: Bytes,
    pub version: NodeVersion,
}

/// One operation inside a `multi` transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Create a persistent node; fails the transaction if the path exists.
    Create { path: String, data: Vec<u8> },
    /// Overwrite a node, optionally requiring its current version.
    Set {
        path: String,
        data: Vec<u8>,
        expected_version: Option<NodeVersion>,
    },
    /// Assert a node exists at the given version without touching it.
    Check {
        path: String,
        expected_version: NodeVersion,
    },
    /// Delete a node, optionally requiring its current version.
    Delete {
        path: String,
        expected_version: Option<NodeVersion>,
    },
}

/// Client handle onto the coordination namespace.
///
/// All paths are absolute, `/`-separated, without a trailing slash. Parent
/// nodes are implicit: creating `a/b/c` does not require `a/b` to exist, and
/// `list_children` reports the direct child names found under a prefix.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a node. [`CoordinationError::NodeExists`] if the path is taken.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: NodeMode,
    ) -> Result<(), CoordinationError>;

    /// Read a node, or `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<VersionedNode>, CoordinationError>;

    /// Overwrite a node. With `expected_version`, fails with
    /// [`CoordinationError::BadVersion`] unless the node is at that version.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<NodeVersion>,
    ) -> Result<(), CoordinationError>;

    /// Delete a node. Missing nodes yield [`CoordinationError::NoNode`].
    async fn delete(
        &self,
        path: &str,
        expected_version: Option<NodeVersion>,
    ) -> Result<(), CoordinationError>;

    /// Direct child names under `path`, unordered.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Whether a node exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        Ok(self.get(path).await?.is_some())
    }

    /// Apply every operation atomically, or none of them. The first failing
    /// precondition aborts the whole transaction and is returned.
    async fn multi(&self, ops: Vec<TxnOp>) -> Result<(), CoordinationError>;

    /// Delete `path` and everything beneath it. Used for table drop.
    async fn delete_subtree(&self, path: &str) -> Result<(), CoordinationError>;

    /// Close the session, dropping its ephemeral nodes.
    async fn close(&self) -> Result<(), CoordinationError>;
}
