//! In-process coordination service.
//!
//! A single shared namespace with cheap session handles. Faithful where it
//! matters to the callers: version preconditions, atomic `multi`, and
//! ephemeral-node cleanup on session close. Version stamps are namespace-wide
//! and monotonic, so a stale version can never be satisfied by a node that
//! was deleted and recreated.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CoordinationError;
use crate::keeper::{CoordinationClient, NodeMode, NodeVersion, TxnOp, VersionedNode};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: NodeVersion,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Namespace {
    nodes: BTreeMap<String, Node>,
    next_stamp: NodeVersion,
    next_session: u64,
}

impl Namespace {
    fn stamp(&mut self) -> NodeVersion {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn apply(&mut self, op: &TxnOp) -> Result<(), CoordinationError> {
        match op {
            TxnOp::Create { path, data } => {
                if self.nodes.contains_key(path) {
                    return Err(CoordinationError::NodeExists { path: path.clone() });
                }
                let version = self.stamp();
                self.nodes.insert(
                    path.clone(),
                    Node {
                        data: data.clone(),
                        version,
                        ephemeral_owner: None,
                    },
                );
                Ok(())
            }
            TxnOp::Set {
                path,
                data,
                expected_version,
            } => {
                let version = self.stamp();
                let node = self
                    .nodes
                    .get_mut(path)
                    .ok_or_else(|| CoordinationError::NoNode { path: path.clone() })?;
                if let Some(expected) = expected_version {
                    if node.version != *expected {
                        return Err(CoordinationError::BadVersion { path: path.clone() });
                    }
                }
                node.data = data.clone();
                node.version = version;
                Ok(())
            }
            TxnOp::Check {
                path,
                expected_version,
            } => {
                let node = self
                    .nodes
                    .get(path)
                    .ok_or_else(|| CoordinationError::NoNode { path: path.clone() })?;
                if node.version != *expected_version {
                    return Err(CoordinationError::BadVersion { path: path.clone() });
                }
                Ok(())
            }
            TxnOp::Delete {
                path,
                expected_version,
            } => {
                let node = self
                    .nodes
                    .get(path)
                    .ok_or_else(|| CoordinationError::NoNode { path: path.clone() })?;
                if let Some(expected) = expected_version {
                    if node.version != *expected {
                        return Err(CoordinationError::BadVersion { path: path.clone() });
                    }
                }
                self.nodes.remove(path);
                Ok(())
            }
        }
    }
}

/// Shared in-process namespace. Clone-cheap; hand out per-replica handles
/// with [`InMemoryKeeper::session`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryKeeper {
    shared: Arc<Mutex<Namespace>>,
}

impl InMemoryKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. Ephemeral nodes created through the returned handle
    /// disappear when it is closed.
    pub fn session(&self) -> InMemorySession {
        let mut ns = lock(&self.shared);
        ns.next_session += 1;
        let session_id = ns.next_session;
        drop(ns);
        InMemorySession {
            shared: Arc::clone(&self.shared),
            session_id,
        }
    }
}

/// One client session onto an [`InMemoryKeeper`] namespace.
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Mutex<Namespace>>,
    session_id: u64,
}

fn lock(shared: &Arc<Mutex<Namespace>>) -> MutexGuard<'_, Namespace> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: NodeMode,
    ) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut ns = lock(&self.shared);
        if ns.nodes.contains_key(&path) {
            return Err(CoordinationError::NodeExists { path });
        }
        let version = ns.stamp();
        let ephemeral_owner = match mode {
            NodeMode::Persistent => None,
            NodeMode::Ephemeral => Some(self.session_id),
        };
        ns.nodes.insert(
            path,
            Node {
                data,
                version,
                ephemeral_owner,
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<VersionedNode>, CoordinationError> {
        let path = normalize(path);
        let ns = lock(&self.shared);
        Ok(ns.nodes.get(&path).map(|node| VersionedNode {
            data: Bytes::from(node.data.clone()),
            version: node.version,
        }))
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<NodeVersion>,
    ) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut ns = lock(&self.shared);
        ns.apply(&TxnOp::Set {
            path,
            data,
            expected_version,
        })
    }

    async fn delete(
        &self,
        path: &str,
        expected_version: Option<NodeVersion>,
    ) -> Result<(), CoordinationError> {
        let path = normalize(path);
        let mut ns = lock(&self.shared);
        ns.apply(&TxnOp::Delete {
            path,
            expected_version,
        })
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let prefix = format!("{}/", normalize(path));
        let ns = lock(&self.shared);
        let mut children = BTreeSet::new();
        for key in ns.nodes.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest);
                children.insert(child.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn multi(&self, ops: Vec<TxnOp>) -> Result<(), CoordinationError> {
        let mut ns = lock(&self.shared);
        // Apply against a scratch copy; commit only if every op succeeds.
        let mut scratch = Namespace {
            nodes: ns.nodes.clone(),
            next_stamp: ns.next_stamp,
            next_session: ns.next_session,
        };
        for op in &ops {
            scratch.apply(op)?;
        }
        ns.nodes = scratch.nodes;
        ns.next_stamp = scratch.next_stamp;
        Ok(())
    }

    async fn delete_subtree(&self, path: &str) -> Result<(), CoordinationError> {
        let root = normalize(path);
        let prefix = format!("{root}/");
        let mut ns = lock(&self.shared);
        ns.nodes
            .retain(|key, _| key != &root && !key.starts_with(&prefix));
        Ok(())
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        let mut ns = lock(&self.shared);
        ns.nodes
            .retain(|_, node| node.ephemeral_owner != Some(self.session_id));
        Ok(())
    }
}
