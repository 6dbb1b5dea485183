//! Object-store access layer.
//!
//! A thin tagged client over `object_store` with the three operations the
//! queue needs: list the watched prefix, read one object, delete committed
//! objects. Listings return keys relative to the configured prefix; all other
//! operations take those relative keys and qualify them internally.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use snafu::prelude::*;
use tracing::debug;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StoreError};
use crate::metrics::events::{
    RequestStatus, StoreOperation, StoreRequest, StoreRequestDuration,
};

/// Which service backs a client. Used for logging and capability decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    S3,
    Azure,
    Local,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::S3 => "s3",
            StoreBackend::Azure => "azure",
            StoreBackend::Local => "local",
        }
    }
}

/// One object found by a listing, with enough identity to detect rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredObject {
    /// Key relative to the watched prefix.
    pub key: String,
    pub size: u64,
    /// Content identity: the store's etag when available, otherwise
    /// last-modified + size. A changed token means the object was rewritten.
    pub version_token: String,
}

/// A reference-counted store client.
pub type ObjectStoreClientRef = Arc<ObjectStoreClient>;

/// Client for the watched bucket/prefix of one queue table.
#[derive(Clone)]
pub struct ObjectStoreClient {
    backend: StoreBackend,
    object_store: Arc<dyn ObjectStore>,
    key_prefix: Option<Path>,
    canonical_url: String,
}

impl std::fmt::Debug for ObjectStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreClient<{}>", self.canonical_url)
    }
}

impl ObjectStoreClient {
    /// Create a client for the given URL.
    ///
    /// Supported forms: `s3://bucket/prefix`, `az://container/prefix`,
    /// `file:///abs/path`. Credentials come from the environment, as the
    /// respective builders define.
    pub fn for_url(url: &str) -> Result<Self, StoreError> {
        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, prefix) = split_bucket_and_prefix(rest, url)?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .context(ObjectStoreSnafu)?;
            Ok(Self {
                backend: StoreBackend::S3,
                object_store: Arc::new(store),
                key_prefix: prefix,
                canonical_url: url.to_string(),
            })
        } else if let Some(rest) = url.strip_prefix("az://") {
            let (container, prefix) = split_bucket_and_prefix(rest, url)?;
            let store = MicrosoftAzureBuilder::from_env()
                .with_container_name(container)
                .build()
                .context(ObjectStoreSnafu)?;
            Ok(Self {
                backend: StoreBackend::Azure,
                object_store: Arc::new(store),
                key_prefix: prefix,
                canonical_url: url.to_string(),
            })
        } else if let Some(path) = url.strip_prefix("file://") {
            Self::local(path)
        } else {
            InvalidUrlSnafu { url }.fail()
        }
    }

    /// Create a client rooted at a local directory. Also what tests use.
    pub fn local(root: &str) -> Result<Self, StoreError> {
        let store = LocalFileSystem::new_with_prefix(root).context(ObjectStoreSnafu)?;
        Ok(Self {
            backend: StoreBackend::Local,
            object_store: Arc::new(store),
            key_prefix: None,
            canonical_url: format!("file://{root}"),
        })
    }

    pub fn backend(&self) -> StoreBackend {
        self.backend
    }

    pub fn url(&self) -> &str {
        &self.canonical_url
    }

    fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match &self.key_prefix {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// List every object under the watched prefix, consumed from the store in
    /// batches of `batch_size`. Keys are relative to the prefix and the
    /// result is sorted by key.
    pub async fn list(&self, batch_size: usize) -> Result<Vec<DiscoveredObject>, StoreError> {
        let start = Instant::now();
        let prefix_part_count = self
            .key_prefix
            .as_ref()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let mut discovered = Vec::new();
        let mut stream = self
            .object_store
            .list(self.key_prefix.as_ref())
            .chunks(batch_size.max(1));
        while let Some(batch) = stream.next().await {
            for meta in batch {
                let meta = match meta {
                    Ok(meta) => meta,
                    Err(err) => {
                        emit!(StoreRequest {
                            operation: StoreOperation::List,
                            status: RequestStatus::Error,
                        });
                        return Err(err).context(ObjectStoreSnafu);
                    }
                };
                let relative: Path = meta.location.parts().skip(prefix_part_count).collect();
                let version_token = version_token(
                    meta.e_tag.as_deref(),
                    meta.last_modified,
                    meta.size as u64,
                );
                discovered.push(DiscoveredObject {
                    key: relative.to_string(),
                    size: meta.size as u64,
                    version_token,
                });
            }
            debug!(
                url = %self.canonical_url,
                listed = discovered.len(),
                "Consumed listing batch"
            );
        }

        discovered.sort_by(|a, b| a.key.cmp(&b.key));
        emit!(StoreRequest {
            operation: StoreOperation::List,
            status: RequestStatus::Success,
        });
        emit!(StoreRequestDuration {
            operation: StoreOperation::List,
            duration: start.elapsed(),
        });
        Ok(discovered)
    }

    /// Get the contents of an object by relative key.
    pub async fn read(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = Path::from(key);
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        let status = if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        };
        emit!(StoreRequest {
            operation: StoreOperation::Get,
            status,
        });
        emit!(StoreRequestDuration {
            operation: StoreOperation::Get,
            duration: start.elapsed(),
        });

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Delete objects by relative key, ignoring those already gone.
    /// Returns how many existed and were removed.
    pub async fn delete_if_exists(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in keys {
            let path = Path::from(key.as_str());
            let result = self.object_store.delete(&self.qualify_path(&path)).await;
            match result {
                Ok(()) => {
                    emit!(StoreRequest {
                        operation: StoreOperation::Delete,
                        status: RequestStatus::Success,
                    });
                    removed += 1;
                }
                Err(object_store::Error::NotFound { .. }) => {}
                Err(err) => {
                    emit!(StoreRequest {
                        operation: StoreOperation::Delete,
                        status: RequestStatus::Error,
                    });
                    return Err(err).context(ObjectStoreSnafu);
                }
            }
        }
        Ok(removed)
    }
}

fn split_bucket_and_prefix(
    rest: &str,
    url: &str,
) -> Result<(String, Option<Path>), StoreError> {
    let mut parts = rest.splitn(2, '/');
    let bucket = parts.next().unwrap_or_default();
    ensure!(!bucket.is_empty(), InvalidUrlSnafu { url });
    let prefix = parts
        .next()
        .filter(|p| !p.is_empty())
        .map(Path::from);
    Ok((bucket.to_string(), prefix))
}

fn version_token(e_tag: Option<&str>, last_modified: DateTime<Utc>, size: u64) -> String {
    match e_tag {
        Some(tag) => tag.to_string(),
        None => format!("{}-{}", last_modified.timestamp_millis(), size),
    }
}
