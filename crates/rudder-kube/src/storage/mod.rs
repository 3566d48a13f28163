//! Storage drivers for persisting revisions
//!
//! - **Memory**: single process, used by tests and dry runs
//! - **File**: one compressed file per revision under a base directory,
//!   shareable between processes on the same host
//!
//! Besides revisions, every driver keeps a per-release lock record. Taking
//! the lock is a compare-and-swap: it succeeds only when no record exists.

mod file;
mod memory;

pub use file::FileDriver;
pub use memory::{MemoryDriver, OperationCounts};

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rudder_core::Operation;
use serde::{Deserialize, Serialize};

use crate::error::{KubeError, Result};
use crate::release::{Revision, is_expired};

/// Marker of the operation currently holding a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub operation: Operation,
    /// Unique per acquisition; only the holder knows it
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl LockRecord {
    pub fn new(operation: Operation, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            operation,
            token: token.into(),
            acquired_at: Utc::now(),
            timeout,
        }
    }

    /// Held past its timeout, so the holder is presumed dead
    pub fn is_stale(&self) -> bool {
        is_expired(self.acquired_at, self.timeout)
    }
}

/// Storage driver trait for revision persistence
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Get a specific revision
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision>;

    /// Get the highest-numbered revision of a release
    async fn get_latest(&self, namespace: &str, name: &str) -> Result<Revision>;

    /// All revisions of a release, oldest first; empty when unknown
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Revision>>;

    /// Latest revision of every release, optionally within one namespace
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Revision>>;

    /// Store a new revision; fails if the number is taken
    async fn create(&self, revision: &Revision) -> Result<()>;

    /// Overwrite an existing revision
    async fn update(&self, revision: &Revision) -> Result<()>;

    /// Delete a specific revision
    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision>;

    /// Delete all revisions of a release
    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<Revision>>;

    /// Record `lock` unless a lock is already held; true when acquired
    async fn try_lock(&self, namespace: &str, name: &str, lock: &LockRecord) -> Result<bool>;

    /// Remove the lock if `token` still holds it; true when removed
    async fn unlock(&self, namespace: &str, name: &str, token: &str) -> Result<bool>;

    async fn read_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>>;

    /// Remove whatever lock is held, returning it
    async fn break_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>>;

    /// Check if a release exists
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.get_latest(namespace, name).await {
            Ok(_) => Ok(true),
            Err(KubeError::ReleaseNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<T: StorageDriver + ?Sized> StorageDriver for Arc<T> {
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        (**self).get(namespace, name, revision).await
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<Revision> {
        (**self).get_latest(namespace, name).await
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        (**self).history(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Revision>> {
        (**self).list(namespace).await
    }

    async fn create(&self, revision: &Revision) -> Result<()> {
        (**self).create(revision).await
    }

    async fn update(&self, revision: &Revision) -> Result<()> {
        (**self).update(revision).await
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        (**self).delete(namespace, name, revision).await
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        (**self).delete_all(namespace, name).await
    }

    async fn try_lock(&self, namespace: &str, name: &str, lock: &LockRecord) -> Result<bool> {
        (**self).try_lock(namespace, name, lock).await
    }

    async fn unlock(&self, namespace: &str, name: &str, token: &str) -> Result<bool> {
        (**self).unlock(namespace, name, token).await
    }

    async fn read_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>> {
        (**self).read_lock(namespace, name).await
    }

    async fn break_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>> {
        (**self).break_lock(namespace, name).await
    }
}

/// Compression method for revision data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum CompressionMethod {
    /// No compression
    None,

    /// Gzip compression
    Gzip { level: u32 },

    /// Zstd compression (better ratio, faster)
    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

/// Compress data using the configured method
#[must_use = "compression result should be used"]
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder.finish().map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => {
            zstd::encode_all(std::io::Cursor::new(data), level).map_err(|e| KubeError::Compression(e.to_string()))
        }
    }
}

/// Decompress data
#[must_use = "decompression result should be used"]
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd { .. } => {
            zstd::decode_all(std::io::Cursor::new(data)).map_err(|e| KubeError::Compression(e.to_string()))
        }
    }
}

/// Encode a revision for storage (serialize + compress + base64)
#[must_use = "encoded data should be used for storage"]
pub fn encode_for_storage(revision: &Revision, compression: CompressionMethod) -> Result<String> {
    let json = serde_json::to_vec(revision)?;
    let compressed = compress(&json, compression)?;
    Ok(STANDARD.encode(compressed))
}

/// Decode a revision from storage (base64 + decompress + deserialize)
#[must_use = "decoded revision should be used"]
pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<Revision> {
    let decoded = STANDARD
        .decode(data.trim())
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let decompressed = decompress(&decoded, compression)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

pub(crate) fn release_not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

pub(crate) fn revision_not_found(namespace: &str, name: &str, revision: u32) -> KubeError {
    KubeError::RevisionNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
        revision,
    }
}
