//! File-based storage driver
//!
//! Layout under the base directory:
//!
//! ```text
//! <namespace>/<name>/v1.release   encoded revision
//! <namespace>/<name>/v2.release
//! <namespace>/<name>/.lock        JSON lock record while an operation runs
//! ```
//!
//! A lock record is written to a staging file first and then hard-linked to
//! `.lock`. Linking fails when the target exists, so two processes racing
//! for the same release cannot both succeed, and `.lock` never holds a
//! partial record.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use super::{
    CompressionMethod, LockRecord, StorageDriver, decode_from_storage, encode_for_storage, release_not_found,
    revision_not_found,
};
use crate::error::{KubeError, Result};
use crate::release::Revision;

const REVISION_EXTENSION: &str = "release";
const LOCK_FILE: &str = ".lock";

/// File-based storage driver
#[derive(Debug, Clone)]
pub struct FileDriver {
    /// Base directory for storing releases
    base_dir: PathBuf,
    compression: CompressionMethod,
}

impl FileDriver {
    /// Create a new file driver
    pub fn new(base_dir: impl Into<PathBuf>, compression: CompressionMethod) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir, compression })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the directory for a release (all revisions)
    fn release_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.base_dir.join(namespace).join(name)
    }

    fn revision_path(&self, namespace: &str, name: &str, revision: u32) -> PathBuf {
        self.release_dir(namespace, name)
            .join(format!("v{}.{}", revision, REVISION_EXTENSION))
    }

    fn lock_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.release_dir(namespace, name).join(LOCK_FILE)
    }

    fn write_revision(&self, revision: &Revision) -> Result<()> {
        let path = self.revision_path(&revision.namespace, &revision.name, revision.revision);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, encode_for_storage(revision, self.compression)?)?;
        Ok(())
    }

    fn read_revision(&self, path: &Path) -> Result<Revision> {
        let data = fs::read_to_string(path)?;
        decode_from_storage(&data, self.compression)
    }

    /// Revision numbers present on disk, ascending
    fn revision_numbers(&self, namespace: &str, name: &str) -> Result<Vec<u32>> {
        let dir = self.release_dir(namespace, name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut numbers: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == REVISION_EXTENSION) {
                    path.file_stem()?.to_str()?.strip_prefix('v')?.parse().ok()
                } else {
                    None
                }
            })
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Remove the release directory and its namespace if they became empty
    fn prune_dirs(&self, namespace: &str, name: &str) {
        let _ = fs::remove_dir(self.release_dir(namespace, name));
        let _ = fs::remove_dir(self.base_dir.join(namespace));
    }

    fn subdirs(path: &Path) -> Result<Vec<PathBuf>> {
        match fs::read_dir(path) {
            Ok(entries) => Ok(entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

#[async_trait]
impl StorageDriver for FileDriver {
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        let path = self.revision_path(namespace, name, revision);
        if !path.exists() {
            return Err(revision_not_found(namespace, name, revision));
        }
        self.read_revision(&path)
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<Revision> {
        match self.revision_numbers(namespace, name)?.last() {
            Some(&latest) => self.get(namespace, name, latest).await,
            None => Err(release_not_found(namespace, name)),
        }
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        self.revision_numbers(namespace, name)?
            .into_iter()
            .map(|n| self.read_revision(&self.revision_path(namespace, name, n)))
            .collect()
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Revision>> {
        let namespaces = match namespace {
            Some(ns) => vec![self.base_dir.join(ns)],
            None => Self::subdirs(&self.base_dir)?,
        };

        let mut latest = Vec::new();
        for ns_dir in namespaces {
            let Some(ns) = file_name(&ns_dir) else { continue };
            for release_dir in Self::subdirs(&ns_dir)? {
                let Some(name) = file_name(&release_dir) else { continue };
                match self.get_latest(ns, name).await {
                    Ok(revision) => latest.push(revision),
                    Err(KubeError::ReleaseNotFound { .. }) => {}
                    Err(e) => warn!(namespace = ns, release = name, error = %e, "skipping unreadable release"),
                }
            }
        }
        latest.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(latest)
    }

    async fn create(&self, revision: &Revision) -> Result<()> {
        let path = self.revision_path(&revision.namespace, &revision.name, revision.revision);
        if path.exists() {
            return Err(KubeError::Storage(format!(
                "revision {} of release '{}' already exists",
                revision.revision, revision.name
            )));
        }
        self.write_revision(revision)
    }

    async fn update(&self, revision: &Revision) -> Result<()> {
        let path = self.revision_path(&revision.namespace, &revision.name, revision.revision);
        if !path.exists() {
            return Err(revision_not_found(&revision.namespace, &revision.name, revision.revision));
        }
        self.write_revision(revision)
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        let removed = self.get(namespace, name, revision).await?;
        fs::remove_file(self.revision_path(namespace, name, revision))?;
        self.prune_dirs(namespace, name);
        Ok(removed)
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        let revisions = self.history(namespace, name).await?;
        for revision in &revisions {
            fs::remove_file(self.revision_path(namespace, name, revision.revision))?;
        }
        self.prune_dirs(namespace, name);
        Ok(revisions)
    }

    async fn try_lock(&self, namespace: &str, name: &str, lock: &LockRecord) -> Result<bool> {
        let dir = self.release_dir(namespace, name);
        fs::create_dir_all(&dir)?;

        let staging = dir.join(format!("{}.{}", LOCK_FILE, lock.token));
        let linked = write_synced(&staging, &serde_json::to_vec(lock)?)
            .and_then(|()| fs::hard_link(&staging, self.lock_path(namespace, name)));
        if let Err(e) = fs::remove_file(&staging) {
            warn!(path = %staging.display(), error = %e, "could not remove staged lock");
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, namespace: &str, name: &str, token: &str) -> Result<bool> {
        match self.read_lock(namespace, name).await? {
            Some(lock) if lock.token == token => {
                fs::remove_file(self.lock_path(namespace, name))?;
                self.prune_dirs(namespace, name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>> {
        match fs::read(self.lock_path(namespace, name)) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn break_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>> {
        let path = self.lock_path(namespace, name);
        // An unreadable marker still blocks the release, so remove it regardless
        let lock = self.read_lock(namespace, name).await.unwrap_or_else(|e| {
            warn!(namespace, release = name, error = %e, "removing unreadable lock");
            None
        });
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.prune_dirs(namespace, name);
        Ok(lock)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}
