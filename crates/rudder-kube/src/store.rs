//! Release store: revision bookkeeping on top of a [`StorageDriver`]
//!
//! Operations on one release are serialized through a lock record kept next
//! to its revisions. Acquisition never waits: a second operation fails with
//! [`KubeError::ConcurrentModification`]. Unrelated releases never contend.

use std::time::Duration;

use chrono::Utc;
use rudder_core::{Operation, PackageMetadata, Values};
use tracing::{debug, info, warn};

use crate::error::{KubeError, Result};
use crate::release::{Revision, RevisionStatus};
use crate::storage::{LockRecord, StorageDriver};

/// Proof of holding a release's lock
///
/// Release it with [`ReleaseStore::unlock`]. A lock that is never released
/// goes stale after its timeout and can be cleared with
/// [`ReleaseStore::recover`].
#[derive(Debug)]
#[must_use = "the lock must be released with ReleaseStore::unlock"]
pub struct OperationLock {
    namespace: String,
    name: String,
    record: LockRecord,
}

impl OperationLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn operation(&self) -> Operation {
        self.record.operation
    }

    pub fn timeout(&self) -> Duration {
        self.record.timeout
    }
}

/// Contents of a new revision; number and status are assigned by the store
#[derive(Debug, Clone)]
pub struct NewRevision {
    pub package: PackageMetadata,
    /// Effective values
    pub config: Values,
    /// Overrides as supplied
    pub user_config: Values,
    pub manifest: String,
    pub notes: Option<String>,
    pub description: Option<String>,
}

/// What [`ReleaseStore::recover`] cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The lock that was broken, if any
    pub broken_lock: Option<LockRecord>,
    /// A lock marker without a readable record was removed
    pub unreadable_lock: bool,
    /// Revisions moved from pending to failed
    pub failed_revisions: Vec<u32>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.broken_lock.is_none() && !self.unreadable_lock && self.failed_revisions.is_empty()
    }
}

/// Revision history and per-release locking
#[derive(Debug, Clone)]
pub struct ReleaseStore<S> {
    driver: S,
}

impl<S: StorageDriver> ReleaseStore<S> {
    pub fn new(driver: S) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &S {
        &self.driver
    }

    /// Acquire the release's lock for `operation`, failing fast when held
    pub async fn lock(
        &self,
        namespace: &str,
        name: &str,
        operation: Operation,
        timeout: Duration,
    ) -> Result<OperationLock> {
        let token = format!("{}-{:016x}", std::process::id(), rand::random::<u64>());
        let record = LockRecord::new(operation, token, timeout);

        if !self.driver.try_lock(namespace, name, &record).await? {
            // Still held even when the record cannot be read
            let held = self.driver.read_lock(namespace, name).await.unwrap_or_else(|e| {
                warn!(release = name, namespace, error = %e, "unreadable release lock");
                None
            });
            debug!(release = name, namespace, %operation, "release is locked");
            return Err(KubeError::ConcurrentModification {
                name: name.to_string(),
                namespace: namespace.to_string(),
                operation: held
                    .as_ref()
                    .map(|l| l.operation.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                since: held
                    .map(|l| l.acquired_at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        debug!(release = name, namespace, %operation, "acquired release lock");
        Ok(OperationLock {
            namespace: namespace.to_string(),
            name: name.to_string(),
            record,
        })
    }

    /// Release a lock taken with [`lock`](Self::lock)
    ///
    /// Not an error when the lock was broken meanwhile, only logged.
    pub async fn unlock(&self, lock: OperationLock) -> Result<()> {
        let released = self
            .driver
            .unlock(&lock.namespace, &lock.name, &lock.record.token)
            .await?;
        if released {
            debug!(release = %lock.name, namespace = %lock.namespace, "released release lock");
        } else {
            warn!(release = %lock.name, namespace = %lock.namespace, "release lock was broken while held");
        }
        Ok(())
    }

    /// Check that `lock` is still the one recorded for its release
    async fn ensure_held(&self, lock: &OperationLock) -> Result<()> {
        match self.driver.read_lock(&lock.namespace, &lock.name).await? {
            Some(current) if current.token == lock.record.token => Ok(()),
            current => Err(KubeError::ConcurrentModification {
                name: lock.name.clone(),
                namespace: lock.namespace.clone(),
                operation: current
                    .as_ref()
                    .map(|l| l.operation.to_string())
                    .unwrap_or_else(|| "recover".to_string()),
                since: current
                    .map(|l| l.acquired_at.to_rfc3339())
                    .unwrap_or_else(|| Utc::now().to_rfc3339()),
            }),
        }
    }

    /// Number the next revision of a release would get
    pub async fn next_revision_number(&self, namespace: &str, name: &str) -> Result<u32> {
        Ok(self
            .driver
            .history(namespace, name)
            .await?
            .last()
            .map_or(1, |r| r.revision + 1))
    }

    /// Persist a pending revision numbered one past the highest existing one
    pub async fn create_revision(&self, lock: &OperationLock, new: NewRevision) -> Result<Revision> {
        self.ensure_held(lock).await?;

        let history = self.driver.history(&lock.namespace, &lock.name).await?;
        if let Some(pending) = history.iter().find(|r| r.status.is_pending()) {
            return Err(KubeError::ConcurrentModification {
                name: lock.name.clone(),
                namespace: lock.namespace.clone(),
                operation: pending.status.to_string(),
                since: pending.updated_at.to_rfc3339(),
            });
        }

        let now = Utc::now();
        let revision = Revision {
            name: lock.name.clone(),
            namespace: lock.namespace.clone(),
            revision: history.last().map_or(1, |r| r.revision + 1),
            status: RevisionStatus::pending(lock.record.operation, lock.record.timeout),
            package: new.package,
            config: new.config,
            user_config: new.user_config,
            manifest: new.manifest,
            notes: new.notes,
            description: new.description,
            created_at: now,
            updated_at: now,
        };
        self.driver.create(&revision).await?;

        info!(
            release = %revision.name,
            namespace = %revision.namespace,
            revision = revision.revision,
            status = %revision.status,
            "created revision"
        );
        Ok(revision)
    }

    pub async fn get_revision(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        self.driver.get(namespace, name, revision).await
    }

    /// All revisions, oldest first
    pub async fn list_revisions(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        self.driver.history(namespace, name).await
    }

    pub async fn latest(&self, namespace: &str, name: &str) -> Result<Revision> {
        self.driver.get_latest(namespace, name).await
    }

    /// The revision currently deployed, if any
    pub async fn deployed(&self, namespace: &str, name: &str) -> Result<Option<Revision>> {
        Ok(self
            .driver
            .history(namespace, name)
            .await?
            .into_iter()
            .rev()
            .find(Revision::is_deployed))
    }

    /// Latest revision of every release
    pub async fn list_releases(&self, namespace: Option<&str>) -> Result<Vec<Revision>> {
        self.driver.list(namespace).await
    }

    pub async fn set_status(
        &self,
        namespace: &str,
        name: &str,
        revision: u32,
        status: RevisionStatus,
    ) -> Result<Revision> {
        let mut stored = self.driver.get(namespace, name, revision).await?;
        debug!(release = name, namespace, revision, from = %stored.status, to = %status, "revision status");
        stored.transition(status);
        self.driver.update(&stored).await?;
        Ok(stored)
    }

    /// Delete the oldest revisions until at most `keep` remain
    ///
    /// The deployed revision and pending ones are never purged. `keep == 0`
    /// keeps everything. Returns the purged revision numbers.
    pub async fn purge_history(&self, namespace: &str, name: &str, keep: u32) -> Result<Vec<u32>> {
        if keep == 0 {
            return Ok(Vec::new());
        }
        let history = self.driver.history(namespace, name).await?;
        let excess = history.len().saturating_sub(keep as usize);

        let mut purged = Vec::new();
        for revision in history.iter().filter(|r| !r.is_deployed() && !r.status.is_pending()) {
            if purged.len() == excess {
                break;
            }
            self.driver.delete(namespace, name, revision.revision).await?;
            purged.push(revision.revision);
        }

        if !purged.is_empty() {
            debug!(release = name, namespace, ?purged, "purged old revisions");
        }
        Ok(purged)
    }

    /// Remove a release and its whole history
    pub async fn delete_release(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        self.driver.delete_all(namespace, name).await
    }

    /// Clear what a crashed or cancelled operation left behind
    ///
    /// A held lock is broken when stale, or unconditionally with `force`;
    /// otherwise the release is still busy and this fails. With the lock
    /// gone, every pending revision is marked failed.
    pub async fn recover(&self, namespace: &str, name: &str, force: bool) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let held = match self.driver.read_lock(namespace, name).await {
            Ok(held) => held,
            Err(e) => {
                // Records are published whole, so no live operation owns this one
                warn!(release = name, namespace, error = %e, "removing unreadable release lock");
                self.driver.break_lock(namespace, name).await?;
                report.unreadable_lock = true;
                None
            }
        };
        if let Some(held) = held {
            if !held.is_stale() && !force {
                return Err(KubeError::ConcurrentModification {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    operation: held.operation.to_string(),
                    since: held.acquired_at.to_rfc3339(),
                });
            }
            warn!(
                release = name,
                namespace,
                operation = %held.operation,
                since = %held.acquired_at,
                stale = held.is_stale(),
                "breaking release lock"
            );
            report.broken_lock = self.driver.break_lock(namespace, name).await?;
        }

        for revision in self.driver.history(namespace, name).await? {
            if revision.status.is_pending() {
                let reason = format!("{} interrupted; recovered", revision.status);
                self.set_status(namespace, name, revision.revision, RevisionStatus::failed(reason))
                    .await?;
                report.failed_revisions.push(revision.revision);
            }
        }

        if !report.is_empty() {
            info!(release = name, namespace, failed = ?report.failed_revisions, "recovered release");
        }
        Ok(report)
    }
}
