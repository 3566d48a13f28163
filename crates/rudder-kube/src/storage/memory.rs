//! In-memory storage driver
//!
//! Revisions live in process memory; clones share the same store. Used by
//! tests and by callers that need no persistence.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{LockRecord, StorageDriver, release_not_found, revision_not_found};
use crate::error::{KubeError, Result};
use crate::release::Revision;

type ReleaseKey = (String, String);

#[derive(Debug, Default)]
struct Store {
    revisions: BTreeMap<ReleaseKey, BTreeMap<u32, Revision>>,
    locks: BTreeMap<ReleaseKey, LockRecord>,
    operations: OperationCounts,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub locks: usize,
}

/// In-memory storage driver
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<Mutex<Store>>,
}

fn key(namespace: &str, name: &str) -> ReleaseKey {
    (namespace.to_string(), name.to_string())
}

impl MemoryDriver {
    /// Create a new empty driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated revisions
    pub fn with_revisions(revisions: impl IntoIterator<Item = Revision>) -> Self {
        let driver = Self::new();
        {
            let mut store = driver.store();
            for revision in revisions {
                store
                    .revisions
                    .entry(key(&revision.namespace, &revision.name))
                    .or_default()
                    .insert(revision.revision, revision);
            }
        }
        driver
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.store().operations.clone()
    }

    /// Count stored revisions across all releases
    pub fn revision_count(&self) -> usize {
        self.store().revisions.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn get(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        let mut store = self.store();
        store.operations.gets += 1;
        store
            .revisions
            .get(&key(namespace, name))
            .and_then(|revs| revs.get(&revision))
            .cloned()
            .ok_or_else(|| revision_not_found(namespace, name, revision))
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<Revision> {
        let mut store = self.store();
        store.operations.gets += 1;
        store
            .revisions
            .get(&key(namespace, name))
            .and_then(|revs| revs.values().next_back())
            .cloned()
            .ok_or_else(|| release_not_found(namespace, name))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        let mut store = self.store();
        store.operations.lists += 1;
        Ok(store
            .revisions
            .get(&key(namespace, name))
            .map(|revs| revs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Revision>> {
        let mut store = self.store();
        store.operations.lists += 1;
        Ok(store
            .revisions
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|n| n == ns))
            .filter_map(|(_, revs)| revs.values().next_back().cloned())
            .collect())
    }

    async fn create(&self, revision: &Revision) -> Result<()> {
        let mut store = self.store();
        store.operations.creates += 1;
        let revisions = store
            .revisions
            .entry(key(&revision.namespace, &revision.name))
            .or_default();
        if revisions.contains_key(&revision.revision) {
            return Err(KubeError::Storage(format!(
                "revision {} of release '{}' already exists",
                revision.revision, revision.name
            )));
        }
        revisions.insert(revision.revision, revision.clone());
        Ok(())
    }

    async fn update(&self, revision: &Revision) -> Result<()> {
        let mut store = self.store();
        store.operations.updates += 1;
        let slot = store
            .revisions
            .get_mut(&key(&revision.namespace, &revision.name))
            .and_then(|revs| revs.get_mut(&revision.revision))
            .ok_or_else(|| revision_not_found(&revision.namespace, &revision.name, revision.revision))?;
        *slot = revision.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<Revision> {
        let mut store = self.store();
        store.operations.deletes += 1;
        let release = key(namespace, name);
        let removed = store
            .revisions
            .get_mut(&release)
            .and_then(|revs| revs.remove(&revision))
            .ok_or_else(|| revision_not_found(namespace, name, revision))?;
        if store.revisions.get(&release).is_some_and(BTreeMap::is_empty) {
            store.revisions.remove(&release);
        }
        Ok(removed)
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<Revision>> {
        let mut store = self.store();
        store.operations.deletes += 1;
        Ok(store
            .revisions
            .remove(&key(namespace, name))
            .map(|revs| revs.into_values().collect())
            .unwrap_or_default())
    }

    async fn try_lock(&self, namespace: &str, name: &str, lock: &LockRecord) -> Result<bool> {
        let mut store = self.store();
        store.operations.locks += 1;
        let release = key(namespace, name);
        if store.locks.contains_key(&release) {
            return Ok(false);
        }
        store.locks.insert(release, lock.clone());
        Ok(true)
    }

    async fn unlock(&self, namespace: &str, name: &str, token: &str) -> Result<bool> {
        let mut store = self.store();
        let release = key(namespace, name);
        if store.locks.get(&release).is_some_and(|l| l.token == token) {
            store.locks.remove(&release);
            return Ok(true);
        }
        Ok(false)
    }

    async fn read_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>> {
        Ok(self.store().locks.get(&key(namespace, name)).cloned())
    }

    async fn break_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>> {
        Ok(self.store().locks.remove(&key(namespace, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::test_revision;
    use rudder_core::Operation;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_get_and_history() {
        let driver = MemoryDriver::new();
        for v in [2, 1, 3] {
            driver.create(&test_revision("web", v)).await.unwrap();
        }

        assert_eq!(driver.get_latest("default", "web").await.unwrap().revision, 3);
        let numbers: Vec<u32> = driver
            .history("default", "web")
            .await
            .unwrap()
            .iter()
            .map(|r| r.revision)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        assert!(driver.create(&test_revision("web", 2)).await.is_err());
        assert!(matches!(
            driver.get("default", "web", 9).await,
            Err(KubeError::RevisionNotFound { revision: 9, .. })
        ));
        assert!(driver.history("default", "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_latest_per_release() {
        let driver = MemoryDriver::with_revisions([
            test_revision("a", 1),
            test_revision("a", 2),
            test_revision("b", 1),
        ]);

        let latest = driver.list(Some("default")).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].revision, 2);
        assert!(driver.list(Some("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let driver = MemoryDriver::new();
        let first = LockRecord::new(Operation::Install, "one", Duration::from_secs(60));
        let second = LockRecord::new(Operation::Upgrade, "two", Duration::from_secs(60));

        assert!(driver.try_lock("default", "web", &first).await.unwrap());
        assert!(!driver.try_lock("default", "web", &second).await.unwrap());
        assert!(driver.try_lock("default", "api", &second).await.unwrap());

        assert!(!driver.unlock("default", "web", "two").await.unwrap());
        assert!(driver.unlock("default", "web", "one").await.unwrap());
        assert!(driver.read_lock("default", "web").await.unwrap().is_none());

        assert_eq!(driver.break_lock("default", "api").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_delete_counts() {
        let driver = MemoryDriver::with_revisions([test_revision("web", 1), test_revision("web", 2)]);
        driver.delete("default", "web", 1).await.unwrap();
        assert_eq!(driver.revision_count(), 1);
        assert_eq!(driver.delete_all("default", "web").await.unwrap().len(), 1);
        assert_eq!(driver.operation_counts().deletes, 2);
        assert!(!driver.exists("default", "web").await.unwrap());
    }
}
