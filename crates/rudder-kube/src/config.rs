//! Rudder configuration
//!
//! Stored in `~/.config/rudder/config.yaml`; every field has a default so an
//! absent or partial file is fine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KubeError, Result};
use crate::manifest::ManifestSetBuilder;
use crate::plan::{DriftPolicy, Planner};
use crate::release::DEFAULT_OPERATION_TIMEOUT;
use crate::storage::{CompressionMethod, FileDriver, MemoryDriver, StorageDriver};

/// Where revisions are persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; history is lost on exit
    #[default]
    Memory,
    /// One file per revision under `path`
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RudderConfig {
    pub storage: StorageBackend,

    pub compression: CompressionMethod,

    /// Bound for a whole operation unless the caller passes one
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Revisions kept per release; 0 keeps all
    pub max_history: u32,

    /// Extra attempts for conflicting or transient apply failures
    pub apply_retries: u32,

    /// Fields left to other controllers
    pub drift: DriftPolicy,

    /// Kinds whose removed resources are deleted before anything is applied
    pub delete_first_kinds: Vec<String>,

    /// Custom kinds that are cluster-scoped and never get a namespace
    pub cluster_scoped_kinds: Vec<String>,
}

impl Default for RudderConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::default(),
            compression: CompressionMethod::default(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
            max_history: 10,
            apply_retries: 2,
            drift: DriftPolicy::default(),
            delete_first_kinds: Vec::new(),
            cluster_scoped_kinds: Vec::new(),
        }
    }
}

impl RudderConfig {
    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| KubeError::InvalidConfig {
            message: format!("{}: {}", path.display(), e),
        })
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get default configuration path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| KubeError::InvalidConfig {
            message: "could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("rudder").join("config.yaml"))
    }

    /// Open the configured storage backend
    pub fn driver(&self) -> Result<Arc<dyn StorageDriver>> {
        Ok(match &self.storage {
            StorageBackend::Memory => Arc::new(MemoryDriver::new()),
            StorageBackend::File { path } => Arc::new(FileDriver::new(path.clone(), self.compression)?),
        })
    }

    /// Planner honoring the drift policy and delete-first kinds
    pub fn planner(&self) -> Planner {
        self.delete_first_kinds
            .iter()
            .fold(Planner::new().with_drift_policy(self.drift.clone()), |planner, kind| {
                planner.delete_first_kind(kind.clone())
            })
    }

    /// Manifest builder for `namespace` knowing the custom cluster-scoped kinds
    pub fn manifest_builder(&self, namespace: &str) -> ManifestSetBuilder {
        self.cluster_scoped_kinds
            .iter()
            .fold(ManifestSetBuilder::new(namespace), |builder, kind| {
                builder.cluster_scoped_kind(kind.clone())
            })
    }
}
