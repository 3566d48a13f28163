//! Action options for install, upgrade, rollback and uninstall, plus the
//! deadline and cancellation shared by every cluster-facing step

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{KubeError, Result};

/// Cooperative cancellation for an in-flight operation
///
/// Clones share state; cancelling any clone cancels them all.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { state: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as self, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Time and cancellation bounds of one operation
#[derive(Debug, Clone)]
pub(crate) struct Budget {
    release: String,
    deadline: Instant,
    cancel: Option<CancelToken>,
}

impl Budget {
    pub(crate) fn new(release: &str, timeout: Duration, cancel: Option<CancelToken>) -> Self {
        Self {
            release: release.to_string(),
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn cancelled_error(&self) -> KubeError {
        KubeError::Cancelled {
            name: self.release.clone(),
        }
    }

    /// Run `fut` within the remaining budget, optionally tightened by `limit`
    pub(crate) async fn run<T, F>(&self, what: impl Display, limit: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let bound = match limit {
            Some(limit) => limit.min(self.remaining()),
            None => self.remaining(),
        };
        let timeout = || KubeError::Timeout {
            what: what.to_string(),
            after: bound,
        };
        if bound.is_zero() {
            return Err(timeout());
        }

        let bounded = tokio::time::timeout(bound, fut);
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(self.cancelled_error()),
                result = bounded => result.unwrap_or_else(|_| Err(timeout())),
            },
            None => bounded.await.unwrap_or_else(|_| Err(timeout())),
        }
    }
}

/// Options for install operation
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Bound for the whole operation; the configured default when unset
    pub timeout: Option<Duration>,

    /// Roll back automatically on failure
    pub atomic: bool,

    /// Skip hook execution
    pub no_hooks: bool,

    /// Compute the plan without touching the store or the cluster
    pub dry_run: bool,

    /// Revisions to keep; the configured default when unset
    pub max_history: Option<u32>,

    /// Description for this release
    pub description: Option<String>,

    pub cancel: Option<CancelToken>,
}

impl InstallOptions {
    /// Create default install options with name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable atomic mode (auto-rollback on failure)
    pub fn with_atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.no_hooks = true;
        self
    }

    /// Enable dry-run mode
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_history(mut self, max: u32) -> Self {
        self.max_history = Some(max);
        self
    }
}

/// Options for upgrade operation
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    pub timeout: Option<Duration>,

    /// Automatically rollback on failure
    pub atomic: bool,

    pub no_hooks: bool,

    /// Dry run mode
    pub dry_run: bool,

    /// Reset values to package defaults plus the new overrides (the default)
    pub reset_values: bool,

    /// Layer the new overrides on top of the previous revision's values
    pub reuse_values: bool,

    pub max_history: Option<u32>,

    pub description: Option<String>,

    pub cancel: Option<CancelToken>,
}

impl UpgradeOptions {
    /// Create default upgrade options with name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable atomic mode (auto-rollback on failure)
    pub fn with_atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.no_hooks = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn reuse_values(mut self) -> Self {
        self.reuse_values = true;
        self.reset_values = false;
        self
    }

    pub fn reset_values(mut self) -> Self {
        self.reset_values = true;
        self.reuse_values = false;
        self
    }

    pub fn with_max_history(mut self, max: u32) -> Self {
        self.max_history = Some(max);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Options for uninstall operation
#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    pub timeout: Option<Duration>,

    pub no_hooks: bool,

    /// Keep release history (marks it uninstalled instead of deleting it)
    pub keep_history: bool,

    pub dry_run: bool,

    pub description: Option<String>,

    pub cancel: Option<CancelToken>,
}

impl UninstallOptions {
    /// Create default uninstall options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Keep release history
    pub fn keep_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.no_hooks = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Options for rollback operation
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Target revision; 0 means the one before the latest
    pub revision: u32,

    pub timeout: Option<Duration>,

    pub no_hooks: bool,

    pub dry_run: bool,

    pub max_history: Option<u32>,

    pub description: Option<String>,

    pub cancel: Option<CancelToken>,
}

impl RollbackOptions {
    /// Create default rollback options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Set target revision
    pub fn to_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.no_hooks = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_max_history(mut self, max: u32) -> Self {
        self.max_history = Some(max);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_options_builder() {
        let opts = InstallOptions::new("myapp", "default")
            .with_atomic()
            .with_timeout(Duration::from_secs(60))
            .dry_run();

        assert_eq!(opts.name, "myapp");
        assert_eq!(opts.namespace, "default");
        assert!(opts.atomic);
        assert!(opts.dry_run);
        assert_eq!(opts.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_upgrade_values_modes_are_exclusive() {
        let opts = UpgradeOptions::new("myapp", "default")
            .reuse_values()
            .reset_values();
        assert!(opts.reset_values);
        assert!(!opts.reuse_values);
    }

    #[test]
    fn test_rollback_options() {
        let opts = RollbackOptions::new("myapp", "default").to_revision(3);
        assert_eq!(opts.revision, 3);
        assert!(!UninstallOptions::new("myapp", "default").keep_history().dry_run);
    }

    #[test]
    fn test_every_operation_takes_description_and_cancel() {
        let token = CancelToken::new();
        let uninstall = UninstallOptions::new("myapp", "default")
            .with_description("retired")
            .with_cancel(token.clone());
        assert_eq!(uninstall.description.as_deref(), Some("retired"));
        token.cancel();
        assert!(uninstall.cancel.as_ref().is_some_and(CancelToken::is_cancelled));

        let rollback = RollbackOptions::new("myapp", "default")
            .with_description("back to 2")
            .with_cancel(CancelToken::new())
            .with_max_history(3);
        assert_eq!(rollback.description.as_deref(), Some("back to 2"));
        assert!(rollback.cancel.is_some());
        assert_eq!(rollback.max_history, Some(3));

        let upgrade = UpgradeOptions::new("myapp", "default").with_description("bump");
        assert_eq!(upgrade.description.as_deref(), Some("bump"));
        assert_eq!(InstallOptions::new("myapp", "default").with_max_history(5).max_history, Some(5));
    }

    #[tokio::test]
    async fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn test_budget_times_out() {
        let budget = Budget::new("web", Duration::from_millis(20), None);
        let result: Result<()> = budget
            .run("hook job", None, async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(KubeError::Timeout { ref what, .. }) if what == "hook job"));
    }

    #[tokio::test]
    async fn test_budget_observes_cancellation() {
        let token = CancelToken::new();
        let budget = Budget::new("web", Duration::from_secs(60), Some(token.clone()));

        let waiting = budget.run("apply", None, async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let (result, ()) = tokio::join!(waiting, async { token.cancel() });

        assert!(matches!(result, Err(KubeError::Cancelled { .. })));
    }
}
