//! Integration tests for the release lifecycle

use std::sync::Arc;
use std::time::Duration;

use rudder_core::{Operation, Package, UserOverrides, Values};
use rudder_kube::{
    CancelToken, ClusterError, CompressionMethod, FileDriver, HookBehavior, InMemoryCluster,
    InstallOptions, KubeError, MemoryDriver, NewRevision, OperationPhase, OperationRecord, Orchestrator,
    PlanAction, ReleaseStore, ResourceId, RevisionStatus, RollbackOptions, StorageDriver, UninstallOptions,
    UpgradeOptions,
};
use semver::Version;
use serde_json::json;
use tokio::sync::{Barrier, Notify};

const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release.name }}
spec:
  replicas: {{ values.replicas }}
"#;

const SERVICE: &str = r#"{% if values.service %}apiVersion: v1
kind: Service
metadata:
  name: {{ release.name }}
spec:
  ports:
    - port: 80
{% endif %}"#;

const SETUP_HOOK: &str = r#"{% if values.setupHook %}apiVersion: batch/v1
kind: Job
metadata:
  name: {{ release.name }}-setup
  annotations:
    rudder.io/hook: pre-install,pre-upgrade
{% endif %}"#;

/// Package rendering a deployment, an optional service and an optional hook
fn web_package(version: &str) -> Package {
    Package::builder("web", Version::parse(version).unwrap())
        .values(Values::from_yaml("replicas: 1\nservice: false\nsetupHook: false").unwrap())
        .template("templates/deployment.yaml", DEPLOYMENT)
        .template("templates/service.yaml", SERVICE)
        .template("templates/setup.yaml", SETUP_HOOK)
        .build()
}

fn set(expr: &str) -> UserOverrides {
    UserOverrides::new().set(expr)
}

fn memory_orchestrator() -> (Orchestrator<MemoryDriver, InMemoryCluster>, InMemoryCluster) {
    let cluster = InMemoryCluster::new();
    let orch = Orchestrator::new(ReleaseStore::new(MemoryDriver::new()), cluster.clone());
    (orch, cluster)
}

fn deployment(name: &str) -> ResourceId {
    ResourceId::new("apps", "Deployment", Some("default"), name)
}

fn service(name: &str) -> ResourceId {
    ResourceId::new("", "Service", Some("default"), name)
}

fn reject_deployment(cluster: &InMemoryCluster, name: &str) {
    cluster.fail_apply(
        deployment(name),
        ClusterError::Rejected {
            resource: deployment(name).to_string(),
            message: "admission webhook denied the request".to_string(),
        },
        1,
    );
}

/// Installs `web`, then fails a non-atomic upgrade after its service was created
async fn install_then_fail_upgrade(orch: &Orchestrator<MemoryDriver, InMemoryCluster>, cluster: &InMemoryCluster) {
    let pkg = web_package("1.0.0");
    orch.install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
        .await
        .unwrap();
    reject_deployment(cluster, "web");

    let err = orch
        .upgrade(
            &pkg,
            &set("replicas=2").set("service=true"),
            &UpgradeOptions::new("web", "default"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KubeError::Apply { .. }));
    assert!(cluster.contains(&service("web")));
}

async fn statuses<S: StorageDriver>(orch: &Orchestrator<S, InMemoryCluster>, name: &str) -> Vec<String> {
    orch.history("default", name)
        .await
        .unwrap()
        .iter()
        .map(|r| r.status.to_string())
        .collect()
}

mod install_and_upgrade {
    use super::*;

    #[tokio::test]
    async fn test_install_then_upgrade() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");

        let installed = orch
            .install(&pkg, &set("replicas=3"), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(installed.revision, 1);
        assert_eq!(installed.plan.count(PlanAction::Create), 1);
        assert_eq!(cluster.object(&deployment("web")).unwrap()["spec"]["replicas"], 3);

        let upgraded = orch
            .upgrade(&pkg, &set("replicas=1"), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(upgraded.revision, 2);
        let entry = upgraded.plan.entry(&deployment("web")).unwrap();
        assert_eq!(entry.action, PlanAction::Update);
        assert!(entry.unified_diff().contains("-  replicas: 3"));
        assert_eq!(cluster.object(&deployment("web")).unwrap()["spec"]["replicas"], 1);

        assert_eq!(statuses(&orch, "web").await, vec!["superseded", "deployed"]);
    }

    #[tokio::test]
    async fn test_upgrade_removes_dropped_resources() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &set("service=true"), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        assert!(cluster.contains(&service("web")));

        let report = orch
            .upgrade(&pkg, &UserOverrides::new(), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(report.plan.count(PlanAction::Delete), 1);
        assert!(!cluster.contains(&service("web")));
        assert!(cluster.contains(&deployment("web")));
    }

    #[tokio::test]
    async fn test_upgrade_keeps_fields_owned_by_other_controllers() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
            .await
            .unwrap();

        // A rollout controller annotates the deployment and sets a field the package never does
        let mut live = cluster.object(&deployment("web")).unwrap();
        live["metadata"]["annotations"] = json!({"rollout.example.io/revision": "7"});
        live["spec"]["minReadySeconds"] = json!(15);
        cluster.insert(live);

        let report = orch
            .upgrade(&pkg, &set("replicas=4"), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        let entry = report.plan.entry(&deployment("web")).unwrap();
        assert_eq!(entry.patch, Some(json!({"spec": {"replicas": 4}})));

        let after = cluster.object(&deployment("web")).unwrap();
        assert_eq!(after["spec"]["replicas"], 4);
        assert_eq!(after["spec"]["minReadySeconds"], 15);
        assert_eq!(after["metadata"]["annotations"]["rollout.example.io/revision"], "7");

        let writes: Vec<OperationRecord> = cluster
            .operations()
            .into_iter()
            .filter(|op| op.is_mutation())
            .collect();
        assert_eq!(
            writes,
            vec![
                OperationRecord::Apply(deployment("web")),
                OperationRecord::Patch(deployment("web")),
            ]
        );
    }

    #[tokio::test]
    async fn test_upgrade_after_failed_upgrade_removes_its_leftovers() {
        let (orch, cluster) = memory_orchestrator();
        install_then_fail_upgrade(&orch, &cluster).await;

        let report = orch
            .upgrade(&web_package("1.0.0"), &UserOverrides::new(), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(report.plan.count(PlanAction::Delete), 1);
        assert!(!cluster.contains(&service("web")));
        assert!(cluster.contains(&deployment("web")));
    }

    #[tokio::test]
    async fn test_upgrade_of_unknown_release() {
        let (orch, _) = memory_orchestrator();
        let err = orch
            .upgrade(&web_package("1.0.0"), &UserOverrides::new(), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::ReleaseNotFound { .. }));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (orch, _) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        for replicas in 2..=5 {
            orch.upgrade(
                &pkg,
                &set(&format!("replicas={}", replicas)),
                &UpgradeOptions::new("web", "default").with_max_history(2),
            )
            .await
            .unwrap();
        }

        let numbers: Vec<u32> = orch
            .history("default", "web")
            .await
            .unwrap()
            .iter()
            .map(|r| r.revision)
            .collect();
        assert_eq!(numbers, vec![4, 5]);
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_atomic_upgrade_with_failing_hook_rolls_back() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &set("replicas=2"), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        cluster.script_hook("web-setup", HookBehavior::Fail("migration failed".to_string()));

        let err = orch
            .upgrade(
                &pkg,
                &UserOverrides::new().set("replicas=4").set("setupHook=true"),
                &UpgradeOptions::new("web", "default").with_atomic(),
            )
            .await
            .unwrap_err();

        let KubeError::RolledBack { revision, cause, .. } = err else {
            panic!("expected rolled back error, got {:?}", err);
        };
        assert_eq!(revision, 2);
        assert!(matches!(*cause, KubeError::HookFailed { ref message, .. } if message == "migration failed"));

        assert_eq!(statuses(&orch, "web").await[0], "deployed");
        assert!(orch.history("default", "web").await.unwrap()[1].status.to_string().starts_with("failed"));
        assert_eq!(cluster.object(&deployment("web")).unwrap()["spec"]["replicas"], 2);
    }

    #[tokio::test]
    async fn test_atomic_upgrade_reverts_partial_apply() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        cluster.fail_apply(
            deployment("web"),
            ClusterError::Rejected {
                resource: deployment("web").to_string(),
                message: "admission webhook denied the request".to_string(),
            },
            5,
        );

        let err = orch
            .upgrade(
                &pkg,
                &UserOverrides::new().set("replicas=9").set("service=true"),
                &UpgradeOptions::new("web", "default").with_atomic(),
            )
            .await
            .unwrap_err();

        let KubeError::RolledBack { cause, .. } = err else {
            panic!("expected rolled back error, got {:?}", err);
        };
        let KubeError::Apply { progress, .. } = *cause else {
            panic!("expected apply error");
        };
        // Services are applied before workloads
        assert_eq!(progress.applied, vec![service("web")]);
        assert!(progress.remaining.is_empty());

        assert!(!cluster.contains(&service("web")));
        assert_eq!(cluster.object(&deployment("web")).unwrap()["spec"]["replicas"], 1);
    }

    #[tokio::test]
    async fn test_atomic_install_failure_removes_everything() {
        let (orch, cluster) = memory_orchestrator();
        cluster.fail_apply(
            deployment("web"),
            ClusterError::Rejected {
                resource: deployment("web").to_string(),
                message: "quota exceeded".to_string(),
            },
            5,
        );

        let err = orch
            .install(
                &web_package("1.0.0"),
                &set("service=true"),
                &InstallOptions::new("web", "default").with_atomic(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, KubeError::RolledBack { revision: 1, .. }));
        assert!(cluster.ids().is_empty());
        let history = orch.history("default", "web").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0].status, RevisionStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_revision_numbers_keep_increasing_through_failures() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
            .await
            .unwrap();

        cluster.script_hook("web-setup", HookBehavior::Fail("boom".to_string()));
        let failed = orch
            .upgrade(&pkg, &set("setupHook=true"), &UpgradeOptions::new("web", "default"))
            .await;
        assert!(failed.is_err());

        cluster.script_hook("web-setup", HookBehavior::Succeed);
        let report = orch
            .upgrade(&pkg, &set("setupHook=true"), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(report.revision, 3);
        assert_eq!(report.hooks.len(), 1);
        assert_eq!(statuses(&orch, "web").await.len(), 3);
        assert_eq!(statuses(&orch, "web").await[2], "deployed");
    }

    #[tokio::test]
    async fn test_hook_timeout_fails_revision() {
        let (orch, cluster) = memory_orchestrator();
        cluster.script_hook("web-setup", HookBehavior::Hang);

        let err = orch
            .install(
                &web_package("1.0.0"),
                &set("setupHook=true"),
                &InstallOptions::new("web", "default").with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, KubeError::Timeout { .. }));
        assert!(!cluster.contains(&deployment("web")));
        let latest = orch.status("default", "web").await.unwrap();
        assert!(matches!(latest.status, RevisionStatus::Failed { .. }));
        assert!(orch.store().driver().read_lock("default", "web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_operation_is_not_rolled_back() {
        let (orch, cluster) = memory_orchestrator();
        cluster.script_hook("web-setup", HookBehavior::Hang);
        let token = CancelToken::new();

        let pkg = web_package("1.0.0");
        let overrides = set("setupHook=true");
        let opts = InstallOptions::new("web", "default")
            .with_atomic()
            .with_cancel(token.clone());
        let install = orch.install(&pkg, &overrides, &opts);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(install, cancel);

        assert!(matches!(result, Err(KubeError::Cancelled { .. })));
        let latest = orch.status("default", "web").await.unwrap();
        assert!(matches!(latest.status, RevisionStatus::Failed { .. }));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_same_release_second_operation_fails_fast() {
        let (orch, cluster) = memory_orchestrator();
        let release_hook = Arc::new(Notify::new());
        cluster.script_hook("web-setup", HookBehavior::WaitFor(release_hook.clone()));
        let pkg = web_package("1.0.0");

        let first_overrides = set("setupHook=true");
        let first_opts = InstallOptions::new("web", "default");
        let first = orch.install(&pkg, &first_overrides, &first_opts);
        let second = async {
            let result = orch
                .install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
                .await;
            release_hook.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().outcome, OperationPhase::Deployed);
        let err = second.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, KubeError::ConcurrentModification { ref operation, .. } if operation == "install"));
        assert_eq!(orch.history("default", "web").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_releases_run_concurrently() {
        let (orch, cluster) = memory_orchestrator();
        // Each hook waits for the other, so serialised operations would hang
        let barrier = Arc::new(Barrier::new(2));
        cluster.script_hook("a-setup", HookBehavior::Barrier(barrier.clone()));
        cluster.script_hook("b-setup", HookBehavior::Barrier(barrier));
        let pkg = web_package("1.0.0");

        let overrides = set("setupHook=true");
        let opts_a = InstallOptions::new("a", "default");
        let opts_b = InstallOptions::new("b", "default");
        let both = async {
            tokio::join!(
                orch.install(&pkg, &overrides, &opts_a),
                orch.install(&pkg, &overrides, &opts_b),
            )
        };
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), both).await.unwrap();

        assert_eq!(a.unwrap().revision, 1);
        assert_eq!(b.unwrap().revision, 1);
        assert!(cluster.contains(&deployment("a")));
        assert!(cluster.contains(&deployment("b")));
    }

    #[tokio::test]
    async fn test_recover_after_crash() {
        let (orch, _) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
            .await
            .unwrap();

        // A process that died mid-upgrade: lock held, revision pending
        let store = orch.store();
        let lock = store
            .lock("default", "web", Operation::Upgrade, Duration::from_secs(600))
            .await
            .unwrap();
        let latest = store.latest("default", "web").await.unwrap();
        store
            .create_revision(
                &lock,
                NewRevision {
                    package: latest.package.clone(),
                    config: latest.config.clone(),
                    user_config: latest.user_config.clone(),
                    manifest: latest.manifest.clone(),
                    notes: None,
                    description: None,
                },
            )
            .await
            .unwrap();
        drop(lock);

        let busy = orch
            .upgrade(&pkg, &UserOverrides::new(), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap_err();
        assert!(matches!(busy, KubeError::ConcurrentModification { .. }));
        assert!(orch.recover("default", "web", false).await.is_err());

        let report = orch.recover("default", "web", true).await.unwrap();
        assert!(report.broken_lock.is_some());
        assert_eq!(report.failed_revisions, vec![2]);

        let upgraded = orch
            .upgrade(&pkg, &set("replicas=2"), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(upgraded.revision, 3);
    }
}

mod rollback_and_uninstall {
    use super::*;

    #[tokio::test]
    async fn test_rollback_to_specific_revision() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &set("replicas=1"), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        orch.upgrade(&web_package("1.1.0"), &set("replicas=2"), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();
        orch.upgrade(&web_package("1.2.0"), &set("replicas=3"), &UpgradeOptions::new("web", "default"))
            .await
            .unwrap();

        let report = orch
            .rollback(&RollbackOptions::new("web", "default").to_revision(1))
            .await
            .unwrap();
        assert_eq!(report.revision, 4);
        assert_eq!(cluster.object(&deployment("web")).unwrap()["spec"]["replicas"], 1);

        let latest = orch.status("default", "web").await.unwrap();
        assert_eq!(latest.package.version, Version::new(1, 0, 0));
        assert_eq!(latest.description.as_deref(), Some("Rollback to 1"));
    }

    #[tokio::test]
    async fn test_rollback_removes_leftovers_of_failed_upgrade() {
        let (orch, cluster) = memory_orchestrator();
        install_then_fail_upgrade(&orch, &cluster).await;

        let report = orch
            .rollback(&RollbackOptions::new("web", "default").to_revision(1))
            .await
            .unwrap();
        assert_eq!(report.revision, 3);
        assert_eq!(report.plan.count(PlanAction::Delete), 1);
        assert!(!cluster.contains(&service("web")));
        assert_eq!(cluster.object(&deployment("web")).unwrap()["spec"]["replicas"], 1);
        assert_eq!(statuses(&orch, "web").await[2], "deployed");
    }

    #[tokio::test]
    async fn test_uninstall_after_failed_upgrade_removes_everything() {
        let (orch, cluster) = memory_orchestrator();
        install_then_fail_upgrade(&orch, &cluster).await;

        let cancel = CancelToken::new();
        orch.uninstall(
            &UninstallOptions::new("web", "default")
                .keep_history()
                .with_description("retired")
                .with_cancel(cancel),
        )
        .await
        .unwrap();
        assert!(cluster.ids().is_empty());

        let history = orch.history("default", "web").await.unwrap();
        let uninstalled = history.iter().find(|r| r.status == RevisionStatus::Uninstalled).unwrap();
        assert_eq!(uninstalled.description.as_deref(), Some("retired"));
    }

    #[tokio::test]
    async fn test_uninstall_keeps_history_then_reinstall() {
        let (orch, cluster) = memory_orchestrator();
        let pkg = web_package("1.0.0");
        orch.install(&pkg, &set("service=true"), &InstallOptions::new("web", "default"))
            .await
            .unwrap();

        let report = orch
            .uninstall(&UninstallOptions::new("web", "default").keep_history())
            .await
            .unwrap();
        assert_eq!(report.outcome, OperationPhase::Uninstalled);
        assert!(cluster.ids().is_empty());
        assert_eq!(statuses(&orch, "web").await, vec!["uninstalled"]);

        let reinstalled = orch
            .install(&pkg, &UserOverrides::new(), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        assert_eq!(reinstalled.revision, 2);
    }
}

mod file_storage {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_history_survives_new_orchestrator() {
        let tmp = TempDir::new().unwrap();
        let cluster = InMemoryCluster::new();
        let pkg = web_package("1.0.0");

        let driver = FileDriver::new(tmp.path(), CompressionMethod::default()).unwrap();
        let orch = Orchestrator::new(ReleaseStore::new(driver), cluster.clone());
        orch.install(&pkg, &set("replicas=2"), &InstallOptions::new("web", "default"))
            .await
            .unwrap();
        drop(orch);

        let driver = FileDriver::new(tmp.path(), CompressionMethod::default()).unwrap();
        let orch = Orchestrator::new(ReleaseStore::new(driver), cluster.clone());
        let report = orch
            .upgrade(&pkg, &UserOverrides::new(), &UpgradeOptions::new("web", "default").reuse_values())
            .await
            .unwrap();

        assert_eq!(report.revision, 2);
        assert_eq!(report.plan.count(PlanAction::Unchanged), 1);
        assert_eq!(statuses(&orch, "web").await, vec!["superseded", "deployed"]);
    }
}
