//! `KubectlCluster` against stub `kubectl` and `helm` scripts.
//!
//! The stubs append their arguments to a call log and print canned output, so
//! these tests check the command lines the harness builds without a cluster.
//! Serialized because freshly written scripts cannot be executed while another
//! test thread is forking.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use harness_test_utils::FixedIds;
use helm_harness::cluster::{ClusterClient, KubectlCluster};
use helm_harness::config::{HarnessConfig, ReleaseOptions};
use helm_harness::context::{Component, DeploymentContext};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Stubs {
    dir: TempDir,
    cluster: KubectlCluster,
    config: Arc<HarnessConfig>,
}

impl Stubs {
    /// `kubectl` and `helm` stubs running `kubectl_body` / `helm_body` after
    /// logging their arguments.
    fn new(kubectl_body: &str, helm_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = write_stub(dir.path(), "kubectl", kubectl_body);
        let helm = write_stub(dir.path(), "helm", helm_body);

        let config = Arc::new(HarnessConfig {
            kubectl: kubectl.display().to_string(),
            helm: helm.display().to_string(),
            charts_dir: PathBuf::from("/charts"),
            results_dir: dir.path().join("results"),
            ..HarnessConfig::default()
        });
        let cluster = KubectlCluster::new(Arc::clone(&config), Arc::new(FixedIds::default()));

        Self {
            dir,
            cluster,
            config,
        }
    }

    fn calls(&self, program: &str) -> Vec<String> {
        fs::read_to_string(self.dir.path().join(format!("{program}.calls")))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let log = dir.join(format!("{name}.calls"));
    fs::write(
        &path,
        format!("#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n", log.display()),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
#[serial]
async fn test_admin_install_sets_replica_count() {
    let stubs = Stubs::new("", "");

    let release = stubs
        .cluster
        .start_administrative_cluster(&ReleaseOptions::default(), 1, "testycsb-abc123")
        .await
        .unwrap();

    assert_eq!(release, "admin-abc123");
    assert_eq!(
        stubs.calls("helm"),
        vec!["install admin-abc123 /charts/admin --namespace testycsb-abc123 --set admin.replicas=1"]
    );
}

#[tokio::test]
#[serial]
async fn test_release_delete_uninstalls_from_namespace() {
    let stubs = Stubs::new("", "");

    stubs
        .cluster
        .delete_release("testycsb-abc123", "ycsb-abc123")
        .await
        .unwrap();

    assert_eq!(
        stubs.calls("helm"),
        vec!["uninstall ycsb-abc123 --namespace testycsb-abc123"]
    );
}

#[tokio::test]
#[serial]
async fn test_failed_command_surfaces_stderr() {
    let stubs = Stubs::new("echo 'namespaces \"x\" already exists' >&2; exit 1", "");

    let err = stubs.cluster.create_namespace("x").await.unwrap_err();

    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
#[serial]
async fn test_scale_targets_replication_controller() {
    let stubs = Stubs::new("", "");

    stubs
        .cluster
        .scale_resource("testycsb-abc123", "ycsb-load", 1)
        .await
        .unwrap();

    assert_eq!(
        stubs.calls("kubectl"),
        vec!["scale replicationcontroller/ycsb-load --replicas=1 --namespace testycsb-abc123"]
    );
}

#[tokio::test]
#[serial]
async fn test_pod_log_is_written_to_results_dir() {
    let stubs = Stubs::new("echo 'Loading workload...'", "");

    stubs
        .cluster
        .stream_pod_log("testycsb-abc123", "ycsb-load-7xk2p", "-ycsb", false)
        .await
        .unwrap();

    let logs: Vec<PathBuf> = fs::read_dir(&stubs.config.results_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("ycsb-load-7xk2p-ycsb-"));
    assert!(name.ends_with(".log"));
    assert_eq!(fs::read_to_string(&logs[0]).unwrap(), "Loading workload...\n");
}

#[tokio::test]
#[serial]
async fn test_keystores_are_copied_and_written_per_file() {
    let stubs = Stubs::new("", "");
    let material = stubs.dir.path().join("tls");
    fs::create_dir_all(&material).unwrap();
    fs::write(material.join("nuoadmin.p12"), b"keystore").unwrap();
    fs::write(material.join(".done"), b"").unwrap();

    stubs
        .cluster
        .store_secrets_in_store("testvault-abc123", "vault-abc123-vault-0", &material)
        .await
        .unwrap();

    let calls = stubs.calls("kubectl");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("cp "));
    assert!(calls[0].ends_with("testvault-abc123/vault-abc123-vault-0:/tmp/nuoadmin.p12"));
    assert_eq!(
        calls[1],
        "exec vault-abc123-vault-0 --namespace testvault-abc123 -- vault kv put secret/testvault-abc123/tls/nuoadmin value=@/tmp/nuoadmin.p12"
    );
}

#[tokio::test]
#[serial]
async fn test_empty_material_directory_is_an_error() {
    let stubs = Stubs::new("", "");
    let material = stubs.dir.path().join("tls");
    fs::create_dir_all(&material).unwrap();

    let result = stubs
        .cluster
        .store_secrets_in_store("testvault-abc123", "vault-abc123-vault-0", &material)
        .await;

    assert!(result.is_err());
}

#[tokio::test]
#[serial]
async fn test_removing_tls_material_twice_is_harmless() {
    let stubs = Stubs::new("", "");
    let material = stubs.dir.path().join("tls");
    fs::create_dir_all(&material).unwrap();
    fs::write(material.join("nuoadmin.p12"), b"keystore").unwrap();

    stubs
        .cluster
        .remove_tls_material("testvault-abc123", &material)
        .await
        .unwrap();
    stubs
        .cluster
        .remove_tls_material("testvault-abc123", &material)
        .await
        .unwrap();

    assert!(!material.exists());
}

#[tokio::test]
#[serial]
async fn test_verify_flags_listed_releases_and_namespace() {
    let stubs = Stubs::new(
        "echo namespace/testycsb-abc123",
        "echo database-abc123; echo unrelated-release",
    );
    let mut context = DeploymentContext::new("testycsb-abc123");
    context.record_release(Component::Admin, "admin-abc123");
    context.record_release(Component::Database, "database-abc123");

    let err = stubs
        .cluster
        .verify_teardown_complete(&context)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("release database-abc123"));
    assert!(!message.contains("admin-abc123"));
    assert!(message.contains("namespace testycsb-abc123"));
}

#[tokio::test]
#[serial]
async fn test_verify_passes_on_clean_cluster() {
    let stubs = Stubs::new("", "echo some-other-release");
    let mut context = DeploymentContext::new("testycsb-abc123");
    context.record_release(Component::Workload, "ycsb-abc123");

    stubs.cluster.verify_teardown_complete(&context).await.unwrap();
}
