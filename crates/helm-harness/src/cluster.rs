//! Cluster collaborator.
//!
//! [`ClusterClient`] is the narrow surface the sequencer drives: chart
//! installs, scale requests, replica counts, secret store operations and the
//! matching deletes used by teardown. [`KubectlCluster`] implements it by
//! shelling out to `kubectl` and `helm` against the current kube context.

use crate::config::{HarnessConfig, ReleaseOptions};
use crate::context::{Component, DeploymentContext};
use crate::errors::HarnessError;
use crate::eventual::{await_condition, WaitCategory};
use crate::ids::IdGenerator;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Namespace holding the cluster's own system pods.
const SYSTEM_NAMESPACE: &str = "kube-system";

/// Kind used when a scale target is given without one.
const DEFAULT_SCALE_KIND: &str = "replicationcontroller";

/// Database name created by the database chart.
const DATABASE_NAME: &str = "demo";

/// Directory inside the key generation pod that receives the keystores.
const KEYGEN_DIR: &str = "/tmp/keys";

/// Marker written once the key generation commands have finished.
const KEYGEN_DONE_MARKER: &str = "/tmp/keys/.done";

/// Vault policy granting read access to the stored keystores.
const VAULT_POLICY: &str = "nuodb-policy";

/// Operations the harness needs from the cluster.
///
/// Provisioning calls return the release name they installed so the caller can
/// register the matching delete. Count operations may fail while a resource is
/// not yet visible; callers poll them through
/// [`await_condition`](crate::eventual::await_condition).
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Block until the cluster's own system pods are ready.
    async fn await_baseline_cluster_readiness(&self) -> Result<(), HarnessError>;

    async fn create_namespace(&self, name: &str) -> Result<(), HarnessError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), HarnessError>;

    /// Install the admin tier with `node_count` admin pods.
    async fn start_administrative_cluster(
        &self,
        options: &ReleaseOptions,
        node_count: u32,
        namespace: &str,
    ) -> Result<String, HarnessError>;

    /// Install a database whose engines register with `admin_pod`.
    async fn start_database(
        &self,
        namespace: &str,
        admin_pod: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError>;

    /// Install the YCSB workload generator.
    async fn start_workload_generator(
        &self,
        namespace: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError>;

    async fn delete_release(&self, namespace: &str, release: &str) -> Result<(), HarnessError>;

    async fn scale_resource(
        &self,
        namespace: &str,
        resource: &str,
        replicas: u32,
    ) -> Result<(), HarnessError>;

    /// Pods of `resource` that have been placed on a node.
    async fn count_scheduled_replicas(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<u32, HarnessError>;

    /// Pods of `resource` passing their readiness probe.
    async fn count_ready_replicas(&self, namespace: &str, resource: &str)
        -> Result<u32, HarnessError>;

    /// Name of a pod belonging to `resource`.
    async fn pod_name(&self, namespace: &str, resource: &str) -> Result<String, HarnessError>;

    /// Stream the log of `pod` until it exits (or forever with `follow`).
    /// `label` distinguishes the captured log from others of the same pod.
    async fn stream_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        label: &str,
        follow: bool,
    ) -> Result<(), HarnessError>;

    /// Install the secret store.
    async fn start_secret_store(
        &self,
        options: &ReleaseOptions,
        namespace: &str,
    ) -> Result<String, HarnessError>;

    async fn initialize_secret_store(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<(), HarnessError>;

    /// Let workloads authenticate to the store with their service account.
    async fn bind_secret_store_to_cluster_identity(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<(), HarnessError>;

    /// Run `commands` in a throwaway pod and copy the keystores it produced to
    /// a local directory, returning that directory.
    async fn generate_tls_material(
        &self,
        namespace: &str,
        commands: &[String],
    ) -> Result<PathBuf, HarnessError>;

    async fn store_secrets_in_store(
        &self,
        namespace: &str,
        instance: &str,
        location: &Path,
    ) -> Result<(), HarnessError>;

    async fn remove_tls_material(&self, namespace: &str, location: &Path)
        -> Result<(), HarnessError>;

    /// Fail if any namespace or release recorded in `context` still exists.
    async fn verify_teardown_complete(&self, context: &DeploymentContext)
        -> Result<(), HarnessError>;
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    name: String,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Deserialize)]
struct OwnerReference {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl Pod {
    fn has_condition(&self, kind: &str) -> bool {
        self.status
            .conditions
            .iter()
            .any(|condition| condition.kind == kind && condition.status == "True")
    }

    fn is_completed(&self) -> bool {
        self.status.phase.as_deref() == Some("Succeeded")
    }

    /// A pod belongs to the controller that owns it. Without owner references
    /// the name must be `<resource>-<ordinal or random suffix>`, so pods of a
    /// sibling workload sharing the prefix (e.g. `<resource>-agent-injector-*`)
    /// are not counted.
    fn belongs_to(&self, resource: &str) -> bool {
        let owners = &self.metadata.owner_references;
        if !owners.is_empty() {
            return owners.iter().any(|owner| owner.name == resource);
        }
        self.metadata
            .name
            .strip_prefix(resource)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|suffix| !suffix.is_empty() && !suffix.contains('-'))
    }
}

/// Count pods of `resource` in `kubectl get pods -o json` output whose
/// `condition` (e.g. `PodScheduled`, `Ready`) is `True`.
pub fn count_pods_with_condition(
    pods_json: &str,
    resource: &str,
    condition: &str,
) -> Result<u32, HarnessError> {
    let pods: PodList = serde_json::from_str(pods_json)?;
    let count = pods
        .items
        .iter()
        .filter(|pod| pod.belongs_to(resource) && pod.has_condition(condition))
        .count();
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// First pod of `resource` in `kubectl get pods -o json` output.
pub fn first_pod_of(pods_json: &str, resource: &str) -> Result<Option<String>, HarnessError> {
    let pods: PodList = serde_json::from_str(pods_json)?;
    Ok(pods
        .items
        .into_iter()
        .find(|pod| pod.belongs_to(resource))
        .map(|pod| pod.metadata.name))
}

/// True when the list has running pods and every one of them is ready.
/// Completed job pods are ignored.
fn all_pods_ready(pods_json: &str) -> Result<bool, HarnessError> {
    let pods: PodList = serde_json::from_str(pods_json)?;
    let mut running = pods.items.iter().filter(|pod| !pod.is_completed()).peekable();
    if running.peek().is_none() {
        return Ok(false);
    }
    Ok(running.all(|pod| pod.has_condition("Ready")))
}

/// Split `kind/name` into its parts, defaulting the kind.
fn split_resource(resource: &str) -> (&str, &str) {
    resource
        .split_once('/')
        .unwrap_or((DEFAULT_SCALE_KIND, resource))
}

/// Cluster client backed by the `kubectl` and `helm` binaries.
pub struct KubectlCluster {
    config: Arc<HarnessConfig>,
    ids: Arc<dyn IdGenerator>,
}

impl KubectlCluster {
    pub fn new(config: Arc<HarnessConfig>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { config, ids }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, HarnessError> {
        run_command(&self.config.kubectl, args.iter().map(|s| s.to_string()).collect()).await
    }

    async fn helm(&self, args: Vec<String>) -> Result<String, HarnessError> {
        run_command(&self.config.helm, args).await
    }

    async fn pods_json(&self, namespace: &str) -> Result<String, HarnessError> {
        self.kubectl(&["get", "pods", "--namespace", namespace, "--output", "json"])
            .await
    }

    async fn exec(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<String, HarnessError> {
        let mut args = vec!["exec", pod, "--namespace", namespace, "--"];
        args.extend_from_slice(command);
        self.kubectl(&args).await
    }

    /// `helm install` a fresh release of `chart` named `<component>-<suffix>`.
    async fn install(
        &self,
        component: Component,
        chart: String,
        namespace: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        let release = format!("{component}-{}", self.ids.unique_id());

        let mut args = vec![
            "install".to_string(),
            release.clone(),
            chart,
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        args.extend(options.to_helm_args());

        self.helm(args).await?;
        info!(%namespace, %release, %component, "Installed release");
        Ok(release)
    }

    fn chart(&self, name: &str) -> String {
        self.config.charts_dir.join(name).display().to_string()
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubectlCluster {
    async fn await_baseline_cluster_readiness(&self) -> Result<(), HarnessError> {
        let condition = WaitCategory::BaselineCluster.condition(
            &self.config,
            "kube-system pods ready",
            true,
        );
        await_condition(&condition, || async {
            all_pods_ready(&self.pods_json(SYSTEM_NAMESPACE).await?)
        })
        .await
    }

    async fn create_namespace(&self, name: &str) -> Result<(), HarnessError> {
        self.kubectl(&["create", "namespace", name]).await?;
        info!(namespace = %name, "Created namespace");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), HarnessError> {
        self.kubectl(&["delete", "namespace", name, "--ignore-not-found=true"])
            .await?;
        info!(namespace = %name, "Deleted namespace");
        Ok(())
    }

    async fn start_administrative_cluster(
        &self,
        options: &ReleaseOptions,
        node_count: u32,
        namespace: &str,
    ) -> Result<String, HarnessError> {
        let options = options
            .clone()
            .with_value("admin.replicas", node_count.to_string());
        self.install(Component::Admin, self.chart("admin"), namespace, &options)
            .await
    }

    async fn start_database(
        &self,
        namespace: &str,
        admin_pod: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        let release = self
            .install(Component::Database, self.chart("database"), namespace, options)
            .await?;

        // The engines register with the admin tier; wait until it reports
        // the database as running.
        let timeout = self.config.ready_timeout.as_secs().to_string();
        self.exec(
            namespace,
            admin_pod,
            &[
                "nuocmd",
                "check",
                "database",
                "--db-name",
                DATABASE_NAME,
                "--check-running",
                "--wait-forever",
                "--timeout",
                &timeout,
            ],
        )
        .await?;

        Ok(release)
    }

    async fn start_workload_generator(
        &self,
        namespace: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        self.install(Component::Workload, self.chart("demo-ycsb"), namespace, options)
            .await
    }

    async fn delete_release(&self, namespace: &str, release: &str) -> Result<(), HarnessError> {
        self.helm(vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ])
        .await?;
        info!(%namespace, %release, "Uninstalled release");
        Ok(())
    }

    async fn scale_resource(
        &self,
        namespace: &str,
        resource: &str,
        replicas: u32,
    ) -> Result<(), HarnessError> {
        let (kind, name) = split_resource(resource);
        let target = format!("{kind}/{name}");
        let replicas_arg = format!("--replicas={replicas}");
        self.kubectl(&["scale", &target, &replicas_arg, "--namespace", namespace])
            .await?;
        Ok(())
    }

    async fn count_scheduled_replicas(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<u32, HarnessError> {
        let (_, name) = split_resource(resource);
        count_pods_with_condition(&self.pods_json(namespace).await?, name, "PodScheduled")
    }

    async fn count_ready_replicas(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<u32, HarnessError> {
        let (_, name) = split_resource(resource);
        count_pods_with_condition(&self.pods_json(namespace).await?, name, "Ready")
    }

    async fn pod_name(&self, namespace: &str, resource: &str) -> Result<String, HarnessError> {
        let (_, name) = split_resource(resource);
        first_pod_of(&self.pods_json(namespace).await?, name)?.ok_or_else(|| {
            HarnessError::provisioning("pod lookup", format!("no pod of {resource} in {namespace}"))
        })
    }

    async fn stream_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        label: &str,
        follow: bool,
    ) -> Result<(), HarnessError> {
        tokio::fs::create_dir_all(&self.config.results_dir).await?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let path = self
            .config
            .results_dir
            .join(format!("{pod}{label}-{stamp}.log"));
        let file = std::fs::File::create(&path)?;

        let mut command = Command::new(&self.config.kubectl);
        command.args(["logs", pod, "--namespace", namespace]);
        if follow {
            command.arg("--follow");
        }

        debug!(%namespace, %pod, path = %path.display(), "Streaming pod log");
        let status = command
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(HarnessError::provisioning(
                "kubectl logs",
                format!("log stream for {pod} exited with {status}"),
            ));
        }
        Ok(())
    }

    async fn start_secret_store(
        &self,
        options: &ReleaseOptions,
        namespace: &str,
    ) -> Result<String, HarnessError> {
        let options = options
            .clone()
            .with_value("server.dev.enabled", "true")
            .with_value("injector.enabled", "true");
        self.install(
            Component::SecretStore,
            self.config.vault_chart.clone(),
            namespace,
            &options,
        )
        .await
    }

    async fn initialize_secret_store(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<(), HarnessError> {
        let policy = format!(
            "echo 'path \"secret/data/{namespace}/*\" {{ capabilities = [\"read\"] }}' | vault policy write {VAULT_POLICY} -"
        );
        self.exec(namespace, instance, &["sh", "-c", &policy]).await?;
        info!(%namespace, %instance, "Initialized secret store");
        Ok(())
    }

    async fn bind_secret_store_to_cluster_identity(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<(), HarnessError> {
        self.exec(namespace, instance, &["vault", "auth", "enable", "kubernetes"])
            .await?;
        self.exec(
            namespace,
            instance,
            &[
                "sh",
                "-c",
                "vault write auth/kubernetes/config kubernetes_host=\"https://$KUBERNETES_PORT_443_TCP_ADDR:443\"",
            ],
        )
        .await?;

        let bound_namespace = format!("bound_service_account_namespaces={namespace}");
        let policies = format!("policies={VAULT_POLICY}");
        self.exec(
            namespace,
            instance,
            &[
                "vault",
                "write",
                "auth/kubernetes/role/nuodb",
                "bound_service_account_names=nuodb",
                &bound_namespace,
                &policies,
                "ttl=1h",
            ],
        )
        .await?;
        info!(%namespace, %instance, "Bound secret store to cluster identity");
        Ok(())
    }

    async fn generate_tls_material(
        &self,
        namespace: &str,
        commands: &[String],
    ) -> Result<PathBuf, HarnessError> {
        let suffix = self.ids.unique_id();
        let pod = format!("tls-keygen-{suffix}");
        let location = self.config.results_dir.join(format!("tls-{suffix}"));
        tokio::fs::create_dir_all(&location).await?;

        let script = format!(
            "mkdir -p {KEYGEN_DIR} && cd {KEYGEN_DIR} && {} && touch {KEYGEN_DONE_MARKER} && sleep 3600",
            commands.join(" && ")
        );
        let image = format!("--image={}", self.config.keygen_image);
        self.kubectl(&[
            "run",
            &pod,
            "--namespace",
            namespace,
            &image,
            "--restart=Never",
            "--command",
            "--",
            "sh",
            "-c",
            &script,
        ])
        .await?;

        let condition = WaitCategory::ReleaseReady.condition(
            &self.config,
            format!("{pod} keystores generated"),
            true,
        );
        let generated = await_condition(&condition, || async {
            self.exec(namespace, &pod, &["test", "-f", KEYGEN_DONE_MARKER])
                .await
                .map(|_| true)
        })
        .await;

        let copied = match generated {
            Ok(()) => {
                let source = format!("{namespace}/{pod}:{KEYGEN_DIR}");
                let target = location.display().to_string();
                self.kubectl(&["cp", &source, &target]).await.map(|_| ())
            }
            Err(err) => Err(err),
        };

        // The pod is only a vehicle for the script.
        if let Err(err) = self
            .kubectl(&["delete", "pod", &pod, "--namespace", namespace, "--wait=false"])
            .await
        {
            warn!(%namespace, %pod, error = %err, "Failed to delete key generation pod");
        }

        if let Err(err) = copied {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&location).await {
                warn!(path = %location.display(), error = %cleanup, "Failed to remove partial TLS material");
            }
            return Err(err);
        }

        info!(%namespace, path = %location.display(), "Generated TLS material");
        Ok(location)
    }

    async fn store_secrets_in_store(
        &self,
        namespace: &str,
        instance: &str,
        location: &Path,
    ) -> Result<(), HarnessError> {
        let mut entries = tokio::fs::read_dir(location).await?;
        let mut stored = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }

            let remote = format!("/tmp/{file_name}");
            let target = format!("{namespace}/{instance}:{remote}");
            let source = entry.path().display().to_string();
            self.kubectl(&["cp", &source, &target]).await?;

            let key = file_name
                .split_once('.')
                .map_or(file_name.as_str(), |(stem, _)| stem);
            let path = format!("secret/{namespace}/tls/{key}");
            let value = format!("value=@{remote}");
            self.exec(namespace, instance, &["vault", "kv", "put", &path, &value])
                .await?;
            stored += 1;
        }

        if stored == 0 {
            return Err(HarnessError::provisioning(
                "store secrets",
                format!("no TLS material found in {}", location.display()),
            ));
        }

        info!(%namespace, %instance, stored, "Stored TLS material in secret store");
        Ok(())
    }

    async fn remove_tls_material(
        &self,
        namespace: &str,
        location: &Path,
    ) -> Result<(), HarnessError> {
        match tokio::fs::remove_dir_all(location).await {
            Ok(()) => {
                debug!(%namespace, path = %location.display(), "Removed TLS material");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn verify_teardown_complete(
        &self,
        context: &DeploymentContext,
    ) -> Result<(), HarnessError> {
        let mut leaked = Vec::new();

        let listed = self
            .helm(vec![
                "list".to_string(),
                "--all-namespaces".to_string(),
                "--short".to_string(),
            ])
            .await?;
        for record in context.releases() {
            if listed.lines().any(|line| line.trim() == record.release) {
                leaked.push(format!("release {}", record.release));
            }
        }

        let namespace = self
            .kubectl(&[
                "get",
                "namespace",
                context.namespace(),
                "--ignore-not-found=true",
                "--output",
                "name",
            ])
            .await?;
        if !namespace.trim().is_empty() {
            leaked.push(format!("namespace {}", context.namespace()));
        }

        if leaked.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::provisioning(
                "verify teardown",
                format!("resources left behind: {}", leaked.join(", ")),
            ))
        }
    }
}

/// Run `program` with `args`, returning stdout or a provisioning error carrying
/// stderr.
async fn run_command(program: &str, args: Vec<String>) -> Result<String, HarnessError> {
    let operation = std::iter::once(program)
        .chain(args.iter().take(2).map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    debug!(%operation, ?args, "Running command");

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(HarnessError::provisioning(
            operation,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
