//! In-memory cluster for sequencer and scaling tests.
//!
//! [`FakeCluster`] implements [`ClusterClient`] without a Kubernetes cluster:
//! - Every call is recorded, in order, as a [`ClusterCall`]
//! - Every replica count returned is recorded as an [`Observation`]
//! - Namespaces, releases and TLS material are tracked as live resources, so a
//!   test can assert nothing is left behind
//! - Replica counts advance by one per poll, scheduled first and ready never
//!   ahead of scheduled
//! - Any operation can be made to fail or panic
//!
//! # Example
//!
//! ```rust,ignore
//! use harness_test_utils::{FakeCluster, FakeOp};
//!
//! let cluster = FakeCluster::new().fail_on(FakeOp::StartDatabase);
//!
//! // run a scenario against Arc::new(cluster.clone()) ...
//!
//! assert!(cluster.live_resources().is_empty());
//! ```

use async_trait::async_trait;
use helm_harness::config::{ReleaseOptions, WORKLOAD_CONTROLLER_NAME};
use helm_harness::context::{
    admin_pod_name, admin_statefulset_name, secret_store_pod_name,
    secret_store_statefulset_name, Component, DeploymentContext,
};
use helm_harness::errors::HarnessError;
use helm_harness::ClusterClient;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Operations of [`ClusterClient`], used to inject faults and filter calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    BaselineReadiness,
    CreateNamespace,
    DeleteNamespace,
    StartAdmin,
    StartDatabase,
    StartWorkload,
    DeleteRelease,
    Scale,
    CountScheduled,
    CountReady,
    PodName,
    StreamLog,
    StartSecretStore,
    InitializeSecretStore,
    BindSecretStore,
    GenerateTls,
    StoreSecrets,
    RemoveTls,
    VerifyTeardown,
}

/// One recorded call. `target` is the namespace, release, resource or path the
/// call acted on. `options` is set for chart installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall {
    pub op: FakeOp,
    pub target: String,
    pub options: Option<ReleaseOptions>,
}

/// A replica count returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub op: FakeOp,
    pub resource: String,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Live {
    Namespace(String),
    Release { namespace: String, name: String },
    TlsMaterial(PathBuf),
}

impl Live {
    fn in_namespace(&self, wanted: &str) -> bool {
        match self {
            Live::Namespace(namespace) | Live::Release { namespace, .. } => namespace == wanted,
            Live::TlsMaterial(path) => path.starts_with(Path::new(FAKE_TLS_ROOT).join(wanted)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Live::Namespace(namespace) => format!("namespace {namespace}"),
            Live::Release { namespace, name } => format!("release {namespace}/{name}"),
            Live::TlsMaterial(path) => format!("tls {}", path.display()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Replicas {
    target: u32,
    scheduled: u32,
    ready: u32,
}

#[derive(Debug, Default)]
struct FakeClusterInner {
    calls: Vec<ClusterCall>,
    observations: Vec<Observation>,
    live: BTreeSet<Live>,
    /// Keyed by (namespace, resource).
    replicas: HashMap<(String, String), Replicas>,
    /// Resources that never get a replica scheduled.
    stuck: HashSet<String>,
    failures: HashSet<FakeOp>,
    panics: HashSet<FakeOp>,
    initialized_stores: HashSet<String>,
    bound_stores: HashSet<String>,
    stored_secrets: BTreeMap<String, PathBuf>,
    active_log_streams: usize,
    next_release: u32,
}

/// Directory prefix of the fake TLS material.
pub const FAKE_TLS_ROOT: &str = "/fake/tls";

/// Fake cluster. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<FakeClusterInner>>,
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail with a provisioning error.
    #[must_use]
    pub fn fail_on(self, op: FakeOp) -> Self {
        self.inner.lock().unwrap().failures.insert(op);
        self
    }

    /// Make every call of `op` panic.
    #[must_use]
    pub fn panic_on(self, op: FakeOp) -> Self {
        self.inner.lock().unwrap().panics.insert(op);
        self
    }

    /// Never schedule replicas of `resource`.
    #[must_use]
    pub fn with_stuck_replicas(self, resource: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .stuck
            .insert(resource.to_string());
        self
    }

    /// Stop failing `op`, e.g. to let a retried teardown succeed.
    pub fn heal(&self, op: FakeOp) {
        self.inner.lock().unwrap().failures.remove(&op);
    }

    /// All calls, in order.
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Operations of all calls, in order.
    pub fn ops(&self) -> Vec<FakeOp> {
        self.calls().into_iter().map(|call| call.op).collect()
    }

    /// Targets of the calls of `op`, in order.
    pub fn targets(&self, op: FakeOp) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.op == op)
            .map(|call| call.target)
            .collect()
    }

    /// Helm overrides passed to each install of `op`, in order.
    pub fn release_options(&self, op: FakeOp) -> Vec<ReleaseOptions> {
        self.calls()
            .into_iter()
            .filter(|call| call.op == op)
            .filter_map(|call| call.options)
            .collect()
    }

    /// Position of the first call of `op`.
    pub fn position(&self, op: FakeOp) -> Option<usize> {
        self.calls().iter().position(|call| call.op == op)
    }

    /// Replica counts returned for `resource`, in order, across both count
    /// operations.
    pub fn observations(&self, resource: &str) -> Vec<Observation> {
        self.inner
            .lock()
            .unwrap()
            .observations
            .iter()
            .filter(|observation| observation.resource == resource)
            .cloned()
            .collect()
    }

    /// Resources still allocated, described as `namespace <n>`,
    /// `release <ns>/<name>` or `tls <path>`.
    pub fn live_resources(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .live
            .iter()
            .map(Live::describe)
            .collect()
    }

    /// Keystore directories written into each store instance.
    pub fn stored_secrets(&self) -> BTreeMap<String, PathBuf> {
        self.inner.lock().unwrap().stored_secrets.clone()
    }

    /// Log streams that have started and not yet been dropped.
    pub fn active_log_streams(&self) -> usize {
        self.inner.lock().unwrap().active_log_streams
    }

    /// Record the call and apply any injected fault.
    fn enter(&self, op: FakeOp, target: &str) -> Result<(), HarnessError> {
        self.record(op, target, None)
    }

    fn enter_install(
        &self,
        op: FakeOp,
        target: &str,
        options: &ReleaseOptions,
    ) -> Result<(), HarnessError> {
        self.record(op, target, Some(options.clone()))
    }

    fn record(
        &self,
        op: FakeOp,
        target: &str,
        options: Option<ReleaseOptions>,
    ) -> Result<(), HarnessError> {
        let (fail, panic) = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(ClusterCall {
                op,
                target: target.to_string(),
                options,
            });
            (inner.failures.contains(&op), inner.panics.contains(&op))
        };
        debug!(?op, %target, "Fake cluster call");

        if panic {
            panic!("injected panic in {op:?} for {target}");
        }
        if fail {
            return Err(HarnessError::provisioning(
                format!("{op:?}"),
                format!("injected failure for {target}"),
            ));
        }
        Ok(())
    }

    fn require_namespace(&self, namespace: &str) -> Result<(), HarnessError> {
        let inner = self.inner.lock().unwrap();
        if inner.live.contains(&Live::Namespace(namespace.to_string())) {
            Ok(())
        } else {
            Err(HarnessError::provisioning(
                "namespace lookup",
                format!("namespace {namespace} not found"),
            ))
        }
    }

    fn release_is_live(&self, namespace: &str, release: &str) -> bool {
        self.inner.lock().unwrap().live.contains(&Live::Release {
            namespace: namespace.to_string(),
            name: release.to_string(),
        })
    }

    fn install(&self, component: Component, namespace: &str) -> Result<String, HarnessError> {
        self.require_namespace(namespace)?;

        let mut inner = self.inner.lock().unwrap();
        inner.next_release += 1;
        let release = format!("{component}-{:06}", inner.next_release);
        inner.live.insert(Live::Release {
            namespace: namespace.to_string(),
            name: release.clone(),
        });
        Ok(release)
    }

    /// A chart-managed statefulset comes up fully scheduled with nothing
    /// ready yet.
    fn add_statefulset(&self, namespace: &str, name: String, replicas: u32) {
        self.inner.lock().unwrap().replicas.insert(
            (namespace.to_string(), name),
            Replicas {
                target: replicas,
                scheduled: replicas,
                ready: 0,
            },
        );
    }

    fn observe(&self, op: FakeOp, namespace: &str, resource: &str) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let stuck = inner.stuck.contains(resource);
        let replicas = inner
            .replicas
            .entry((namespace.to_string(), resource.to_string()))
            .or_default();

        let value = match op {
            FakeOp::CountScheduled => {
                let value = replicas.scheduled;
                if !stuck && replicas.scheduled < replicas.target {
                    replicas.scheduled += 1;
                }
                value
            }
            _ => {
                let value = replicas.ready;
                if replicas.ready < replicas.scheduled {
                    replicas.ready += 1;
                }
                value
            }
        };

        inner.observations.push(Observation {
            op,
            resource: resource.to_string(),
            value,
        });
        value
    }
}

/// Decrements the active stream count when the streaming future is dropped.
struct StreamGuard {
    inner: Arc<Mutex<FakeClusterInner>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active_log_streams -= 1;
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn await_baseline_cluster_readiness(&self) -> Result<(), HarnessError> {
        self.enter(FakeOp::BaselineReadiness, "kube-system")
    }

    async fn create_namespace(&self, name: &str) -> Result<(), HarnessError> {
        self.enter(FakeOp::CreateNamespace, name)?;
        let inserted = self
            .inner
            .lock()
            .unwrap()
            .live
            .insert(Live::Namespace(name.to_string()));
        if !inserted {
            return Err(HarnessError::provisioning(
                "create namespace",
                format!("namespace {name} already exists"),
            ));
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), HarnessError> {
        self.enter(FakeOp::DeleteNamespace, name)?;
        self.inner
            .lock()
            .unwrap()
            .live
            .remove(&Live::Namespace(name.to_string()));
        Ok(())
    }

    async fn start_administrative_cluster(
        &self,
        options: &ReleaseOptions,
        node_count: u32,
        namespace: &str,
    ) -> Result<String, HarnessError> {
        self.enter_install(FakeOp::StartAdmin, namespace, options)?;
        let release = self.install(Component::Admin, namespace)?;
        self.add_statefulset(namespace, admin_statefulset_name(&release), node_count);
        Ok(release)
    }

    async fn start_database(
        &self,
        namespace: &str,
        admin_pod: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        self.enter_install(FakeOp::StartDatabase, admin_pod, options)?;

        let admin_running = {
            let inner = self.inner.lock().unwrap();
            inner.live.iter().any(|live| match live {
                Live::Release {
                    namespace: ns,
                    name,
                } => ns == namespace && admin_pod_name(name) == admin_pod,
                _ => false,
            })
        };
        if !admin_running {
            return Err(HarnessError::provisioning(
                "start database",
                format!("admin pod {admin_pod} not found"),
            ));
        }

        self.install(Component::Database, namespace)
    }

    async fn start_workload_generator(
        &self,
        namespace: &str,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        self.enter_install(FakeOp::StartWorkload, namespace, options)?;
        self.install(Component::Workload, namespace)
    }

    async fn delete_release(&self, namespace: &str, release: &str) -> Result<(), HarnessError> {
        self.enter(FakeOp::DeleteRelease, release)?;
        let removed = self.inner.lock().unwrap().live.remove(&Live::Release {
            namespace: namespace.to_string(),
            name: release.to_string(),
        });
        if !removed {
            return Err(HarnessError::provisioning(
                "helm uninstall",
                format!("release {release} not found"),
            ));
        }
        Ok(())
    }

    async fn scale_resource(
        &self,
        namespace: &str,
        resource: &str,
        replicas: u32,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::Scale, resource)?;

        // Only the workload chart creates a scalable controller.
        let workload_installed = {
            let inner = self.inner.lock().unwrap();
            inner.live.iter().any(|live| match live {
                Live::Release {
                    namespace: ns,
                    name,
                } => ns == namespace && name.starts_with(&Component::Workload.to_string()),
                _ => false,
            })
        };
        if resource != WORKLOAD_CONTROLLER_NAME || !workload_installed {
            return Err(HarnessError::provisioning(
                "kubectl scale",
                format!("{resource} not found in {namespace}"),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .replicas
            .entry((namespace.to_string(), resource.to_string()))
            .or_default();
        entry.target = replicas;
        entry.scheduled = entry.scheduled.min(replicas);
        entry.ready = entry.ready.min(entry.scheduled);
        Ok(())
    }

    async fn count_scheduled_replicas(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<u32, HarnessError> {
        self.enter(FakeOp::CountScheduled, resource)?;
        Ok(self.observe(FakeOp::CountScheduled, namespace, resource))
    }

    async fn count_ready_replicas(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<u32, HarnessError> {
        self.enter(FakeOp::CountReady, resource)?;
        Ok(self.observe(FakeOp::CountReady, namespace, resource))
    }

    async fn pod_name(&self, namespace: &str, resource: &str) -> Result<String, HarnessError> {
        self.enter(FakeOp::PodName, resource)?;
        let ready = self
            .inner
            .lock()
            .unwrap()
            .replicas
            .get(&(namespace.to_string(), resource.to_string()))
            .map_or(0, |replicas| replicas.ready);
        if ready == 0 {
            return Err(HarnessError::provisioning(
                "pod lookup",
                format!("no pod of {resource} in {namespace}"),
            ));
        }
        Ok(format!("{resource}-fake0"))
    }

    async fn stream_pod_log(
        &self,
        _namespace: &str,
        pod: &str,
        label: &str,
        follow: bool,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::StreamLog, &format!("{pod}{label}"))?;
        if !follow {
            return Ok(());
        }

        self.inner.lock().unwrap().active_log_streams += 1;
        let _guard = StreamGuard {
            inner: Arc::clone(&self.inner),
        };
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn start_secret_store(
        &self,
        options: &ReleaseOptions,
        namespace: &str,
    ) -> Result<String, HarnessError> {
        self.enter_install(FakeOp::StartSecretStore, namespace, options)?;
        let release = self.install(Component::SecretStore, namespace)?;
        self.add_statefulset(namespace, secret_store_statefulset_name(&release), 1);
        Ok(release)
    }

    async fn initialize_secret_store(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::InitializeSecretStore, instance)?;
        let exists = {
            let inner = self.inner.lock().unwrap();
            inner.live.iter().any(|live| match live {
                Live::Release {
                    namespace: ns,
                    name,
                } => ns == namespace && secret_store_pod_name(name) == instance,
                _ => false,
            })
        };
        if !exists {
            return Err(HarnessError::provisioning(
                "vault init",
                format!("pod {instance} not found"),
            ));
        }
        self.inner
            .lock()
            .unwrap()
            .initialized_stores
            .insert(instance.to_string());
        Ok(())
    }

    async fn bind_secret_store_to_cluster_identity(
        &self,
        _namespace: &str,
        instance: &str,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::BindSecretStore, instance)?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.initialized_stores.contains(instance) {
            return Err(HarnessError::provisioning(
                "vault auth",
                format!("{instance} is not initialized"),
            ));
        }
        inner.bound_stores.insert(instance.to_string());
        Ok(())
    }

    async fn generate_tls_material(
        &self,
        namespace: &str,
        commands: &[String],
    ) -> Result<PathBuf, HarnessError> {
        self.enter(FakeOp::GenerateTls, &commands.join(" && "))?;
        self.require_namespace(namespace)?;

        let location = Path::new(FAKE_TLS_ROOT).join(namespace);
        self.inner
            .lock()
            .unwrap()
            .live
            .insert(Live::TlsMaterial(location.clone()));
        Ok(location)
    }

    async fn store_secrets_in_store(
        &self,
        _namespace: &str,
        instance: &str,
        location: &Path,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::StoreSecrets, instance)?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.bound_stores.contains(instance) {
            return Err(HarnessError::provisioning(
                "vault kv put",
                format!("{instance} is not bound to the cluster identity"),
            ));
        }
        if !inner
            .live
            .contains(&Live::TlsMaterial(location.to_path_buf()))
        {
            return Err(HarnessError::provisioning(
                "vault kv put",
                format!("no TLS material at {}", location.display()),
            ));
        }
        inner
            .stored_secrets
            .insert(instance.to_string(), location.to_path_buf());
        Ok(())
    }

    async fn remove_tls_material(
        &self,
        _namespace: &str,
        location: &Path,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::RemoveTls, &location.display().to_string())?;
        self.inner
            .lock()
            .unwrap()
            .live
            .remove(&Live::TlsMaterial(location.to_path_buf()));
        Ok(())
    }

    async fn verify_teardown_complete(
        &self,
        context: &DeploymentContext,
    ) -> Result<(), HarnessError> {
        self.enter(FakeOp::VerifyTeardown, context.namespace())?;
        let leaked: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|live| live.in_namespace(context.namespace()))
            .map(Live::describe)
            .collect();
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
