//! Deployment sequencing.
//!
//! A scenario is an ordered list of stages. Each stage provisions one resource,
//! registers the resource's cleanup on the [`TeardownStack`] before anything
//! else happens, and hands the identifiers it produced to later stages through
//! the [`DeploymentContext`].
//!
//! [`DeploymentSequencer::run`] is the scope guard around a scenario: whatever
//! way the scenario ends (success, error or panic) the background log streams
//! are stopped, the teardown stack is unwound and the cluster is checked for
//! leftovers before the result is handed back.
//!
//! # Workload scenario
//!
//! 1. Wait for the cluster's system pods
//! 2. Create namespace `testycsb-<suffix>`
//! 3. Install the admin tier (one node) and wait for it
//! 4. Install the database against the first admin pod, with minimal engine
//!    resource requests
//! 5. Install the YCSB generator with zero replicas
//! 6. Scale YCSB to one replica (scheduled, then ready)
//! 7. Stream the YCSB pod log in the background
//! 8. Let the workload run for the observation window
//!
//! # Secret scenario
//!
//! 1. Wait for the cluster's system pods
//! 2. Create namespace `testvault-<suffix>`
//! 3. Install the secret store and wait for it
//! 4. Initialize it and bind it to the cluster identity
//! 5. Generate TLS keystores with the default password
//! 6. Write the keystores into the secret store
//! 7. Install the admin tier with the secret store annotations overlay

use crate::cluster::{ClusterClient, KubectlCluster};
use crate::config::{HarnessConfig, ReleaseOptions, WORKLOAD_CONTROLLER_NAME};
use crate::context::{
    admin_statefulset_name, secret_store_statefulset_name, Component, DeploymentContext,
};
use crate::errors::HarnessError;
use crate::eventual::{await_condition, WaitCategory};
use crate::ids::{IdGenerator, UuidIds};
use crate::logs::LogObserver;
use crate::scaling::ScalingController;
use crate::secret::{ExposeSecret, SecretString};
use crate::teardown::{panic_message, TeardownCategory, TeardownStack};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Namespace prefix of the workload scenario.
pub const WORKLOAD_NAMESPACE_PREFIX: &str = "testycsb";

/// Namespace prefix of the secret scenario.
pub const VAULT_NAMESPACE_PREFIX: &str = "testvault";

/// Admin pods started by both scenarios.
pub const ADMIN_NODE_COUNT: u32 = 1;

/// Suffix of the captured YCSB log.
pub const WORKLOAD_LOG_LABEL: &str = "-ycsb";

/// Script that produces the keystores inside the key generation pod.
pub const KEY_SETUP_SCRIPT: &str = "setup-keys.sh";

/// Shell commands that generate TLS keystores protected by `password`.
pub fn tls_generation_commands(password: &SecretString) -> Vec<String> {
    vec![
        format!(
            "export DEFAULT_PASSWORD={}",
            single_quoted(password.expose_secret())
        ),
        KEY_SETUP_SCRIPT.to_string(),
    ]
}

/// Quote `value` as one POSIX shell word.
fn single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Helm overrides for the workload scenario.
#[derive(Debug, Clone)]
pub struct WorkloadScenario {
    pub admin: ReleaseOptions,
    pub database: ReleaseOptions,
    pub workload: ReleaseOptions,
    /// Replicas the generator is scaled to once installed.
    pub workload_replicas: u32,
}

impl Default for WorkloadScenario {
    fn default() -> Self {
        Self {
            admin: ReleaseOptions::default(),
            database: ReleaseOptions::minimal_engine_resources(),
            workload: ReleaseOptions::default().with_value("ycsb.replicas", "0"),
            workload_replicas: 1,
        }
    }
}

/// Helm overrides for the secret scenario.
#[derive(Debug, Clone)]
pub struct SecretScenario {
    pub secret_store: ReleaseOptions,
    pub admin: ReleaseOptions,
}

impl SecretScenario {
    /// Admin tier reads its keystores from the store via the annotations
    /// overlay in the configured files directory.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            secret_store: ReleaseOptions::default(),
            admin: ReleaseOptions::default().with_values_file(config.vault_annotations_file()),
        }
    }
}

/// Result of a completed workload scenario.
#[derive(Debug, Clone)]
pub struct WorkloadOutcome {
    pub context: DeploymentContext,
    pub workload_pod: String,
}

/// Result of a completed secret scenario.
#[derive(Debug, Clone)]
pub struct SecretOutcome {
    pub context: DeploymentContext,
    pub secret_store_pod: String,
    pub tls_location: PathBuf,
}

/// Drives the stages of a scenario and owns its teardown stack.
pub struct DeploymentSequencer {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<HarnessConfig>,
    ids: Arc<dyn IdGenerator>,
    teardown: TeardownStack,
    context: Option<DeploymentContext>,
    observers: Vec<LogObserver>,
}

impl DeploymentSequencer {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        config: Arc<HarnessConfig>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            cluster,
            config,
            ids,
            teardown: TeardownStack::new(),
            context: None,
            observers: Vec::new(),
        }
    }

    /// Sequencer driving the current kube context through `kubectl` and
    /// `helm`, with random resource suffixes.
    pub fn for_current_context(config: Arc<HarnessConfig>) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UuidIds);
        let cluster = Arc::new(KubectlCluster::new(Arc::clone(&config), Arc::clone(&ids)));
        Self::new(cluster, config, ids)
    }

    /// [`for_current_context`](Self::for_current_context) with configuration
    /// loaded from the environment.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// [`for_current_context`](Self::for_current_context) with configuration
    /// loaded from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, HarnessError> {
        let config = HarnessConfig::from_vars(vars)?;
        Ok(Self::for_current_context(Arc::new(config)))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn context(&self) -> Option<&DeploymentContext> {
        self.context.as_ref()
    }

    /// Run `scenario` and then release everything it registered.
    ///
    /// Teardown runs after the scenario has finished, however it finished. A
    /// scenario panic is re-raised once the stack is empty.
    pub async fn run<T, F>(mut self, scenario: F) -> Result<T, HarnessError>
    where
        F: for<'s> FnOnce(&'s mut DeploymentSequencer) -> BoxFuture<'s, Result<T, HarnessError>>,
    {
        let outcome = AssertUnwindSafe(scenario(&mut self)).catch_unwind().await;

        self.observers.clear();
        let report = self.teardown.unwind(None).await;
        let verified = match &self.context {
            Some(context) => self.cluster.verify_teardown_complete(context).await,
            None => Ok(()),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    %report,
                    "Scenario panicked, teardown finished"
                );
                if let Err(err) = verified {
                    error!(error = %err, "Teardown verification failed");
                }
                std::panic::resume_unwind(payload);
            }
        };

        match (result, report.is_clean(), verified) {
            (Ok(value), true, Ok(())) => {
                info!(released = report.executed, "Scenario completed and torn down");
                Ok(value)
            }
            (Ok(_), true, Err(err)) => Err(err),
            (Ok(_), false, verified) => {
                if let Err(err) = verified {
                    warn!(error = %err, "Teardown verification failed");
                }
                Err(HarnessError::Teardown(report))
            }
            (Err(cause), clean, verified) => {
                error!(error = %cause, "Scenario failed");
                if let Err(err) = verified {
                    warn!(error = %err, "Teardown verification failed");
                }
                if clean {
                    Err(cause)
                } else {
                    Err(HarnessError::Aborted {
                        cause: Box::new(cause),
                        teardown: report,
                    })
                }
            }
        }
    }

    /// Run the workload scenario end to end.
    pub async fn run_workload_scenario(
        self,
        scenario: WorkloadScenario,
    ) -> Result<WorkloadOutcome, HarnessError> {
        self.run(move |sequencer| sequencer.workload_stages(scenario).boxed())
            .await
    }

    /// Run the secret scenario end to end.
    pub async fn run_secret_scenario(
        self,
        scenario: SecretScenario,
    ) -> Result<SecretOutcome, HarnessError> {
        self.run(move |sequencer| sequencer.secret_stages(scenario).boxed())
            .await
    }

    async fn workload_stages(
        &mut self,
        scenario: WorkloadScenario,
    ) -> Result<WorkloadOutcome, HarnessError> {
        self.cluster.await_baseline_cluster_readiness().await?;

        let namespace = self.create_namespace(WORKLOAD_NAMESPACE_PREFIX).await?;
        self.start_admin(&scenario.admin, ADMIN_NODE_COUNT).await?;
        self.start_database(&scenario.database).await?;
        self.start_workload_generator(&scenario.workload).await?;

        ScalingController::new(self.cluster.as_ref(), &self.config)
            .scale(
                WORKLOAD_CONTROLLER_NAME,
                &namespace,
                scenario.workload_replicas,
            )
            .await?;

        let workload_pod = self
            .cluster
            .pod_name(&namespace, WORKLOAD_CONTROLLER_NAME)
            .await?;
        self.observers.push(LogObserver::spawn(
            Arc::clone(&self.cluster),
            namespace.as_str(),
            workload_pod.as_str(),
            WORKLOAD_LOG_LABEL,
            true,
        ));

        info!(
            %namespace,
            pod = %workload_pod,
            window = ?self.config.observation_window,
            "Observing workload"
        );
        tokio::time::sleep(self.config.observation_window).await;

        Ok(WorkloadOutcome {
            context: self.require_context()?.clone(),
            workload_pod,
        })
    }

    async fn secret_stages(
        &mut self,
        scenario: SecretScenario,
    ) -> Result<SecretOutcome, HarnessError> {
        self.cluster.await_baseline_cluster_readiness().await?;

        let namespace = self.create_namespace(VAULT_NAMESPACE_PREFIX).await?;
        let secret_store_pod = self.start_secret_store(&scenario.secret_store).await?;

        self.cluster
            .initialize_secret_store(&namespace, &secret_store_pod)
            .await?;
        self.cluster
            .bind_secret_store_to_cluster_identity(&namespace, &secret_store_pod)
            .await?;

        let commands = tls_generation_commands(&self.config.secret_password);
        let tls_location = self.generate_tls_material(&commands).await?;
        self.cluster
            .store_secrets_in_store(&namespace, &secret_store_pod, &tls_location)
            .await?;

        self.start_admin(&scenario.admin, ADMIN_NODE_COUNT).await?;

        Ok(SecretOutcome {
            context: self.require_context()?.clone(),
            secret_store_pod,
            tls_location,
        })
    }

    fn require_context(&self) -> Result<&DeploymentContext, HarnessError> {
        self.context.as_ref().ok_or_else(|| {
            HarnessError::provisioning("sequencing", "no namespace has been created yet")
        })
    }

    fn namespace(&self) -> Result<String, HarnessError> {
        Ok(self.require_context()?.namespace().to_string())
    }

    fn push_release_teardown(&mut self, category: TeardownCategory, namespace: &str, release: &str) {
        let cluster = Arc::clone(&self.cluster);
        let namespace = namespace.to_string();
        let release = release.to_string();
        self.teardown.push(category, move || async move {
            cluster.delete_release(&namespace, &release).await
        });
    }

    async fn create_namespace(&mut self, prefix: &str) -> Result<String, HarnessError> {
        let namespace = format!("{prefix}-{}", self.ids.unique_id());
        self.cluster.create_namespace(&namespace).await?;

        let cluster = Arc::clone(&self.cluster);
        let owned = namespace.clone();
        self.teardown.push(TeardownCategory::Admin, move || async move {
            cluster.delete_namespace(&owned).await
        });
        self.context = Some(DeploymentContext::new(namespace.as_str()));

        Ok(namespace)
    }

    async fn start_admin(
        &mut self,
        options: &ReleaseOptions,
        node_count: u32,
    ) -> Result<String, HarnessError> {
        let namespace = self.namespace()?;
        let release = self
            .cluster
            .start_administrative_cluster(options, node_count, &namespace)
            .await?;
        self.push_release_teardown(TeardownCategory::Admin, &namespace, &release);
        self.record(Component::Admin, &release);

        self.await_release_ready(&namespace, &admin_statefulset_name(&release), node_count)
            .await?;
        Ok(release)
    }

    async fn start_database(&mut self, options: &ReleaseOptions) -> Result<String, HarnessError> {
        let namespace = self.namespace()?;
        let admin_pod = self.require_context()?.admin_pod().ok_or_else(|| {
            HarnessError::provisioning("start database", "admin tier has not been started")
        })?;

        let release = self
            .cluster
            .start_database(&namespace, &admin_pod, options)
            .await?;
        self.push_release_teardown(TeardownCategory::Database, &namespace, &release);
        self.record(Component::Database, &release);
        Ok(release)
    }

    async fn start_workload_generator(
        &mut self,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        let namespace = self.namespace()?;
        let release = self
            .cluster
            .start_workload_generator(&namespace, options)
            .await?;
        self.push_release_teardown(TeardownCategory::Workload, &namespace, &release);
        self.record(Component::Workload, &release);
        Ok(release)
    }

    /// Returns the secret store pod name.
    async fn start_secret_store(
        &mut self,
        options: &ReleaseOptions,
    ) -> Result<String, HarnessError> {
        let namespace = self.namespace()?;
        let release = self.cluster.start_secret_store(options, &namespace).await?;
        self.push_release_teardown(TeardownCategory::Vault, &namespace, &release);
        self.record(Component::SecretStore, &release);

        self.await_release_ready(&namespace, &secret_store_statefulset_name(&release), 1)
            .await?;

        self.require_context()?.secret_store_pod().ok_or_else(|| {
            HarnessError::provisioning("start secret store", "secret store release not recorded")
        })
    }

    async fn generate_tls_material(&mut self, commands: &[String]) -> Result<PathBuf, HarnessError> {
        let namespace = self.namespace()?;
        let location = self
            .cluster
            .generate_tls_material(&namespace, commands)
            .await?;

        let cluster = Arc::clone(&self.cluster);
        let owned = location.clone();
        self.teardown.push(TeardownCategory::Secrets, move || async move {
            cluster.remove_tls_material(&namespace, &owned).await
        });

        Ok(location)
    }

    async fn await_release_ready(
        &self,
        namespace: &str,
        statefulset: &str,
        replicas: u32,
    ) -> Result<(), HarnessError> {
        let condition = WaitCategory::ReleaseReady.condition(
            &self.config,
            format!("{statefulset} ready"),
            replicas,
        );
        await_condition(&condition, || {
            self.cluster.count_ready_replicas(namespace, statefulset)
        })
        .await
    }

    fn record(&mut self, component: Component, release: &str) {
        if let Some(context) = self.context.as_mut() {
            context.record_release(component, release);
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_tls_generation_commands_export_password_first() {
        let commands = tls_generation_commands(&SecretString::from("Changeme!"));

        assert_eq!(
            commands,
            vec![
                "export DEFAULT_PASSWORD='Changeme!'".to_string(),
                "setup-keys.sh".to_string()
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_password_with_single_quote_stays_one_shell_word() {
        let commands = tls_generation_commands(&SecretString::from("it's;echo injected"));

        assert_eq!(commands[0], r"export DEFAULT_PASSWORD='it'\''s;echo injected'");

        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{} && printf %s \"$DEFAULT_PASSWORD\"", commands[0]))
            .output()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "it's;echo injected");
    }

    #[test]
    fn test_from_vars_reports_bad_configuration_as_harness_error() {
        let vars = HashMap::from([(
            "HARNESS_POLL_INTERVAL_MS".to_string(),
            "soon".to_string(),
        )]);

        match DeploymentSequencer::from_vars(&vars) {
            Err(HarnessError::Config(ConfigError::InvalidValue { name, value })) => {
                assert_eq!(name, "HARNESS_POLL_INTERVAL_MS");
                assert_eq!(value, "soon");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("invalid poll interval accepted"),
        }
    }

    #[test]
    fn test_from_vars_builds_sequencer_with_overrides() {
        let vars = HashMap::from([("HARNESS_HELM".to_string(), "/opt/bin/helm".to_string())]);

        let sequencer = DeploymentSequencer::from_vars(&vars).unwrap();

        assert_eq!(sequencer.config().helm, "/opt/bin/helm");
        assert!(sequencer.context().is_none());
    }

    #[test]
    fn test_workload_scenario_starts_generator_at_zero() {
        let scenario = WorkloadScenario::default();

        assert_eq!(
            scenario.workload.set_values.get("ycsb.replicas"),
            Some(&"0".to_string())
        );
        assert_eq!(scenario.workload_replicas, 1);
        assert_eq!(scenario.database, ReleaseOptions::minimal_engine_resources());
    }

    #[test]
    fn test_secret_scenario_uses_annotations_overlay() {
        let config = HarnessConfig::default();
        let scenario = SecretScenario::from_config(&config);

        assert_eq!(
            scenario.admin.values_files,
            vec![config.vault_annotations_file()]
        );
    }
}
