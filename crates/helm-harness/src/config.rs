//! Harness configuration.
//!
//! Configuration is loaded from environment variables. The default credential
//! used for TLS key generation is redacted in Debug output.

use crate::secret::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default kubectl binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Default helm binary.
pub const DEFAULT_HELM: &str = "helm";

/// Default directory holding the chart sources, relative to the test crate.
pub const DEFAULT_CHARTS_DIR: &str = "../stable";

/// Default directory holding values overlays.
pub const DEFAULT_FILES_DIR: &str = "../files";

/// Default directory for captured pod logs.
pub const DEFAULT_RESULTS_DIR: &str = "results";

/// Default readiness poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default timeout for the cluster's own system pods to come up.
pub const DEFAULT_BASELINE_TIMEOUT_SECS: u64 = 120;

/// Default timeout for replicas to be placed on a node.
pub const DEFAULT_SCHEDULED_TIMEOUT_SECS: u64 = 60;

/// Default timeout for replicas to pass their readiness probe.
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 300;

/// Default hold time after the workload is scaled up.
pub const DEFAULT_OBSERVATION_WINDOW_SECS: u64 = 5;

/// Default chart reference for the secret store.
pub const DEFAULT_VAULT_CHART: &str = "hashicorp/vault";

/// Default image used to run the key generation script.
pub const DEFAULT_KEYGEN_IMAGE: &str = "nuodb/nuodb-ce:latest";

/// Well-known default password baked into the generated keystores.
pub const DEFAULT_SECRET_PASSWORD: &str = "Changeme!";

/// Smallest CPU request an engine process still starts with.
pub const MINIMAL_VIABLE_ENGINE_CPU: &str = "500m";

/// Smallest memory request an engine process still starts with.
pub const MINIMAL_VIABLE_ENGINE_MEMORY: &str = "500Mi";

/// Name of the YCSB replication controller created by the workload chart.
pub const WORKLOAD_CONTROLLER_NAME: &str = "ycsb-load";

/// Values overlay that points the admin tier at the secret store.
pub const VAULT_ANNOTATIONS_FILE: &str = "vault-annotations.yaml";

/// Helm overrides passed opaquely to a provisioning call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOptions {
    /// `--set key=value` pairs.
    #[serde(default)]
    pub set_values: BTreeMap<String, String>,

    /// `-f <file>` overlays, applied in order.
    #[serde(default)]
    pub values_files: Vec<PathBuf>,
}

impl ReleaseOptions {
    /// Add a single `--set` override.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_values.insert(key.into(), value.into());
        self
    }

    /// Add a values overlay file.
    #[must_use]
    pub fn with_values_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.values_files.push(path.into());
        self
    }

    /// Resource requests that let storage and transaction engines start on a
    /// small single-node cluster.
    #[must_use]
    pub fn minimal_engine_resources() -> Self {
        let mut options = Self::default();
        for engine in ["sm", "te"] {
            options = options
                .with_value(
                    format!("database.{engine}.resources.requests.cpu"),
                    MINIMAL_VIABLE_ENGINE_CPU,
                )
                .with_value(
                    format!("database.{engine}.resources.requests.memory"),
                    MINIMAL_VIABLE_ENGINE_MEMORY,
                );
        }
        options
    }

    /// Render as helm command-line arguments.
    pub fn to_helm_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.set_values.len() * 2 + self.values_files.len() * 2);
        for file in &self.values_files {
            args.push("--values".to_string());
            args.push(file.display().to_string());
        }
        for (key, value) in &self.set_values {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }
        args
    }
}

/// Harness configuration.
#[derive(Clone)]
pub struct HarnessConfig {
    /// kubectl binary (default: "kubectl").
    pub kubectl: String,

    /// helm binary (default: "helm").
    pub helm: String,

    /// Directory containing the admin, database and YCSB charts.
    pub charts_dir: PathBuf,

    /// Directory containing values overlays such as `vault-annotations.yaml`.
    pub files_dir: PathBuf,

    /// Directory where streamed pod logs are written.
    pub results_dir: PathBuf,

    /// Chart reference for the secret store.
    pub vault_chart: String,

    /// Image that runs the key generation script.
    pub keygen_image: String,

    /// Interval between readiness observations.
    pub poll_interval: Duration,

    /// Timeout for baseline cluster readiness.
    pub baseline_timeout: Duration,

    /// Timeout for replicas to be scheduled.
    pub scheduled_timeout: Duration,

    /// Timeout for replicas to become ready.
    pub ready_timeout: Duration,

    /// How long the workload runs before the scenario concludes.
    pub observation_window: Duration,

    /// Default keystore password handed to the key generation script.
    /// Protected by `SecretString` to prevent accidental logging.
    pub secret_password: SecretString,
}

/// Custom Debug implementation that redacts the keystore password.
impl fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("kubectl", &self.kubectl)
            .field("helm", &self.helm)
            .field("charts_dir", &self.charts_dir)
            .field("files_dir", &self.files_dir)
            .field("results_dir", &self.results_dir)
            .field("vault_chart", &self.vault_chart)
            .field("keygen_image", &self.keygen_image)
            .field("poll_interval", &self.poll_interval)
            .field("baseline_timeout", &self.baseline_timeout)
            .field("scheduled_timeout", &self.scheduled_timeout)
            .field("ready_timeout", &self.ready_timeout)
            .field("observation_window", &self.observation_window)
            .field("secret_password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            kubectl: DEFAULT_KUBECTL.to_string(),
            helm: DEFAULT_HELM.to_string(),
            charts_dir: PathBuf::from(DEFAULT_CHARTS_DIR),
            files_dir: PathBuf::from(DEFAULT_FILES_DIR),
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            vault_chart: DEFAULT_VAULT_CHART.to_string(),
            keygen_image: DEFAULT_KEYGEN_IMAGE.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            baseline_timeout: Duration::from_secs(DEFAULT_BASELINE_TIMEOUT_SECS),
            scheduled_timeout: Duration::from_secs(DEFAULT_SCHEDULED_TIMEOUT_SECS),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            observation_window: Duration::from_secs(DEFAULT_OBSERVATION_WINDOW_SECS),
            secret_password: SecretString::from(DEFAULT_SECRET_PASSWORD),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let string_var = |name: &str, default: String| -> String {
            vars.get(name).cloned().unwrap_or(default)
        };

        let secret_password = vars
            .get("HARNESS_SECRET_PASSWORD")
            .map(|s| SecretString::from(s.clone()))
            .unwrap_or(defaults.secret_password);

        Ok(HarnessConfig {
            kubectl: string_var("HARNESS_KUBECTL", defaults.kubectl),
            helm: string_var("HARNESS_HELM", defaults.helm),
            charts_dir: vars
                .get("HARNESS_CHARTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.charts_dir),
            files_dir: vars
                .get("HARNESS_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.files_dir),
            results_dir: vars
                .get("HARNESS_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            vault_chart: string_var("HARNESS_VAULT_CHART", defaults.vault_chart),
            keygen_image: string_var("HARNESS_KEYGEN_IMAGE", defaults.keygen_image),
            poll_interval: Duration::from_millis(parse_u64(
                vars,
                "HARNESS_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            baseline_timeout: Duration::from_secs(parse_u64(
                vars,
                "HARNESS_BASELINE_TIMEOUT_SECS",
                DEFAULT_BASELINE_TIMEOUT_SECS,
            )?),
            scheduled_timeout: Duration::from_secs(parse_u64(
                vars,
                "HARNESS_SCHEDULED_TIMEOUT_SECS",
                DEFAULT_SCHEDULED_TIMEOUT_SECS,
            )?),
            ready_timeout: Duration::from_secs(parse_u64(
                vars,
                "HARNESS_READY_TIMEOUT_SECS",
                DEFAULT_READY_TIMEOUT_SECS,
            )?),
            observation_window: Duration::from_secs(parse_u64(
                vars,
                "HARNESS_OBSERVATION_WINDOW_SECS",
                DEFAULT_OBSERVATION_WINDOW_SECS,
            )?),
            secret_password,
        })
    }

    /// Path of the admin values overlay that wires in the secret store.
    pub fn vault_annotations_file(&self) -> PathBuf {
        self.files_dir.join(VAULT_ANNOTATIONS_FILE)
    }
}

fn parse_u64(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.clone(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::secret::ExposeSecret;

    #[test]
    fn test_from_vars_defaults() {
        let config = HarnessConfig::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.kubectl, DEFAULT_KUBECTL);
        assert_eq!(config.helm, DEFAULT_HELM);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.observation_window, Duration::from_secs(5));
        assert_eq!(config.secret_password.expose_secret(), DEFAULT_SECRET_PASSWORD);
    }

    #[test]
    fn test_from_vars_overrides() {
        let vars = HashMap::from([
            ("HARNESS_KUBECTL".to_string(), "/usr/local/bin/kubectl".to_string()),
            ("HARNESS_POLL_INTERVAL_MS".to_string(), "250".to_string()),
            ("HARNESS_READY_TIMEOUT_SECS".to_string(), "42".to_string()),
            ("HARNESS_FILES_DIR".to_string(), "/tmp/files".to_string()),
            ("HARNESS_SECRET_PASSWORD".to_string(), "s3cret".to_string()),
        ]);

        let config = HarnessConfig::from_vars(&vars).unwrap();

        assert_eq!(config.kubectl, "/usr/local/bin/kubectl");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.ready_timeout, Duration::from_secs(42));
        assert_eq!(
            config.vault_annotations_file(),
            PathBuf::from("/tmp/files/vault-annotations.yaml")
        );
        assert_eq!(config.secret_password.expose_secret(), "s3cret");
    }

    #[test]
    fn test_from_vars_rejects_non_numeric_timeout() {
        let vars = HashMap::from([(
            "HARNESS_SCHEDULED_TIMEOUT_SECS".to_string(),
            "soon".to_string(),
        )]);

        let err = HarnessConfig::from_vars(&vars).unwrap_err();
        assert!(err.to_string().contains("HARNESS_SCHEDULED_TIMEOUT_SECS"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = HarnessConfig::default();
        let debug = format!("{config:?}");

        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(DEFAULT_SECRET_PASSWORD));
    }

    #[test]
    fn test_minimal_engine_resources() {
        let options = ReleaseOptions::minimal_engine_resources();

        assert_eq!(options.set_values.len(), 4);
        assert_eq!(
            options.set_values.get("database.te.resources.requests.memory"),
            Some(&MINIMAL_VIABLE_ENGINE_MEMORY.to_string())
        );
        assert_eq!(
            options.set_values.get("database.sm.resources.requests.cpu"),
            Some(&MINIMAL_VIABLE_ENGINE_CPU.to_string())
        );
    }

    #[test]
    fn test_to_helm_args_puts_files_before_values() {
        let options = ReleaseOptions::default()
            .with_value("admin.replicas", "1")
            .with_values_file("/files/vault-annotations.yaml");

        assert_eq!(
            options.to_helm_args(),
            vec![
                "--values",
                "/files/vault-annotations.yaml",
                "--set",
                "admin.replicas=1"
            ]
        );
    }

    #[test]
    fn test_release_options_deserialize_with_defaults() {
        let options: ReleaseOptions =
            serde_json::from_str(r#"{"set_values": {"ycsb.replicas": "0"}}"#).unwrap();

        assert!(options.values_files.is_empty());
        assert_eq!(options.set_values.get("ycsb.replicas"), Some(&"0".to_string()));
    }
}
