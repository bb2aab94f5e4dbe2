//! Cluster preflight and harness construction.
//!
//! This module checks that the tooling and kube context a live run needs are
//! present before any scenario allocates resources, and builds the sequencer
//! the scenarios run on.

use helm_harness::config::{ConfigError, HarnessConfig};
use helm_harness::observability::init_tracing;
use helm_harness::sequencer::DeploymentSequencer;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Filter used by the live tests when `RUST_LOG` is unset.
pub const ENV_TEST_LOG_FILTER: &str = "helm_harness=debug,env_tests=debug";

/// Preflight errors.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{program} not found or not runnable: {message}. Install it or set HARNESS_KUBECTL / HARNESS_HELM")]
    ToolMissing { program: String, message: String },

    #[error("No reachable cluster in the current kube context: {message}. Run 'minikube start' first")]
    ClusterUnreachable { message: String },

    #[error("Invalid harness configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A kube context that passed preflight, with the configuration to drive it.
pub struct LiveCluster {
    pub config: Arc<HarnessConfig>,
}

impl LiveCluster {
    /// Load configuration from the environment and check that `kubectl`,
    /// `helm` and the cluster are reachable.
    pub async fn connect() -> Result<Self, PreflightError> {
        init_tracing(ENV_TEST_LOG_FILTER);
        let config = HarnessConfig::from_env()?;
        debug!(?config, "Preflight configuration loaded");

        check_tool(&config.kubectl, &["version", "--client"]).await?;
        check_tool(&config.helm, &["version", "--short"]).await?;

        let output = Command::new(&config.kubectl)
            .arg("cluster-info")
            .output()
            .await
            .map_err(|e| PreflightError::ClusterUnreachable {
                message: e.to_string(),
            })?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(%message, "Cluster unreachable");
            return Err(PreflightError::ClusterUnreachable { message });
        }

        info!(kubectl = %config.kubectl, helm = %config.helm, "Cluster preflight passed");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Fresh sequencer over the live cluster.
    pub fn sequencer(&self) -> DeploymentSequencer {
        DeploymentSequencer::for_current_context(Arc::clone(&self.config))
    }
}

async fn check_tool(program: &str, args: &[&str]) -> Result<(), PreflightError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            error!(%program, error = %e, "Required tool not runnable");
            PreflightError::ToolMissing {
                program: program.to_string(),
                message: e.to_string(),
            }
        })?;

    if !output.status.success() {
        return Err(PreflightError::ToolMissing {
            program: program.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
