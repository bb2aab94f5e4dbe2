//! Helm Deployment Harness
//!
//! Runs one scenario against the current kube context and tears everything
//! down afterwards.
//!
//! ```text
//! helm-harness workload   # admin + database + YCSB, scale YCSB to 1
//! helm-harness secrets    # Vault + TLS keystores + admin with annotations
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use helm_harness::observability::{init_tracing, DEFAULT_LOG_FILTER};
use helm_harness::sequencer::{DeploymentSequencer, SecretScenario, WorkloadScenario};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "helm-harness")]
#[command(about = "Provision, exercise and tear down a Helm deployment", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the database with a YCSB load generator and scale it up
    Workload,
    /// Provision TLS keystores through Vault and start the admin tier on them
    Secrets,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(DEFAULT_LOG_FILTER);

    let sequencer = DeploymentSequencer::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(config = ?sequencer.config(), "Configuration loaded");

    match cli.command {
        Commands::Workload => {
            let outcome = sequencer
                .run_workload_scenario(WorkloadScenario::default())
                .await
                .context("workload scenario failed")?;
            info!(
                namespace = %outcome.context.namespace(),
                pod = %outcome.workload_pod,
                "Workload scenario passed"
            );
        }
        Commands::Secrets => {
            let scenario = SecretScenario::from_config(sequencer.config());
            let outcome = sequencer
                .run_secret_scenario(scenario)
                .await
                .context("secret scenario failed")?;
            info!(
                namespace = %outcome.context.namespace(),
                secret_store = %outcome.secret_store_pod,
                "Secret scenario passed"
            );
        }
    }

    Ok(())
}
