//! Helm Deployment Harness Library
//!
//! Provisions a multi-tier database deployment on a Kubernetes cluster through
//! `helm` and `kubectl`, drives it through a scenario, and releases every
//! resource it allocated no matter how the scenario ended.
//!
//! # Architecture
//!
//! ```text
//! DeploymentSequencer (one per scenario run)
//! ├── DeploymentContext   namespace + releases, derived pod names
//! ├── TeardownStack       cleanup actions, unwound in reverse
//! ├── ScalingController   scale, then scheduled, then ready
//! ├── LogObserver(s)      background `kubectl logs` capture
//! └── ClusterClient       kubectl/helm (KubectlCluster) or an in-memory fake
//! ```
//!
//! Every wait on cluster state goes through [`eventual::await_condition`].
//!
//! # Modules
//!
//! - [`sequencer`] - Scenario stages and the teardown scope guard
//! - [`teardown`] - Reverse-order cleanup registry
//! - [`eventual`] - Polling with timeout
//! - [`cluster`] - Cluster collaborator trait and CLI-backed implementation
//! - [`config`] - Harness configuration from environment

pub mod cluster;
pub mod config;
pub mod context;
pub mod errors;
pub mod eventual;
pub mod ids;
pub mod logs;
pub mod observability;
pub mod scaling;
pub mod secret;
pub mod sequencer;
pub mod teardown;

pub use cluster::{ClusterClient, KubectlCluster};
pub use config::{HarnessConfig, ReleaseOptions};
pub use context::DeploymentContext;
pub use errors::HarnessError;
pub use sequencer::DeploymentSequencer;
pub use teardown::{TeardownCategory, TeardownReport, TeardownStack};
