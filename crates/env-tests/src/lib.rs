//! Environment Integration Test Suite
//!
//! Runs the harness scenarios end to end against a real cluster: the current
//! kube context, typically a local minikube.
//!
//! # Features
//!
//! - `minikube`: Full workload and secret scenarios (5-10min)
//!
//! # Prerequisites
//!
//! 1. Cluster running: `minikube start --memory 8g --cpus 4`
//! 2. `kubectl` and `helm` in PATH (or `HARNESS_KUBECTL` / `HARNESS_HELM`)
//! 3. `helm repo add hashicorp https://helm.releases.hashicorp.com`
//! 4. Chart sources in `HARNESS_CHARTS_DIR` and overlays in `HARNESS_FILES_DIR`
//!
//! # Usage
//!
//! ```bash
//! # From repo root - runs 0 env-tests (no default features)
//! cargo test
//!
//! # Full scenarios
//! cargo test -p env-tests --features minikube
//! ```

pub mod cluster;
