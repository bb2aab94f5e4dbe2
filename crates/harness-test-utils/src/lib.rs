//! # Harness Test Utilities
//!
//! Fakes and fixtures for testing the deployment harness without a
//! Kubernetes cluster.
//!
//! ## Modules
//!
//! - `fake_cluster` - In-memory [`ClusterClient`](helm_harness::ClusterClient)
//!   with call recording, replica simulation and fault injection
//! - `test_ids` - Deterministic suffix generators
//! - `fixtures` - Test configuration and a ready-made sequencer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harness_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let cluster = FakeCluster::new();
//!     let outcome = sequencer_for(&cluster)
//!         .run_workload_scenario(WorkloadScenario::default())
//!         .await;
//!
//!     assert!(outcome.is_ok());
//!     assert!(cluster.live_resources().is_empty());
//! }
//! ```

pub mod fake_cluster;
pub mod fixtures;
pub mod test_ids;

pub use fake_cluster::{ClusterCall, FakeCluster, FakeOp, Observation, FAKE_TLS_ROOT};
pub use fixtures::{sequencer_for, test_config, TEST_FILES_DIR};
pub use test_ids::{FixedIds, SequentialIds, TEST_SUFFIX};
