//! Pre-wired harness pieces for tests.

use crate::fake_cluster::FakeCluster;
use crate::test_ids::FixedIds;
use helm_harness::config::HarnessConfig;
use helm_harness::sequencer::DeploymentSequencer;
use std::path::PathBuf;
use std::sync::Arc;

/// Files directory used by [`test_config`].
pub const TEST_FILES_DIR: &str = "/fake/files";

/// Default configuration with a fixed files directory.
///
/// Timeouts keep their production values; tests run on paused tokio time so
/// they cost nothing.
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        files_dir: PathBuf::from(TEST_FILES_DIR),
        ..HarnessConfig::default()
    }
}

/// Sequencer over `cluster` with [`test_config`] and [`FixedIds`].
pub fn sequencer_for(cluster: &FakeCluster) -> DeploymentSequencer {
    DeploymentSequencer::new(
        Arc::new(cluster.clone()),
        Arc::new(test_config()),
        Arc::new(FixedIds::default()),
    )
}
