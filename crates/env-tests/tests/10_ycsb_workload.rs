//! Workload Scenario
//!
//! Admin tier, database and YCSB generator, with YCSB scaled from zero to one
//! replica and its log captured to the results directory.

#![cfg(feature = "minikube")]

use env_tests::cluster::LiveCluster;
use helm_harness::context::Component;
use helm_harness::sequencer::WorkloadScenario;
use serial_test::serial;
use std::fs;

#[tokio::test]
#[serial]
async fn test_ycsb_workload_scales_up_and_tears_down() {
    let cluster = LiveCluster::connect()
        .await
        .expect("kubectl, helm and a running cluster are required");

    let outcome = cluster
        .sequencer()
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .expect("workload scenario should complete and leave nothing behind");

    assert!(outcome.context.namespace().starts_with("testycsb-"));
    assert!(outcome.context.release(Component::Workload).is_some());
    assert!(outcome.workload_pod.starts_with("ycsb-load-"));

    let captured = fs::read_dir(&cluster.config.results_dir)
        .expect("results directory should exist")
        .filter_map(Result::ok)
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{}-ycsb-", outcome.workload_pod))
        });
    assert!(captured, "YCSB log should have been captured");
}
