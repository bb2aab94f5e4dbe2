//! Workload scenario against the in-memory cluster.
//!
//! Covers stage ordering, the two-phase scale-up of the YCSB controller,
//! background log capture and the reverse-order teardown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use harness_test_utils::{sequencer_for, FakeCluster, FakeOp, TEST_SUFFIX};
use helm_harness::config::{
    MINIMAL_VIABLE_ENGINE_CPU, MINIMAL_VIABLE_ENGINE_MEMORY, WORKLOAD_CONTROLLER_NAME,
};
use helm_harness::context::Component;
use helm_harness::sequencer::WorkloadScenario;
use std::time::Duration;
use tokio::time::Instant;

async fn wait_for_log_streams_to_stop(cluster: &FakeCluster) {
    for _ in 0..20 {
        if cluster.active_log_streams() == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_workload_scenario_provisions_in_dependency_order() {
    let cluster = FakeCluster::new();

    let outcome = sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    let namespace = format!("testycsb-{TEST_SUFFIX}");
    assert_eq!(outcome.context.namespace(), namespace);
    assert_eq!(outcome.workload_pod, "ycsb-load-fake0");
    assert_eq!(outcome.context.release(Component::Admin), Some("admin-000001"));
    assert_eq!(
        outcome.context.release(Component::Database),
        Some("database-000002")
    );
    assert_eq!(outcome.context.release(Component::Workload), Some("ycsb-000003"));

    let ops = cluster.ops();
    assert_eq!(ops[0], FakeOp::BaselineReadiness);
    assert_eq!(ops[1], FakeOp::CreateNamespace);
    assert_eq!(ops[2], FakeOp::StartAdmin);

    let database = cluster.position(FakeOp::StartDatabase).unwrap();
    let workload = cluster.position(FakeOp::StartWorkload).unwrap();
    let scale = cluster.position(FakeOp::Scale).unwrap();
    assert!(database < workload);
    assert!(workload < scale);

    // The database is pointed at the first admin pod.
    assert_eq!(
        cluster.targets(FakeOp::StartDatabase),
        vec!["admin-000001-nuodb-cluster0-0".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_installs_carry_engine_requests_and_idle_generator() {
    let cluster = FakeCluster::new();

    sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    let database = cluster.release_options(FakeOp::StartDatabase);
    assert_eq!(database.len(), 1);
    for engine in ["sm", "te"] {
        assert_eq!(
            database[0]
                .set_values
                .get(&format!("database.{engine}.resources.requests.cpu"))
                .map(String::as_str),
            Some(MINIMAL_VIABLE_ENGINE_CPU)
        );
        assert_eq!(
            database[0]
                .set_values
                .get(&format!("database.{engine}.resources.requests.memory"))
                .map(String::as_str),
            Some(MINIMAL_VIABLE_ENGINE_MEMORY)
        );
    }

    // The generator comes up idle; the scale request brings it to one.
    let workload = cluster.release_options(FakeOp::StartWorkload);
    assert_eq!(workload.len(), 1);
    assert_eq!(
        workload[0].set_values.get("ycsb.replicas").map(String::as_str),
        Some("0")
    );

    let admin = cluster.release_options(FakeOp::StartAdmin);
    assert_eq!(admin.len(), 1);
    assert!(admin[0].values_files.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_admin_tier_is_ready_before_database_starts() {
    let cluster = FakeCluster::new();

    sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    let admin = cluster.observations("admin-000001-nuodb-cluster0");
    assert_eq!(admin.last().unwrap().value, 1);

    let calls = cluster.calls();
    let last_admin_poll = calls
        .iter()
        .rposition(|call| call.target == "admin-000001-nuodb-cluster0")
        .unwrap();
    assert!(last_admin_poll < cluster.position(FakeOp::StartDatabase).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_workload_is_scheduled_then_ready_before_log_capture() {
    let cluster = FakeCluster::new();

    sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    let observed: Vec<(FakeOp, u32)> = cluster
        .observations(WORKLOAD_CONTROLLER_NAME)
        .into_iter()
        .map(|observation| (observation.op, observation.value))
        .collect();
    assert_eq!(
        observed,
        vec![
            (FakeOp::CountScheduled, 0),
            (FakeOp::CountScheduled, 1),
            (FakeOp::CountReady, 0),
            (FakeOp::CountReady, 1),
        ]
    );

    let calls = cluster.calls();
    let last_ready = calls
        .iter()
        .rposition(|call| call.op == FakeOp::CountReady)
        .unwrap();
    let stream = cluster.position(FakeOp::StreamLog).unwrap();
    assert!(last_ready < stream);
    assert_eq!(
        cluster.targets(FakeOp::StreamLog),
        vec!["ycsb-load-fake0-ycsb".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_workload_runs_for_the_observation_window() {
    let cluster = FakeCluster::new();
    let start = Instant::now();

    sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_workload_teardown_runs_in_reverse_and_leaves_nothing() {
    let cluster = FakeCluster::new();

    sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    assert_eq!(
        cluster.targets(FakeOp::DeleteRelease),
        vec![
            "ycsb-000003".to_string(),
            "database-000002".to_string(),
            "admin-000001".to_string()
        ]
    );

    let ops = cluster.ops();
    let last_release_delete = ops
        .iter()
        .rposition(|op| *op == FakeOp::DeleteRelease)
        .unwrap();
    let namespace_delete = cluster.position(FakeOp::DeleteNamespace).unwrap();
    assert!(last_release_delete < namespace_delete);
    assert_eq!(ops.last(), Some(&FakeOp::VerifyTeardown));

    assert!(cluster.live_resources().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_log_stream_is_stopped_when_scenario_ends() {
    let cluster = FakeCluster::new();

    sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await
        .unwrap();

    wait_for_log_streams_to_stop(&cluster).await;
    assert_eq!(cluster.active_log_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_log_stream_failure_does_not_fail_the_scenario() {
    let cluster = FakeCluster::new().fail_on(FakeOp::StreamLog);

    let outcome = sequencer_for(&cluster)
        .run_workload_scenario(WorkloadScenario::default())
        .await;

    assert!(outcome.is_ok());
    assert!(cluster.live_resources().is_empty());
}
