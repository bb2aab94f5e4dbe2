//! Readiness polling for asynchronous cluster state.
//!
//! The cluster is only observable by asking it again, so every precondition in
//! a scenario is expressed as a [`ReadinessCondition`]: an observation that is
//! repeated at a fixed interval until it yields the target value or the
//! timeout elapses.
//!
//! Observation errors (a pod that is not yet visible, a `kubectl` call that
//! races a resource creation) count as "not yet satisfied" rather than as
//! failures.

use crate::config::HarnessConfig;
use crate::errors::HarnessError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Categories of readiness wait, each with its own budget taken from
/// [`HarnessConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCategory {
    /// System pods of a freshly started cluster.
    BaselineCluster,

    /// Replicas placed on a node.
    ReplicaScheduled,

    /// Replicas passing their readiness probe.
    ReplicaReady,

    /// StatefulSet pods of a newly installed chart release.
    ReleaseReady,
}

impl WaitCategory {
    /// Maximum time to wait for this category.
    pub fn timeout(&self, config: &HarnessConfig) -> Duration {
        match self {
            WaitCategory::BaselineCluster => config.baseline_timeout,
            WaitCategory::ReplicaScheduled => config.scheduled_timeout,
            WaitCategory::ReplicaReady | WaitCategory::ReleaseReady => config.ready_timeout,
        }
    }

    /// Build a condition for `target` using this category's budget.
    pub fn condition<T>(
        &self,
        config: &HarnessConfig,
        description: impl Into<String>,
        target: T,
    ) -> ReadinessCondition<T> {
        ReadinessCondition {
            description: description.into(),
            target,
            poll_interval: config.poll_interval,
            timeout: self.timeout(config),
        }
    }
}

/// A value to wait for and how long to wait for it.
#[derive(Debug, Clone)]
pub struct ReadinessCondition<T> {
    /// Human-readable name used in logs and timeout errors.
    pub description: String,
    /// Value the observation must equal.
    pub target: T,
    /// Minimum spacing between observations.
    pub poll_interval: Duration,
    /// Total time budget, measured from the first observation.
    pub timeout: Duration,
}

impl<T> ReadinessCondition<T> {
    pub fn new(
        description: impl Into<String>,
        target: T,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            description: description.into(),
            target,
            poll_interval,
            timeout,
        }
    }
}

/// Poll `observe` until it returns the condition's target.
///
/// The first observation happens immediately. Between observations the poller
/// sleeps for `poll_interval`, capped at the time left, so a condition that
/// never holds fails no earlier than `timeout` and no later than
/// `timeout + poll_interval`.
///
/// # Example
///
/// ```no_run
/// use helm_harness::eventual::{await_condition, ReadinessCondition};
/// use std::time::Duration;
///
/// # async fn example(cluster: &dyn helm_harness::cluster::ClusterClient) -> Result<(), helm_harness::errors::HarnessError> {
/// let condition = ReadinessCondition::new(
///     "ycsb-load replicas ready",
///     1,
///     Duration::from_secs(1),
///     Duration::from_secs(300),
/// );
/// await_condition(&condition, || cluster.count_ready_replicas("testycsb-abc123", "ycsb-load")).await?;
/// # Ok(())
/// # }
/// ```
pub async fn await_condition<T, E, F, Fut>(
    condition: &ReadinessCondition<T>,
    mut observe: F,
) -> Result<(), HarnessError>
where
    T: PartialEq + Debug,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut last_observed = "nothing".to_string();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match observe().await {
            Ok(value) if value == condition.target => {
                info!(
                    condition = %condition.description,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Condition met"
                );
                return Ok(());
            }
            Ok(value) => {
                debug!(
                    condition = %condition.description,
                    observed = ?value,
                    target = ?condition.target,
                    "Condition not met yet"
                );
                last_observed = format!("{value:?}");
            }
            Err(err) => {
                debug!(
                    condition = %condition.description,
                    error = %err,
                    "Observation failed, treating as not ready"
                );
                last_observed = format!("error: {err}");
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= condition.timeout {
            return Err(HarnessError::Timeout {
                description: condition.description.clone(),
                target: format!("{:?}", condition.target),
                last_observed,
                elapsed,
            });
        }

        let remaining = condition.timeout.saturating_sub(elapsed);
        sleep(condition.poll_interval.min(remaining)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn condition(target: u32) -> ReadinessCondition<u32> {
        ReadinessCondition::new(
            "test replicas",
            target,
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_wait_category_timeouts_follow_config() {
        let config = HarnessConfig::default();

        assert_eq!(
            WaitCategory::BaselineCluster.timeout(&config),
            config.baseline_timeout
        );
        assert_eq!(
            WaitCategory::ReplicaScheduled.timeout(&config),
            config.scheduled_timeout
        );
        assert_eq!(
            WaitCategory::ReplicaReady.timeout(&config),
            config.ready_timeout
        );

        let built = WaitCategory::ReplicaScheduled.condition(&config, "scheduled", 3u32);
        assert_eq!(built.target, 3);
        assert_eq!(built.poll_interval, config.poll_interval);
        assert_eq!(built.timeout, config.scheduled_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_first_poll_without_waiting() {
        let start = Instant::now();

        let result = await_condition(&condition(1), || async { Ok::<_, Infallible>(1) }).await;

        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_value_reaches_target() {
        let observed = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = Arc::clone(&observed);
        let result = await_condition(&condition(3), move || {
            let counter = Arc::clone(&counter);
            async move { Ok::<_, Infallible>(counter.fetch_add(1, Ordering::SeqCst)) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(observed.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_no_earlier_than_timeout() {
        let start = Instant::now();

        let result = await_condition(&condition(1), || async { Ok::<_, Infallible>(0) }).await;

        let elapsed = start.elapsed();
        let err = result.expect_err("condition never holds");
        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed <= Duration::from_secs(11));
        match err {
            HarnessError::Timeout {
                target,
                last_observed,
                ..
            } => {
                assert_eq!(target, "1");
                assert_eq!(last_observed, "0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_honoured_when_interval_does_not_divide_it() {
        let condition = ReadinessCondition::new(
            "uneven",
            true,
            Duration::from_secs(3),
            Duration::from_secs(10),
        );
        let start = Instant::now();

        let result = await_condition(&condition, || async { Ok::<_, Infallible>(false) }).await;

        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observation_errors_are_not_fatal() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let result = await_condition(&condition(2), move || {
            let counter = Arc::clone(&counter);
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("pods \"ycsb-load\" not found"),
                    _ => Ok(2),
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_observation_error() {
        let result = await_condition(&condition(1), || async {
            Err::<u32, _>("connection refused")
        })
        .await;

        match result {
            Err(HarnessError::Timeout { last_observed, .. }) => {
                assert_eq!(last_observed, "error: connection refused");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
