//! Teardown stack.
//!
//! Every resource a scenario allocates registers its cleanup here the moment it
//! exists. Unwinding runs the cleanups in reverse registration order and keeps
//! going past failures, so one broken delete never leaks the resources that
//! were created before it.
//!
//! # Guarantees
//!
//! - Entries run strictly in reverse insertion order (optionally filtered by
//!   [`TeardownCategory`], in which case other entries keep their order).
//! - An entry is removed before it runs and never runs twice; unwinding an
//!   empty stack is a no-op.
//! - A failing or panicking action is recorded in the [`TeardownReport`] and
//!   the unwind continues.
//! - A stack dropped with entries still on it (for example when the enclosing
//!   test future is cancelled) unwinds those entries before `drop` returns, on
//!   a dedicated thread, so they run even if the caller's runtime is shutting
//!   down.

use crate::errors::{HarnessError, TeardownActionError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Groups cleanup actions so a caller can release one tier on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownCategory {
    /// Admin tier releases and the test namespace.
    Admin,
    /// Database engine releases.
    Database,
    /// YCSB workload generator releases.
    Workload,
    /// Generated TLS material.
    Secrets,
    /// Secret store releases.
    Vault,
}

impl fmt::Display for TeardownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownCategory::Admin => "admin",
            TeardownCategory::Database => "database",
            TeardownCategory::Workload => "workload",
            TeardownCategory::Secrets => "secrets",
            TeardownCategory::Vault => "vault",
        };
        f.write_str(name)
    }
}

/// Future returned by a cleanup action.
pub type TeardownFuture = BoxFuture<'static, Result<(), HarnessError>>;

type TeardownAction = Box<dyn FnOnce() -> TeardownFuture + Send + Sync>;

struct TeardownEntry {
    category: TeardownCategory,
    action: TeardownAction,
}

/// Outcome of an unwind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Number of actions that ran, successful or not.
    pub executed: usize,
    /// Actions that returned an error or panicked, in execution order.
    pub failures: Vec<TeardownActionError>,
}

impl TeardownReport {
    /// True when every action that ran succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: TeardownReport) {
        self.executed += other.executed;
        self.failures.extend(other.failures);
    }

    /// `Ok(())` when clean, otherwise [`HarnessError::Teardown`].
    pub fn into_result(self) -> Result<(), HarnessError> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(HarnessError::Teardown(self))
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} cleanup actions failed",
            self.failures.len(),
            self.executed
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// Ordered registry of cleanup actions.
#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<TeardownEntry>,
}

impl fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownStack")
            .field("categories", &self.categories())
            .finish()
    }
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action. Never fails.
    pub fn push<F, Fut>(&mut self, category: TeardownCategory, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HarnessError>> + Send + 'static,
    {
        debug!(%category, depth = self.entries.len() + 1, "Registered teardown action");
        self.entries.push(TeardownEntry {
            category,
            action: Box::new(move || action().boxed()),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Categories of the pending entries, oldest first.
    pub fn categories(&self) -> Vec<TeardownCategory> {
        self.entries.iter().map(|entry| entry.category).collect()
    }

    /// Run and remove pending entries in reverse insertion order.
    ///
    /// With `Some(category)` only entries of that category run; everything
    /// else stays on the stack in its original order.
    pub async fn unwind(&mut self, category: Option<TeardownCategory>) -> TeardownReport {
        let mut report = TeardownReport::default();

        if !self.entries.is_empty() {
            info!(
                scope = %category.map_or_else(|| "all".to_string(), |c| c.to_string()),
                pending = self.entries.len(),
                "Unwinding teardown stack"
            );
        }

        while let Some(entry) = self.pop_next(category) {
            if let Err(failure) = run_entry(entry).await {
                warn!(
                    category = %failure.category,
                    error = %failure.message,
                    "Teardown action failed, continuing unwind"
                );
                report.failures.push(failure);
            }
            report.executed += 1;
        }

        report
    }

    fn pop_next(&mut self, category: Option<TeardownCategory>) -> Option<TeardownEntry> {
        let index = match category {
            None => self.entries.len().checked_sub(1)?,
            Some(wanted) => self
                .entries
                .iter()
                .rposition(|entry| entry.category == wanted)?,
        };
        Some(self.entries.remove(index))
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let entries = std::mem::take(&mut self.entries);
        warn!(
            pending = entries.len(),
            "Teardown stack dropped with pending entries, unwinding before release"
        );

        match unwind_orphaned(entries) {
            Ok(report) if report.is_clean() => {
                info!(released = report.executed, "Orphaned teardown entries released");
            }
            Ok(report) => error!(%report, "Orphaned teardown left resources behind"),
            Err(message) => error!(%message, "Orphaned teardown could not run, resources may leak"),
        }
    }
}

/// Unwind `entries` to completion on a dedicated thread with its own runtime,
/// blocking the caller until every entry has run. Independent of the caller's
/// runtime, which may be single-threaded or shutting down.
fn unwind_orphaned(entries: Vec<TeardownEntry>) -> Result<TeardownReport, String> {
    let worker = std::thread::Builder::new()
        .name("teardown-unwind".to_string())
        .spawn(move || -> Result<TeardownReport, String> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("failed to build teardown runtime: {e}"))?;
            let mut orphaned = TeardownStack { entries };
            Ok(runtime.block_on(orphaned.unwind(None)))
        })
        .map_err(|e| format!("failed to spawn teardown thread: {e}"))?;

    worker
        .join()
        .map_err(|payload| format!("teardown thread panicked: {}", panic_message(payload.as_ref())))?
}

async fn run_entry(entry: TeardownEntry) -> Result<(), TeardownActionError> {
    let TeardownEntry { category, action } = entry;

    let outcome = AssertUnwindSafe(async move { action().await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TeardownActionError {
            category,
            message: err.to_string(),
        }),
        Err(payload) => Err(TeardownActionError {
            category,
            message: format!("action panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording(
        log: &Log,
        name: &'static str,
    ) -> impl FnOnce() -> TeardownFuture + Send + Sync + 'static {
        let log = Arc::clone(log);
        move || {
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
            .boxed()
        }
    }

    fn vanish() -> Result<(), HarnessError> {
        panic!("vault pod vanished")
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_registration_order() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        let names = ["first", "second", "third", "fourth", "fifth"];

        for name in names {
            stack.push(TeardownCategory::Admin, recording(&log, name));
        }

        let report = stack.unwind(None).await;

        let mut expected = names.to_vec();
        expected.reverse();
        assert_eq!(*log.lock().unwrap(), expected);
        assert_eq!(report.executed, 5);
        assert!(report.is_clean());
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_unwind_ignores_category_when_unfiltered() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Admin, recording(&log, "namespace"));
        stack.push(TeardownCategory::Vault, recording(&log, "vault"));
        stack.push(TeardownCategory::Secrets, recording(&log, "secrets"));
        stack.push(TeardownCategory::Admin, recording(&log, "admin"));

        stack.unwind(None).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["admin", "secrets", "vault", "namespace"]
        );
    }

    #[tokio::test]
    async fn test_second_unwind_is_a_no_op() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Database, recording(&log, "database"));

        let first = stack.unwind(None).await;
        let second = stack.unwind(None).await;

        assert_eq!(first.executed, 1);
        assert_eq!(second, TeardownReport::default());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_earlier_entries() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Admin, recording(&log, "one"));
        stack.push(TeardownCategory::Admin, recording(&log, "two"));
        stack.push(TeardownCategory::Database, || async {
            Err(HarnessError::provisioning("helm uninstall", "release busy"))
        });
        stack.push(TeardownCategory::Workload, recording(&log, "four"));

        let report = stack.unwind(None).await;

        assert_eq!(*log.lock().unwrap(), vec!["four", "two", "one"]);
        assert_eq!(report.executed, 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].category, TeardownCategory::Database);
        assert!(report.failures[0].message.contains("release busy"));
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_panicking_action_is_recorded_and_unwind_continues() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Admin, recording(&log, "namespace"));
        stack.push(TeardownCategory::Vault, || async { vanish() });

        let report = stack.unwind(None).await;

        assert_eq!(*log.lock().unwrap(), vec!["namespace"]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].message.contains("vault pod vanished"));
    }

    #[tokio::test]
    async fn test_category_unwind_leaves_other_entries_in_order() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Admin, recording(&log, "namespace"));
        stack.push(TeardownCategory::Vault, recording(&log, "vault-a"));
        stack.push(TeardownCategory::Admin, recording(&log, "admin"));
        stack.push(TeardownCategory::Vault, recording(&log, "vault-b"));
        stack.push(TeardownCategory::Secrets, recording(&log, "secrets"));

        let report = stack.unwind(Some(TeardownCategory::Vault)).await;

        assert_eq!(report.executed, 2);
        assert_eq!(*log.lock().unwrap(), vec!["vault-b", "vault-a"]);
        assert_eq!(
            stack.categories(),
            vec![
                TeardownCategory::Admin,
                TeardownCategory::Admin,
                TeardownCategory::Secrets
            ]
        );

        stack.unwind(None).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["vault-b", "vault-a", "secrets", "admin", "namespace"]
        );
    }

    #[tokio::test]
    async fn test_category_unwind_with_no_matches_runs_nothing() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Admin, recording(&log, "admin"));

        let report = stack.unwind(Some(TeardownCategory::Workload)).await;

        assert_eq!(report.executed, 0);
        assert_eq!(stack.len(), 1);
        stack.unwind(None).await;
    }

    #[tokio::test]
    async fn test_dropped_stack_unwinds_before_drop_returns() {
        let log: Log = Arc::default();
        {
            let mut stack = TeardownStack::new();
            stack.push(TeardownCategory::Admin, recording(&log, "namespace"));
            stack.push(TeardownCategory::Database, recording(&log, "database"));
        }

        assert_eq!(*log.lock().unwrap(), vec!["database", "namespace"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_stack_unwinds_on_multi_thread_runtime() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Vault, recording(&log, "vault"));
        stack.push(TeardownCategory::Secrets, recording(&log, "secrets"));

        drop(stack);

        assert_eq!(*log.lock().unwrap(), vec!["secrets", "vault"]);
    }

    #[test]
    fn test_dropped_stack_unwinds_outside_a_runtime() {
        let log: Log = Arc::default();
        let mut stack = TeardownStack::new();
        stack.push(TeardownCategory::Workload, recording(&log, "workload"));

        drop(stack);

        assert_eq!(*log.lock().unwrap(), vec!["workload"]);
    }

    #[test]
    fn test_report_display_lists_failures() {
        let report = TeardownReport {
            executed: 3,
            failures: vec![TeardownActionError {
                category: TeardownCategory::Secrets,
                message: "permission denied".to_string(),
            }],
        };

        assert_eq!(
            report.to_string(),
            "1 of 3 cleanup actions failed; secrets teardown failed: permission denied"
        );
    }
}
