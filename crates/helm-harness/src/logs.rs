//! Best-effort background log capture.
//!
//! A [`LogObserver`] streams one pod's log on a detached tokio task. Nothing
//! in the scenario waits on it and its failures are only logged. Dropping the
//! observer aborts the task, which in turn kills the underlying `kubectl logs`
//! process.

use crate::cluster::ClusterClient;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running log stream.
#[derive(Debug)]
pub struct LogObserver {
    pod: String,
    handle: JoinHandle<()>,
}

impl LogObserver {
    /// Start streaming `pod`'s log in the background.
    pub fn spawn(
        cluster: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        label: impl Into<String>,
        follow: bool,
    ) -> Self {
        let namespace = namespace.into();
        let pod = pod.into();
        let label = label.into();

        let task_pod = pod.clone();
        let handle = tokio::spawn(async move {
            match cluster
                .stream_pod_log(&namespace, &task_pod, &label, follow)
                .await
            {
                Ok(()) => debug!(%namespace, pod = %task_pod, "Log stream ended"),
                Err(err) => {
                    warn!(%namespace, pod = %task_pod, error = %err, "Log stream failed");
                }
            }
        });

        Self { pod, handle }
    }

}

impl Drop for LogObserver {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            debug!(pod = %self.pod, "Stopping log stream");
            self.handle.abort();
        }
    }
}
