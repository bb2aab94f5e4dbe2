//! Replica scaling with two-phase confirmation.

use crate::cluster::ClusterClient;
use crate::config::HarnessConfig;
use crate::errors::HarnessError;
use crate::eventual::{await_condition, WaitCategory};
use tracing::info;

/// Scales a resource and waits until the new replica count is live.
pub struct ScalingController<'a> {
    cluster: &'a dyn ClusterClient,
    config: &'a HarnessConfig,
}

impl<'a> ScalingController<'a> {
    pub fn new(cluster: &'a dyn ClusterClient, config: &'a HarnessConfig) -> Self {
        Self { cluster, config }
    }

    /// Request `replicas` for `resource`, then wait for that many replicas to
    /// be scheduled and, only after that, for that many to be ready.
    pub async fn scale(
        &self,
        resource: &str,
        namespace: &str,
        replicas: u32,
    ) -> Result<(), HarnessError> {
        info!(%namespace, %resource, replicas, "Scaling resource");
        self.cluster
            .scale_resource(namespace, resource, replicas)
            .await?;

        let scheduled = WaitCategory::ReplicaScheduled.condition(
            self.config,
            format!("{resource} replicas scheduled"),
            replicas,
        );
        await_condition(&scheduled, || {
            self.cluster.count_scheduled_replicas(namespace, resource)
        })
        .await?;

        let ready = WaitCategory::ReplicaReady.condition(
            self.config,
            format!("{resource} replicas ready"),
            replicas,
        );
        await_condition(&ready, || self.cluster.count_ready_replicas(namespace, resource)).await?;

        info!(%namespace, %resource, replicas, "Scaled resource is ready");
        Ok(())
    }
}
