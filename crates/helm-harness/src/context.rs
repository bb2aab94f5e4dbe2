//! Per-run deployment context.
//!
//! Holds the namespace of a run and the chart releases installed into it.
//! Every dependent resource name is derived from a release name with a fixed
//! suffix, so any stage can recompute the name of a dependency without asking
//! the cluster.

use std::fmt;

/// Components a scenario installs as chart releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Admin,
    Database,
    Workload,
    SecretStore,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Admin => "admin",
            Component::Database => "database",
            Component::Workload => "ycsb",
            Component::SecretStore => "vault",
        };
        f.write_str(name)
    }
}

/// StatefulSet backing the admin tier of `release`.
pub fn admin_statefulset_name(release: &str) -> String {
    format!("{release}-nuodb-cluster0")
}

/// First admin pod of `release`; the database is started against it.
pub fn admin_pod_name(release: &str) -> String {
    format!("{}-0", admin_statefulset_name(release))
}

/// StatefulSet backing the secret store of `release`.
pub fn secret_store_statefulset_name(release: &str) -> String {
    format!("{release}-vault")
}

/// Secret store pod of `release`; secrets are written through it.
pub fn secret_store_pod_name(release: &str) -> String {
    format!("{}-0", secret_store_statefulset_name(release))
}

/// A chart release recorded in the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub component: Component,
    pub release: String,
}

/// Namespace and releases of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentContext {
    namespace: String,
    releases: Vec<ReleaseRecord>,
}

impl DeploymentContext {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            releases: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Append a release. Existing records are never modified.
    pub fn record_release(&mut self, component: Component, release: impl Into<String>) {
        self.releases.push(ReleaseRecord {
            component,
            release: release.into(),
        });
    }

    /// All releases, in installation order.
    pub fn releases(&self) -> &[ReleaseRecord] {
        &self.releases
    }

    /// Most recent release of `component`.
    pub fn release(&self, component: Component) -> Option<&str> {
        self.releases
            .iter()
            .rev()
            .find(|record| record.component == component)
            .map(|record| record.release.as_str())
    }

    /// Admin pod of the most recent admin release.
    pub fn admin_pod(&self) -> Option<String> {
        self.release(Component::Admin).map(admin_pod_name)
    }

    /// Secret store pod of the most recent secret store release.
    pub fn secret_store_pod(&self) -> Option<String> {
        self.release(Component::SecretStore)
            .map(secret_store_pod_name)
    }
}
