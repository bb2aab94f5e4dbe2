//! Secret Scenario
//!
//! Vault in dev mode, TLS keystores generated with the default password and
//! stored in Vault, then an admin tier that reads them through the Vault
//! annotations overlay.

#![cfg(feature = "minikube")]

use env_tests::cluster::LiveCluster;
use helm_harness::sequencer::SecretScenario;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_admin_tier_starts_on_vault_provisioned_keystores() {
    let cluster = LiveCluster::connect()
        .await
        .expect("kubectl, helm and a running cluster are required");

    let outcome = cluster
        .sequencer()
        .run_secret_scenario(SecretScenario::from_config(&cluster.config))
        .await
        .expect("secret scenario should complete and leave nothing behind");

    assert!(outcome.context.namespace().starts_with("testvault-"));
    assert!(outcome.secret_store_pod.ends_with("-vault-0"));
    assert!(
        !outcome.tls_location.exists(),
        "TLS material should be removed during teardown"
    );
}
