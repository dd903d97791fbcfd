mod common;

use provisionrs::lifecycle::CreateNodeError;
use provisionrs::providers::fake::{FakeBackend, Operation};

use common::{lifecycle, nat_node};

#[tokio::test(start_paused = true)]
async fn injected_step_failure_is_compensated() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("pipeline-step", "return(create-firewall-rule:22)").unwrap();

    let backend = FakeBackend::new();
    let nodes = lifecycle(&backend);
    let err = nodes.create_node(&nat_node("web-1")).await.unwrap_err();

    let CreateNodeError::RolledBack(failure) = &err else {
        panic!("expected a complete rollback, got {err:?}");
    };
    assert_eq!(failure.step, "create-firewall-rule:22");
    // The action never reached the backend.
    assert!(backend.calls_of(Operation::CreateFirewallRule).is_empty());
    assert!(backend.is_clean());

    fail::remove("pipeline-step");
    nodes.create_node(&nat_node("web-2")).await.unwrap();
    assert_eq!(backend.firewall_rules().len(), 1);

    scenario.teardown();
}
