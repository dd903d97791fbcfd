mod common;

use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;

use provisionrs::config::OrchestratorConfig;
use provisionrs::lifecycle::{CreateNodeError, GROUP_TAG};
use provisionrs::providers::fake::{Behavior, FakeBackend, Operation};
use provisionrs::queue::QueueError;
use provisionrs::resources::Partition;

use common::{basic_node, forwarded_node, lifecycle, lifecycle_with, nat_node, test_config};

/// Operations logged after the first call of `from`.
fn operations_after(backend: &FakeBackend, from: Operation) -> Vec<Operation> {
    let ops = backend.operations();
    let start = ops.iter().position(|op| *op == from).expect("operation never called");
    ops[start + 1..].to_vec()
}

#[tokio::test(start_paused = true)]
async fn static_nat_node_is_provisioned() {
    let backend = FakeBackend::new().all_async(1);
    let nodes = lifecycle(&backend);

    let record = nodes.create_node(&nat_node("web-1")).await.unwrap();

    assert_eq!(record.name, "web-1");
    assert_eq!(record.group, "web");
    assert!(record.public_address.is_some());
    assert_eq!(record.credentials.password, Some(format!("pw-{}", record.id)));
    assert!(record.credentials.private_key.is_some());

    let instances = backend.instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].tags.get(GROUP_TAG).map(String::as_str), Some("web"));
    let addresses = backend.addresses();
    assert_eq!(addresses.len(), 1);
    assert!(addresses[0].static_nat);
    assert_eq!(backend.firewall_rules().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn port_forwarding_node_gets_a_rule_per_port() {
    let backend = FakeBackend::new();
    let nodes = lifecycle(&backend);

    let record = nodes
        .create_node(&forwarded_node("edge-1", &[443, 22]))
        .await
        .unwrap();

    assert!(record.public_address.is_some());
    let mut ports: Vec<_> = backend.forwarding_rules().iter().map(|r| r.port).collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![22, 443]);
    assert_eq!(backend.firewall_rules().len(), 2);
    assert!(!backend.addresses()[0].static_nat);
}

#[tokio::test(start_paused = true)]
async fn firewall_failure_rolls_back_in_reverse_order() {
    let backend = FakeBackend::new().on_next(
        Operation::CreateFirewallRule,
        Behavior::Reject("rule quota exceeded".into()),
    );
    let nodes = lifecycle(&backend);

    let err = nodes.create_node(&nat_node("web-1")).await.unwrap_err();

    let CreateNodeError::RolledBack(failure) = &err else {
        panic!("expected a complete rollback, got {err:?}");
    };
    assert_eq!(failure.step, "create-firewall-rule:22");
    assert_eq!(
        failure.rollback.compensated(),
        ["enable-static-nat", "allocate-address", "create-instance"]
    );
    assert_eq!(
        operations_after(&backend, Operation::CreateFirewallRule),
        vec![
            Operation::DisableStaticNat,
            Operation::ReleaseAddress,
            Operation::DeleteInstance,
        ]
    );
    assert!(backend.is_clean());
    assert!(!err.needs_manual_cleanup());
}

#[tokio::test(start_paused = true)]
async fn failed_job_rolls_back_through_async_compensations() {
    let backend = FakeBackend::new().all_async(2).on_next(
        Operation::CreateFirewallRule,
        Behavior::JobFails {
            polls: 1,
            reason: "router busy".into(),
        },
    );
    let nodes = lifecycle(&backend);

    let err = nodes.create_node(&nat_node("web-1")).await.unwrap_err();

    assert!(matches!(err, CreateNodeError::RolledBack(_)));
    assert!(err.to_string().contains("router busy"));
    assert!(backend.is_clean());
}

#[tokio::test(start_paused = true)]
async fn attach_failure_removes_the_new_volume() {
    let backend = FakeBackend::new()
        .on_next(Operation::AttachVolume, Behavior::Reject("bad device".into()));
    let nodes = lifecycle(&backend);

    let spec = nat_node("db-1").with_volume("data", 50);
    let err = nodes.create_node(&spec).await.unwrap_err();

    assert_eq!(err.step_failure().unwrap().step, "attach-volume:data");
    assert_eq!(
        operations_after(&backend, Operation::AttachVolume),
        vec![Operation::DeleteVolume, Operation::DeleteInstance]
    );
    assert!(backend.volumes().is_empty());
    assert!(backend.is_clean());
}

#[tokio::test(start_paused = true)]
async fn volumes_are_attached_to_the_new_instance() {
    let backend = FakeBackend::new().all_async(1);
    let nodes = lifecycle(&backend);

    let spec = basic_node("db-1", &[]).with_volume("data", 50).with_volume("logs", 10);
    let record = nodes.create_node(&spec).await.unwrap();

    let volumes = backend.volumes();
    assert_eq!(volumes.len(), 2);
    assert!(volumes.iter().all(|v| v.attached_to.as_ref() == Some(&record.id)));
}

#[tokio::test(start_paused = true)]
async fn failed_compensation_is_reported_as_partial_rollback() {
    let backend = FakeBackend::new()
        .on_next(
            Operation::CreateFirewallRule,
            Behavior::Reject("rule quota exceeded".into()),
        )
        .on_next(Operation::ReleaseAddress, Behavior::Reject("address locked".into()));
    let nodes = lifecycle(&backend);

    let err = nodes.create_node(&nat_node("web-1")).await.unwrap_err();

    let CreateNodeError::PartialRollback(failure) = &err else {
        panic!("expected a partial rollback, got {err:?}");
    };
    // The original cause is reported, not the compensation error.
    assert!(failure.cause.to_string().contains("rule quota exceeded"));
    assert!(!failure.rollback.is_complete());
    assert!(failure.to_string().contains("manual cleanup required for: allocate-address"));
    assert!(err.needs_manual_cleanup());

    // Unwinding carried on past the failed release.
    assert!(backend.instances().is_empty());
    assert_eq!(backend.addresses().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_creates_share_one_security_group() {
    let backend = FakeBackend::new()
        .with_default(
            Operation::CreateSecurityGroup,
            Behavior::SucceedAfterDelay(Duration::from_millis(100)),
        )
        .with_default(
            Operation::CreateKeyPair,
            Behavior::SucceedAfterDelay(Duration::from_millis(100)),
        );
    let nodes = lifecycle(&backend);

    let specs: Vec<_> = (0..8)
        .map(|i| basic_node(&format!("web-{i}"), &[80, 22]))
        .collect();
    let results = join_all(specs.iter().map(|spec| nodes.create_node(spec))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.calls_of(Operation::CreateSecurityGroup).len(), 1);
    assert_eq!(backend.calls_of(Operation::CreateKeyPair).len(), 1);
    assert_eq!(backend.security_groups().len(), 1);
    assert_eq!(backend.security_groups()[0].ports, vec![22, 80]);
    assert_eq!(backend.instances().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn created_key_pair_keeps_its_private_key_past_the_ttl() {
    let config = OrchestratorConfig {
        key_pair_ttl_secs: Some(60),
        ..test_config()
    };
    let backend = FakeBackend::new();
    let nodes = lifecycle_with(&backend, &config);

    let first = nodes.create_node(&basic_node("web-1", &[])).await.unwrap();
    tokio::time::advance(Duration::from_secs(120)).await;
    let second = nodes.create_node(&basic_node("web-2", &[])).await.unwrap();

    assert!(first.credentials.private_key.is_some());
    assert_eq!(second.credentials.private_key, first.credentials.private_key);
    assert_eq!(backend.calls_of(Operation::CreateKeyPair).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn existing_security_group_is_reused() {
    let backend = FakeBackend::new().with_security_group("zone-1", "web-22-80", &[22, 80]);
    let nodes = lifecycle(&backend);

    nodes
        .create_node(&basic_node("web-1", &[80, 22]))
        .await
        .unwrap();

    assert!(backend.calls_of(Operation::CreateSecurityGroup).is_empty());
    assert_eq!(backend.security_groups().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn prerequisite_failure_creates_nothing_and_is_retried() {
    let backend = FakeBackend::new().on_next(
        Operation::CreateSecurityGroup,
        Behavior::Reject("permission denied".into()),
    );
    let nodes = lifecycle(&backend);

    let err = nodes
        .create_node(&basic_node("web-1", &[22]))
        .await
        .unwrap_err();
    assert!(matches!(err, CreateNodeError::Prerequisite { .. }));
    assert!(backend.calls_of(Operation::CreateInstance).is_empty());

    // A failed load isn't cached.
    nodes
        .create_node(&basic_node("web-1", &[22]))
        .await
        .unwrap();
    assert_eq!(backend.calls_of(Operation::CreateSecurityGroup).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn tag_failure_does_not_fail_creation() {
    let backend =
        FakeBackend::new().on_next(Operation::CreateTags, Behavior::Reject("tag limit".into()));
    let nodes = lifecycle(&backend);

    nodes.create_node(&nat_node("web-1")).await.unwrap();

    assert_eq!(backend.instances().len(), 1);
    assert!(backend.instances()[0].tags.is_empty());
}

#[tokio::test(start_paused = true)]
async fn job_timeout_fails_the_step() {
    let backend = FakeBackend::new().on_next(Operation::EnableStaticNat, Behavior::JobHangs);
    let nodes = lifecycle(&backend);

    let start = Instant::now();
    let err = nodes.create_node(&nat_node("web-1")).await.unwrap_err();

    assert_eq!(err.step_failure().unwrap().step, "enable-static-nat");
    assert!(start.elapsed() >= Duration::from_secs(test_config().job_timeout_secs));
    // NAT was applied by the hung job and undone by compensation.
    assert!(backend.is_clean());
}

#[tokio::test(start_paused = true)]
async fn invalid_spec_makes_no_backend_calls() {
    let backend = FakeBackend::new();
    let nodes = lifecycle(&backend);

    let err = nodes
        .create_node(&basic_node("", &[22]))
        .await
        .unwrap_err();

    assert!(matches!(err, CreateNodeError::InvalidSpec(_)));
    assert!(backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lanes_bound_concurrent_provisioning() {
    let config = OrchestratorConfig {
        lane_concurrency: 2,
        ..test_config()
    };
    let backend = FakeBackend::new().with_default(
        Operation::CreateInstance,
        Behavior::SucceedAfterDelay(Duration::from_millis(100)),
    );
    let nodes = lifecycle_with(&backend, &config);

    let mut specs: Vec<_> = (0..6)
        .map(|i| basic_node(&format!("a-{i}"), &[]))
        .collect();
    specs.extend((0..2).map(|i| {
        let mut spec = basic_node(&format!("b-{i}"), &[]);
        spec.partition = Partition::from("zone-2");
        spec
    }));

    let start = Instant::now();
    let results = join_all(specs.iter().map(|spec| nodes.create_node(spec))).await;

    assert!(results.iter().all(Result::is_ok));
    // Six nodes through two slots in zone-1; zone-2 runs alongside.
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn cancelled_while_queued_never_starts() {
    let config = OrchestratorConfig {
        lane_concurrency: 1,
        ..test_config()
    };
    let backend = FakeBackend::new().with_default(
        Operation::CreateInstance,
        Behavior::SucceedAfterDelay(Duration::from_secs(1)),
    );
    let nodes = lifecycle_with(&backend, &config);

    let first = basic_node("web-1", &[]);
    let second = basic_node("web-2", &[]);
    let (first, second) = tokio::join!(
        nodes.create_node(&first),
        nodes.create_node_with_cancel(&second, tokio::time::sleep(Duration::from_millis(100))),
    );

    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(CreateNodeError::Queue(QueueError::Cancelled { .. }))
    ));
    assert_eq!(backend.calls_of(Operation::CreateInstance).len(), 1);
}
