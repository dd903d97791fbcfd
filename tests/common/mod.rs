use std::sync::Arc;

use provisionrs::config::OrchestratorConfig;
use provisionrs::lifecycle::NodeLifecycle;
use provisionrs::network::NetworkKind;
use provisionrs::providers::fake::FakeBackend;
use provisionrs::resources::NodeSpec;

/// Fast polling and a short job timeout, so paused-clock tests advance quickly.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        job_timeout_secs: 30,
        poll_interval_ms: 100,
        max_poll_interval_ms: 500,
        jitter: 0.0,
        ..OrchestratorConfig::default()
    }
}

pub fn lifecycle(backend: &FakeBackend) -> NodeLifecycle {
    lifecycle_with(backend, &test_config())
}

pub fn lifecycle_with(backend: &FakeBackend, config: &OrchestratorConfig) -> NodeLifecycle {
    NodeLifecycle::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        config,
    )
}

/// Static NAT node exposing one port: instance, address, NAT, firewall rule, tags.
pub fn nat_node(name: &str) -> NodeSpec {
    NodeSpec::new("web", name, "zone-1", NetworkKind::Advanced)
        .with_ports(&[22])
        .with_public_address()
}

pub fn forwarded_node(name: &str, ports: &[u16]) -> NodeSpec {
    NodeSpec::new("edge", name, "zone-1", NetworkKind::AdvancedPortForwarding).with_ports(ports)
}

pub fn basic_node(name: &str, ports: &[u16]) -> NodeSpec {
    NodeSpec::new("web", name, "zone-1", NetworkKind::Basic).with_ports(ports)
}

