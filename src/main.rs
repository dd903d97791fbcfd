use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use futures_util::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provisionrs::config::OrchestratorConfig;
use provisionrs::lifecycle::NodeLifecycle;
use provisionrs::network::NetworkKind;
use provisionrs::providers::fake::FakeBackend;
use provisionrs::resources::NodeSpec;

/// Provisions a small group against the in-memory backend, then tears it down.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::init_from_env().context("reading PROVISION_* settings")?;
    info!(?config, "starting");

    let backend = FakeBackend::new().all_async(2);
    let lifecycle = NodeLifecycle::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        &config,
    );

    let specs = vec![
        NodeSpec::new("web", "web-1", "zone-a", NetworkKind::Basic).with_ports(&[22, 80]),
        NodeSpec::new("web", "web-2", "zone-a", NetworkKind::Basic).with_ports(&[22, 80]),
        NodeSpec::new("db", "db-1", "zone-b", NetworkKind::Advanced)
            .with_ports(&[5432])
            .with_public_address()
            .with_volume("data", 50),
        NodeSpec::new("edge", "edge-1", "zone-b", NetworkKind::AdvancedPortForwarding)
            .with_ports(&[443])
            .with_tag("tier", "edge"),
    ];

    let created = join_all(specs.iter().map(|spec| lifecycle.create_node(spec))).await;
    let mut nodes = Vec::new();
    for result in created {
        match result {
            Ok(node) => {
                info!(id = %node.id, name = %node.name, public = ?node.public_address, "provisioned");
                nodes.push(node);
            }
            Err(e) => warn!(error = %e, "provisioning failed"),
        }
    }
    info!(
        security_groups = backend.security_groups().len(),
        key_pairs = backend.key_pairs().len(),
        "shared prerequisites"
    );

    if let Some(node) = nodes.first() {
        lifecycle.suspend_node(&node.id).await?;
        lifecycle.resume_node(&node.id).await?;
        lifecycle.reboot_node(&node.id).await?;
    }

    for node in &nodes {
        let report = lifecycle.destroy_node(&node.id).await?;
        info!(id = %node.id, steps = report.steps.len(), "destroyed");
    }

    lifecycle.queue().close();
    info!(clean = backend.is_clean(), "done");
    Ok(())
}
