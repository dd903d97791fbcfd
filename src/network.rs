use serde::{Deserialize, Serialize};

use crate::resources::NodeSpec;

/// How a partition's network is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkKind {
    /// Flat shared network. Inbound access goes through security groups.
    Basic,
    /// Isolated network behind a virtual router. Public access maps a
    /// dedicated address one-to-one onto the instance.
    Advanced,
    /// Isolated network where public ports are forwarded individually.
    AdvancedPortForwarding,
}

/// How requested ports reach an instance on a public address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    None,
    StaticNat,
    PortForwarding,
}

/// What the network layer needs for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Ports opened through a shared security group.
    pub security_group_ports: Vec<u16>,
    pub allocate_address: bool,
    pub exposure: Exposure,
    /// Ports opened on the public address (firewall, plus forwarding when applicable).
    pub exposed_ports: Vec<u16>,
}

type Strategy = fn(&NodeSpec) -> NetworkOptions;

const STRATEGIES: [(NetworkKind, Strategy); 3] = [
    (NetworkKind::Basic, basic),
    (NetworkKind::Advanced, advanced_static_nat),
    (NetworkKind::AdvancedPortForwarding, advanced_port_forwarding),
];

/// Look up the network layout for `spec`.
pub fn network_options(spec: &NodeSpec) -> NetworkOptions {
    let strategy = STRATEGIES
        .iter()
        .find(|(kind, _)| *kind == spec.network)
        .map(|(_, strategy)| *strategy)
        .unwrap_or(basic);
    strategy(spec)
}

fn sorted_ports(spec: &NodeSpec) -> Vec<u16> {
    let mut ports = spec.inbound_ports.clone();
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn basic(spec: &NodeSpec) -> NetworkOptions {
    NetworkOptions {
        security_group_ports: sorted_ports(spec),
        allocate_address: false,
        exposure: Exposure::None,
        exposed_ports: Vec::new(),
    }
}

fn advanced_static_nat(spec: &NodeSpec) -> NetworkOptions {
    if !spec.public_address {
        return NetworkOptions {
            security_group_ports: Vec::new(),
            allocate_address: false,
            exposure: Exposure::None,
            exposed_ports: Vec::new(),
        };
    }
    NetworkOptions {
        security_group_ports: Vec::new(),
        allocate_address: true,
        exposure: Exposure::StaticNat,
        exposed_ports: sorted_ports(spec),
    }
}

fn advanced_port_forwarding(spec: &NodeSpec) -> NetworkOptions {
    let ports = sorted_ports(spec);
    // Forwarding needs somewhere to forward from.
    let allocate_address = spec.public_address || !ports.is_empty();
    NetworkOptions {
        security_group_ports: Vec::new(),
        allocate_address,
        exposure: if allocate_address {
            Exposure::PortForwarding
        } else {
            Exposure::None
        },
        exposed_ports: ports,
    }
}
