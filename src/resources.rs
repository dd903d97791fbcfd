use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::network::NetworkKind;

/// Newtype wrappers. Each backend identifier gets its own type so an address id
/// can't be handed to a call that expects an instance id.
macro_rules! identifier {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub String);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(s: &str) -> Self {
                    Self(s.to_string())
                }
            }
        )*
    };
}

identifier!(
    InstanceId,
    VolumeId,
    AddressId,
    /// Forwarding and firewall rules share one id space on most backends.
    RuleId,
    SecurityGroupId,
    /// Isolation domain (zone, datacenter or region) used to scope queue lanes.
    Partition,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Stopped,
    Destroyed,
}

/// What the backend reports about a virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub group: String,
    pub partition: Partition,
    pub state: InstanceState,
    pub private_address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Everything the backend needs to boot an instance. Shared prerequisites are
/// already resolved by the time this is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub group: String,
    pub partition: Partition,
    pub image: String,
    pub size: String,
    pub key_pair: Option<String>,
    pub security_groups: Vec<SecurityGroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub size_gib: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub size_gib: u32,
    pub attached_to: Option<InstanceId>,
    /// Instance this volume was last attached to. Survives a detach, so a
    /// partly torn down node can still find its data volumes.
    pub owner: Option<InstanceId>,
}

/// A public address allocated in a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub ip: String,
    pub partition: Partition,
    /// Instance this address is associated with, through static NAT or rules.
    pub associated_with: Option<InstanceId>,
    pub static_nat: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: RuleId,
    pub address: AddressId,
    pub instance: InstanceId,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: RuleId,
    pub address: AddressId,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: SecurityGroupId,
    pub name: String,
    pub partition: Partition,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    pub name: String,
    pub fingerprint: String,
    /// Only present on the call that created the pair.
    pub private_key: Option<String>,
}

/// Cache key for a security group: name and port set are only unique within a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityGroupKey {
    pub partition: Partition,
    pub name: String,
    pub ports: Vec<u16>,
}

impl SecurityGroupKey {
    /// Ports are sorted and deduplicated so `[22, 80]` and `[80, 22, 22]` share an entry.
    pub fn new(partition: Partition, name: impl Into<String>, ports: &[u16]) -> Self {
        let mut ports = ports.to_vec();
        ports.sort_unstable();
        ports.dedup();
        Self {
            partition,
            name: name.into(),
            ports,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPairKey {
    pub partition: Partition,
    pub name: String,
}

/// A caller's request for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub group: String,
    pub name: String,
    pub partition: Partition,
    pub image: String,
    pub size: String,
    pub network: NetworkKind,
    /// Existing key pair to use. When absent, a per-group pair is found or created.
    #[serde(default)]
    pub key_pair: Option<String>,
    #[serde(default)]
    pub inbound_ports: Vec<u16>,
    #[serde(default)]
    pub public_address: bool,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NodeSpec {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        partition: impl Into<String>,
        network: NetworkKind,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            partition: Partition(partition.into()),
            image: "default".into(),
            size: "small".into(),
            network,
            key_pair: None,
            inbound_ports: Vec::new(),
            public_address: false,
            volumes: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.inbound_ports = ports.to_vec();
        self
    }

    pub fn with_public_address(mut self) -> Self {
        self.public_address = true;
        self
    }

    pub fn with_volume(mut self, name: impl Into<String>, size_gib: u32) -> Self {
        self.volumes.push(VolumeSpec {
            name: name.into(),
            size_gib,
        });
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_key_pair(mut self, name: impl Into<String>) -> Self {
        self.key_pair = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

/// The caller-facing identity of a provisioned node. The orchestrator keeps no copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: InstanceId,
    pub name: String,
    pub group: String,
    pub partition: Partition,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub credentials: Credentials,
}
