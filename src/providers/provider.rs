use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::job::JobHandle;
use crate::resources::{
    Address, AddressId, FirewallRule, ForwardingRule, Instance, InstanceId, InstanceRequest,
    KeyPair, Partition, RuleId, SecurityGroup, Volume, VolumeId, VolumeSpec,
};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The target resource doesn't exist (or no longer exists).
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Transport failure, throttling or a 5xx. Worth retrying.
    #[error("transient backend error: {message}")]
    Transient { message: String },

    /// The backend refused the request outright.
    /// Bad permissions, quota exceeded, invalid parameters, etc.
    #[error("request rejected: {message}")]
    Rejected { message: String },

    /// Underlying API/network error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A backend's answer to a mutating call: the resource identity, known immediately,
/// and the job still working on it, if the call was asynchronous.
#[derive(Debug, Clone)]
pub struct Accepted<T> {
    pub value: T,
    pub job: Option<JobHandle>,
}

impl<T> Accepted<T> {
    pub fn done(value: T) -> Self {
        Self { value, job: None }
    }

    pub fn pending(value: T, job: JobHandle) -> Self {
        Self {
            value,
            job: Some(job),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Accepted<U> {
        Accepted {
            value: f(self.value),
            job: self.job,
        }
    }
}

/// The operations a cloud backend exposes to the orchestrator.
///
/// Mutations either complete synchronously or hand back a [`JobHandle`] that the
/// caller resolves through a [`JobWaiter`](crate::job::JobWaiter). Deletes of a
/// resource that is already gone return [`ProviderError::NotFound`]; the
/// orchestrator decides whether that matters.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<Accepted<Instance>, ProviderError>;
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>, ProviderError>;
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;
    async fn delete_instance(&self, id: &InstanceId) -> Result<Option<JobHandle>, ProviderError>;
    async fn reboot_instance(&self, id: &InstanceId) -> Result<Option<JobHandle>, ProviderError>;
    async fn stop_instance(&self, id: &InstanceId) -> Result<Option<JobHandle>, ProviderError>;
    async fn start_instance(&self, id: &InstanceId) -> Result<Option<JobHandle>, ProviderError>;

    async fn create_volume(
        &self,
        partition: &Partition,
        spec: &VolumeSpec,
    ) -> Result<Accepted<Volume>, ProviderError>;
    async fn attach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
    ) -> Result<Option<JobHandle>, ProviderError>;
    async fn detach_volume(&self, volume: &VolumeId) -> Result<Option<JobHandle>, ProviderError>;
    async fn delete_volume(&self, volume: &VolumeId) -> Result<Option<JobHandle>, ProviderError>;
    /// Volumes attached to `instance`, plus detached ones it last owned.
    async fn list_volumes(&self, instance: &InstanceId) -> Result<Vec<Volume>, ProviderError>;

    async fn allocate_address(
        &self,
        partition: &Partition,
    ) -> Result<Accepted<Address>, ProviderError>;
    async fn release_address(&self, id: &AddressId) -> Result<Option<JobHandle>, ProviderError>;
    /// Public addresses associated with an instance, through static NAT or rules.
    async fn list_addresses(&self, instance: &InstanceId) -> Result<Vec<Address>, ProviderError>;
    async fn enable_static_nat(
        &self,
        address: &AddressId,
        instance: &InstanceId,
    ) -> Result<Option<JobHandle>, ProviderError>;
    async fn disable_static_nat(
        &self,
        address: &AddressId,
    ) -> Result<Option<JobHandle>, ProviderError>;

    async fn create_forwarding_rule(
        &self,
        address: &AddressId,
        instance: &InstanceId,
        port: u16,
    ) -> Result<Accepted<ForwardingRule>, ProviderError>;
    async fn delete_forwarding_rule(&self, id: &RuleId)
    -> Result<Option<JobHandle>, ProviderError>;
    async fn list_forwarding_rules(
        &self,
        address: &AddressId,
    ) -> Result<Vec<ForwardingRule>, ProviderError>;

    async fn create_firewall_rule(
        &self,
        address: &AddressId,
        port: u16,
    ) -> Result<Accepted<FirewallRule>, ProviderError>;
    async fn delete_firewall_rule(&self, id: &RuleId) -> Result<Option<JobHandle>, ProviderError>;
    async fn list_firewall_rules(
        &self,
        address: &AddressId,
    ) -> Result<Vec<FirewallRule>, ProviderError>;

    async fn find_security_group(
        &self,
        partition: &Partition,
        name: &str,
    ) -> Result<Option<SecurityGroup>, ProviderError>;
    async fn create_security_group(
        &self,
        partition: &Partition,
        name: &str,
        ports: &[u16],
    ) -> Result<Accepted<SecurityGroup>, ProviderError>;

    async fn find_key_pair(
        &self,
        partition: &Partition,
        name: &str,
    ) -> Result<Option<KeyPair>, ProviderError>;
    async fn create_key_pair(
        &self,
        partition: &Partition,
        name: &str,
    ) -> Result<Accepted<KeyPair>, ProviderError>;

    async fn create_tags(
        &self,
        instance: &InstanceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<JobHandle>, ProviderError>;
}
