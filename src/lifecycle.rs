//! Public entry point for node lifecycle operations.
//!
//! `create_node` resolves shared prerequisites through the single-flight
//! caches, builds a [`ProvisioningPlan`], and runs it through the
//! [`ProvisioningPipeline`] once the partition's queue lane admits it.
//! `destroy_node` tears resources down in dependency order and keeps going
//! past individual failures.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::SingleFlightCache;
use crate::config::OrchestratorConfig;
use crate::job::{JobHandle, JobStatusClient, JobWaiter};
use crate::network::{Exposure, NetworkOptions, network_options};
use crate::pipeline::{
    PlanReport, ProvisioningPipeline, ProvisioningPlan, ProvisioningStep, StepError, StepFailure,
    StepResults,
};
use crate::providers::provider::{Accepted, ProviderError, ResourceBackend};
use crate::queue::{ProvisioningQueue, QueueError};
use crate::resources::{
    Address, AddressId, Credentials, FirewallRule, ForwardingRule, Instance, InstanceId,
    InstanceRequest, KeyPair, KeyPairKey, NodeRecord, NodeSpec, Partition, SecurityGroup,
    SecurityGroupKey, Volume, VolumeSpec,
};

pub type KeyPairCache = SingleFlightCache<KeyPairKey, KeyPair, StepError>;
pub type SecurityGroupCache = SingleFlightCache<SecurityGroupKey, SecurityGroup, StepError>;

pub const CREATE_INSTANCE: &str = "create-instance";
pub const ALLOCATE_ADDRESS: &str = "allocate-address";
pub const ENABLE_STATIC_NAT: &str = "enable-static-nat";
pub const CREATE_TAGS: &str = "create-tags";

/// Tag written on every node so its group survives outside the orchestrator.
pub const GROUP_TAG: &str = "provision/group";

const DEFAULT_LOGIN_USER: &str = "root";

#[derive(Debug, thiserror::Error)]
pub enum CreateNodeError {
    #[error("invalid node spec: {0}")]
    InvalidSpec(String),

    /// A shared key pair or security group couldn't be resolved. Nothing was created.
    #[error("could not resolve {resource}: {source}")]
    Prerequisite {
        resource: String,
        #[source]
        source: Arc<StepError>,
    },

    /// A step failed and everything created before it was removed.
    #[error("node creation failed and was rolled back: {0}")]
    RolledBack(#[source] StepFailure),

    /// A step failed and some created resources could not be removed.
    #[error("node creation failed, rollback incomplete: {0}")]
    PartialRollback(#[source] StepFailure),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The plan finished but its results couldn't be read back.
    #[error("node {node} provisioned but its record could not be assembled: {source}")]
    Assembly {
        node: String,
        #[source]
        source: StepError,
    },
}

impl CreateNodeError {
    /// The failing step, for step failures.
    pub fn step_failure(&self) -> Option<&StepFailure> {
        match self {
            Self::RolledBack(failure) | Self::PartialRollback(failure) => Some(failure),
            _ => None,
        }
    }

    /// True when a failure may have left resources behind.
    pub fn needs_manual_cleanup(&self) -> bool {
        matches!(self, Self::PartialRollback(_) | Self::Assembly { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    pub action: &'static str,
    pub target: String,
    pub removal: Removal,
}

#[derive(Debug, thiserror::Error)]
#[error("{action} {target} failed: {error}")]
pub struct TeardownFailure {
    pub action: &'static str,
    pub target: String,
    #[source]
    pub error: StepError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub node: InstanceId,
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    pub fn removed(&self, action: &str) -> usize {
        self.steps
            .iter()
            .filter(|s| s.action == action && s.removal == Removal::Removed)
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("teardown of node {node} incomplete, {} step(s) failed: {}", .failures.len(), summarize(.failures))]
pub struct DestroyNodeError {
    pub node: InstanceId,
    pub failures: Vec<TeardownFailure>,
    /// Steps that did complete.
    pub report: TeardownReport,
}

fn summarize(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{operation} of node {node} failed: {source}")]
    Operation {
        operation: &'static str,
        node: InstanceId,
        #[source]
        source: StepError,
    },

    #[error(transparent)]
    Backend(#[from] ProviderError),
}

/// Accumulates teardown progress without stopping at the first failure.
struct Teardown {
    report: TeardownReport,
    failures: Vec<TeardownFailure>,
}

impl Teardown {
    fn new(node: &InstanceId) -> Self {
        Self {
            report: TeardownReport {
                node: node.clone(),
                steps: Vec::new(),
            },
            failures: Vec::new(),
        }
    }

    fn record(
        &mut self,
        action: &'static str,
        target: impl ToString,
        outcome: Result<Removal, StepError>,
    ) {
        let target = target.to_string();
        match outcome {
            Ok(removal) => {
                if removal == Removal::AlreadyAbsent {
                    debug!(node = %self.report.node, action, %target, "already absent");
                } else {
                    info!(node = %self.report.node, action, %target, "removed");
                }
                self.report.steps.push(TeardownStep {
                    action,
                    target,
                    removal,
                });
            }
            Err(error) => {
                warn!(node = %self.report.node, action, %target, %error, "teardown step failed");
                self.failures.push(TeardownFailure {
                    action,
                    target,
                    error,
                });
            }
        }
    }

    /// Unwraps a lookup, recording a failure and substituting an empty list on error.
    fn listed<T>(
        &mut self,
        action: &'static str,
        target: impl ToString,
        listed: Result<Vec<T>, ProviderError>,
    ) -> Vec<T> {
        match listed {
            Ok(items) => items,
            Err(error) => {
                self.record(action, target, Err(error.into()));
                Vec::new()
            }
        }
    }

    fn finish(self) -> Result<TeardownReport, DestroyNodeError> {
        if self.failures.is_empty() {
            Ok(self.report)
        } else {
            Err(DestroyNodeError {
                node: self.report.node.clone(),
                failures: self.failures,
                report: self.report,
            })
        }
    }
}

/// Creates, destroys and manages nodes against one backend.
///
/// The caches are owned by whoever builds this value. Share them between
/// facades with [`with_caches`](Self::with_caches) when several need to
/// agree on the same key pairs and security groups.
pub struct NodeLifecycle {
    backend: Arc<dyn ResourceBackend>,
    waiter: JobWaiter,
    pipeline: ProvisioningPipeline,
    queue: Arc<ProvisioningQueue>,
    key_pairs: Arc<KeyPairCache>,
    security_groups: Arc<SecurityGroupCache>,
}

impl NodeLifecycle {
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        jobs: Arc<dyn JobStatusClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        let waiter = JobWaiter::new(jobs, config.wait_policy());
        Self {
            backend,
            pipeline: ProvisioningPipeline::new(waiter.clone()),
            waiter,
            queue: Arc::new(ProvisioningQueue::new(config.lane_concurrency)),
            // The backend only reveals a private key at creation, so a reload would lose it.
            key_pairs: Arc::new(
                KeyPairCache::new("key pair")
                    .with_ttl(config.key_pair_ttl())
                    .with_pinned(|key_pair| key_pair.private_key.is_some()),
            ),
            security_groups: Arc::new(
                SecurityGroupCache::new("security group").with_ttl(config.security_group_ttl()),
            ),
        }
    }

    pub fn with_caches(
        mut self,
        key_pairs: Arc<KeyPairCache>,
        security_groups: Arc<SecurityGroupCache>,
    ) -> Self {
        self.key_pairs = key_pairs;
        self.security_groups = security_groups;
        self
    }

    pub fn with_queue(mut self, queue: Arc<ProvisioningQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn queue(&self) -> &ProvisioningQueue {
        &self.queue
    }

    pub fn security_groups(&self) -> &SecurityGroupCache {
        &self.security_groups
    }

    pub fn key_pairs(&self) -> &KeyPairCache {
        &self.key_pairs
    }

    pub async fn create_node(&self, spec: &NodeSpec) -> Result<NodeRecord, CreateNodeError> {
        self.create_node_with_cancel(spec, std::future::pending::<()>())
            .await
    }

    /// Like [`create_node`](Self::create_node), abandoning the request if
    /// `cancel` resolves while it waits for a queue slot. Once the plan is
    /// running, cancellation no longer applies; destroy the node instead.
    pub async fn create_node_with_cancel<C>(
        &self,
        spec: &NodeSpec,
        cancel: C,
    ) -> Result<NodeRecord, CreateNodeError>
    where
        C: Future<Output = ()>,
    {
        validate(spec)?;
        let options = network_options(spec);

        let key_pair = self.resolve_key_pair(spec).await.inspect_err(|e| {
            warn!(group = %spec.group, node = %spec.name, error = %e, "prerequisite failed");
        })?;
        let security_group = self
            .resolve_security_group(spec, &options)
            .await
            .inspect_err(|e| {
                warn!(group = %spec.group, node = %spec.name, error = %e, "prerequisite failed");
            })?;

        let plan = self.build_plan(spec, &options, &key_pair, security_group.as_ref());
        info!(group = %spec.group, node = %spec.name, partition = %spec.partition, steps = ?plan.step_names(), "submitting plan");

        let pipeline = &self.pipeline;
        let outcome = self
            .queue
            .submit_with_cancel(&spec.partition, cancel, || pipeline.execute(plan))
            .await?;

        match outcome {
            Ok(report) => {
                for (step, error) in &report.skipped {
                    warn!(node = %spec.name, %step, %error, "best-effort step skipped");
                }
                let record = assemble(spec, &key_pair, &report).map_err(|source| {
                    CreateNodeError::Assembly {
                        node: spec.name.clone(),
                        source,
                    }
                })?;
                info!(node = %record.name, id = %record.id, "node created");
                Ok(record)
            }
            Err(failure) if failure.rollback.is_complete() => {
                warn!(node = %spec.name, step = %failure.step, error = %failure.cause, "node creation failed, rolled back");
                Err(CreateNodeError::RolledBack(failure))
            }
            Err(failure) => {
                error!(node = %spec.name, step = %failure.step, error = %failure, "node creation failed, rollback incomplete");
                Err(CreateNodeError::PartialRollback(failure))
            }
        }
    }

    /// Tear a node down: forwarding rules, firewall rules, static NAT,
    /// addresses, the instance, then its data volumes. Resources that are
    /// already gone count as removed. Every step is attempted even when
    /// earlier ones fail.
    pub async fn destroy_node(&self, id: &InstanceId) -> Result<TeardownReport, DestroyNodeError> {
        info!(node = %id, "destroying node");
        let mut teardown = Teardown::new(id);

        let volumes = teardown.listed("list-volumes", id, self.backend.list_volumes(id).await);
        let addresses =
            teardown.listed("list-addresses", id, self.backend.list_addresses(id).await);

        for address in &addresses {
            let rules = teardown.listed(
                "list-forwarding-rules",
                &address.id,
                self.backend.list_forwarding_rules(&address.id).await,
            );
            for rule in rules {
                let outcome = self
                    .settle_removal(self.backend.delete_forwarding_rule(&rule.id).await)
                    .await;
                teardown.record("delete-forwarding-rule", &rule.id, outcome);
            }
        }

        for address in &addresses {
            let rules = teardown.listed(
                "list-firewall-rules",
                &address.id,
                self.backend.list_firewall_rules(&address.id).await,
            );
            for rule in rules {
                let outcome = self
                    .settle_removal(self.backend.delete_firewall_rule(&rule.id).await)
                    .await;
                teardown.record("delete-firewall-rule", &rule.id, outcome);
            }
        }

        for address in addresses.iter().filter(|a| a.static_nat) {
            let outcome = self
                .settle_removal(self.backend.disable_static_nat(&address.id).await)
                .await;
            teardown.record("disable-static-nat", &address.id, outcome);
        }

        for address in &addresses {
            let outcome = self
                .settle_removal(self.backend.release_address(&address.id).await)
                .await;
            teardown.record("release-address", &address.id, outcome);
        }

        let outcome = self
            .settle_removal(self.backend.delete_instance(id).await)
            .await;
        if matches!(outcome, Ok(Removal::AlreadyAbsent)) {
            info!(node = %id, "instance already absent");
        }
        teardown.record("delete-instance", id, outcome);

        for volume in &volumes {
            let outcome = self
                .settle_removal(self.backend.delete_volume(&volume.id).await)
                .await;
            teardown.record("delete-volume", &volume.id, outcome);
        }

        teardown.finish().inspect_err(|e| error!(node = %id, error = %e, "destroy incomplete"))
    }

    pub async fn reboot_node(&self, id: &InstanceId) -> Result<(), LifecycleError> {
        let call = self.backend.reboot_instance(id).await;
        self.single_step("reboot", id, call).await
    }

    pub async fn suspend_node(&self, id: &InstanceId) -> Result<(), LifecycleError> {
        let call = self.backend.stop_instance(id).await;
        self.single_step("suspend", id, call).await
    }

    pub async fn resume_node(&self, id: &InstanceId) -> Result<(), LifecycleError> {
        let call = self.backend.start_instance(id).await;
        self.single_step("resume", id, call).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Instance>, LifecycleError> {
        Ok(self.backend.list_instances().await?)
    }

    pub async fn list_nodes_in_group(&self, group: &str) -> Result<Vec<Instance>, LifecycleError> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|i| i.group == group)
            .collect())
    }

    pub async fn get_node(&self, id: &InstanceId) -> Result<Option<Instance>, LifecycleError> {
        Ok(self.backend.get_instance(id).await?)
    }

    /// A missing job handle means the call finished synchronously, or there was nothing to do.
    async fn single_step(
        &self,
        operation: &'static str,
        id: &InstanceId,
        call: Result<Option<JobHandle>, ProviderError>,
    ) -> Result<(), LifecycleError> {
        let result = match call {
            Ok(None) => Ok(()),
            Ok(Some(job)) => self
                .waiter
                .wait_for(&job)
                .await
                .into_result()
                .map(drop)
                .map_err(StepError::from),
            Err(e) => Err(StepError::from(e)),
        };
        result
            .inspect(|_| info!(node = %id, operation, "done"))
            .map_err(|source| {
                warn!(node = %id, operation, error = %source, "operation failed");
                LifecycleError::Operation {
                    operation,
                    node: id.clone(),
                    source,
                }
            })
    }

    async fn settle_removal(
        &self,
        call: Result<Option<JobHandle>, ProviderError>,
    ) -> Result<Removal, StepError> {
        match call {
            Ok(None) => Ok(Removal::Removed),
            Ok(Some(job)) => {
                self.waiter.wait_for(&job).await.into_result()?;
                Ok(Removal::Removed)
            }
            Err(e) if e.is_not_found() => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }

    async fn settle_creation<T>(&self, accepted: Accepted<T>) -> Result<T, StepError> {
        if let Some(job) = &accepted.job {
            self.waiter.wait_for(job).await.into_result()?;
        }
        Ok(accepted.value)
    }

    async fn resolve_key_pair(&self, spec: &NodeSpec) -> Result<KeyPair, CreateNodeError> {
        let name = spec
            .key_pair
            .clone()
            .unwrap_or_else(|| format!("{}-key", spec.group));
        let key = KeyPairKey {
            partition: spec.partition.clone(),
            name: name.clone(),
        };
        self.key_pairs
            .get_or_create(key, || self.find_or_create_key_pair(&spec.partition, &name))
            .await
            .map_err(|source| CreateNodeError::Prerequisite {
                resource: format!("key pair {name}"),
                source,
            })
    }

    async fn find_or_create_key_pair(
        &self,
        partition: &Partition,
        name: &str,
    ) -> Result<KeyPair, StepError> {
        if let Some(existing) = self.backend.find_key_pair(partition, name).await? {
            info!(%partition, name, "using existing key pair");
            return Ok(existing);
        }
        info!(%partition, name, "creating key pair");
        let accepted = self.backend.create_key_pair(partition, name).await?;
        self.settle_creation(accepted).await
    }

    async fn resolve_security_group(
        &self,
        spec: &NodeSpec,
        options: &NetworkOptions,
    ) -> Result<Option<SecurityGroup>, CreateNodeError> {
        if options.security_group_ports.is_empty() {
            return Ok(None);
        }
        let ports = &options.security_group_ports;
        let name = security_group_name(&spec.group, ports);
        let key = SecurityGroupKey::new(spec.partition.clone(), name.clone(), ports);
        self.security_groups
            .get_or_create(key, || {
                self.find_or_create_security_group(&spec.partition, &name, ports)
            })
            .await
            .map(Some)
            .map_err(|source| CreateNodeError::Prerequisite {
                resource: format!("security group {name}"),
                source,
            })
    }

    async fn find_or_create_security_group(
        &self,
        partition: &Partition,
        name: &str,
        ports: &[u16],
    ) -> Result<SecurityGroup, StepError> {
        if let Some(existing) = self.backend.find_security_group(partition, name).await? {
            info!(%partition, name, "using existing security group");
            return Ok(existing);
        }
        info!(%partition, name, ?ports, "creating security group");
        let accepted = self
            .backend
            .create_security_group(partition, name, ports)
            .await?;
        self.settle_creation(accepted).await
    }

    /// Steps, in order: instance, data volumes, public address, NAT or
    /// forwarding, firewall rules, tags (best effort).
    fn build_plan(
        &self,
        spec: &NodeSpec,
        options: &NetworkOptions,
        key_pair: &KeyPair,
        security_group: Option<&SecurityGroup>,
    ) -> ProvisioningPlan {
        let mut plan = ProvisioningPlan::new(&spec.group, &spec.name);
        let backend = &self.backend;

        let request = InstanceRequest {
            name: spec.name.clone(),
            group: spec.group.clone(),
            partition: spec.partition.clone(),
            image: spec.image.clone(),
            size: spec.size.clone(),
            key_pair: Some(key_pair.name.clone()),
            security_groups: security_group.map(|g| g.id.clone()).into_iter().collect(),
        };
        plan.push(
            ProvisioningStep::new(CREATE_INSTANCE, {
                let backend = backend.clone();
                move |_| create_instance(backend, request)
            })
            .with_compensation({
                let backend = backend.clone();
                move |value| delete_instance(backend, value)
            }),
        );

        for volume in &spec.volumes {
            let create = format!("create-volume:{}", volume.name);
            plan.push(
                ProvisioningStep::new(create.clone(), {
                    let backend = backend.clone();
                    let partition = spec.partition.clone();
                    let volume = volume.clone();
                    move |_| create_volume(backend, partition, volume)
                })
                .with_compensation({
                    let backend = backend.clone();
                    move |value| delete_volume(backend, value)
                }),
            );
            plan.push(
                ProvisioningStep::new(format!("attach-volume:{}", volume.name), {
                    let backend = backend.clone();
                    move |results| attach_volume(backend, results, create)
                })
                .with_compensation({
                    let backend = backend.clone();
                    move |value| detach_volume(backend, value)
                }),
            );
        }

        if options.allocate_address {
            plan.push(
                ProvisioningStep::new(ALLOCATE_ADDRESS, {
                    let backend = backend.clone();
                    let partition = spec.partition.clone();
                    move |_| allocate_address(backend, partition)
                })
                .with_compensation({
                    let backend = backend.clone();
                    move |value| release_address(backend, value)
                }),
            );
        }

        if options.exposure == Exposure::StaticNat {
            plan.push(
                ProvisioningStep::new(ENABLE_STATIC_NAT, {
                    let backend = backend.clone();
                    move |results| enable_static_nat(backend, results)
                })
                .with_compensation({
                    let backend = backend.clone();
                    move |value| disable_static_nat(backend, value)
                }),
            );
        }

        if options.exposure != Exposure::None {
            for &port in &options.exposed_ports {
                if options.exposure == Exposure::PortForwarding {
                    plan.push(
                        ProvisioningStep::new(format!("create-forwarding-rule:{port}"), {
                            let backend = backend.clone();
                            move |results| create_forwarding_rule(backend, results, port)
                        })
                        .with_compensation({
                            let backend = backend.clone();
                            move |value| delete_forwarding_rule(backend, value)
                        }),
                    );
                }
                plan.push(
                    ProvisioningStep::new(format!("create-firewall-rule:{port}"), {
                        let backend = backend.clone();
                        move |results| create_firewall_rule(backend, results, port)
                    })
                    .with_compensation({
                        let backend = backend.clone();
                        move |value| delete_firewall_rule(backend, value)
                    }),
                );
            }
        }

        let mut tags = spec.tags.clone();
        tags.insert(GROUP_TAG.to_string(), spec.group.clone());
        plan.push(
            ProvisioningStep::new(CREATE_TAGS, {
                let backend = backend.clone();
                move |results| create_tags(backend, results, tags)
            })
            .best_effort(),
        );

        plan
    }
}

fn validate(spec: &NodeSpec) -> Result<(), CreateNodeError> {
    if spec.group.trim().is_empty() {
        return Err(CreateNodeError::InvalidSpec("group must not be empty".into()));
    }
    if spec.name.trim().is_empty() {
        return Err(CreateNodeError::InvalidSpec("name must not be empty".into()));
    }
    if spec.partition.0.trim().is_empty() {
        return Err(CreateNodeError::InvalidSpec(
            "partition must not be empty".into(),
        ));
    }
    if spec.inbound_ports.contains(&0) {
        return Err(CreateNodeError::InvalidSpec("port 0 is not valid".into()));
    }
    let mut names: Vec<_> = spec.volumes.iter().map(|v| v.name.as_str()).collect();
    names.sort_unstable();
    if names.windows(2).any(|w| w[0] == w[1]) {
        return Err(CreateNodeError::InvalidSpec(
            "volume names must be unique".into(),
        ));
    }
    Ok(())
}

fn security_group_name(group: &str, ports: &[u16]) -> String {
    let ports: Vec<_> = ports.iter().map(u16::to_string).collect();
    format!("{group}-{}", ports.join("-"))
}

fn assemble(
    spec: &NodeSpec,
    key_pair: &KeyPair,
    report: &PlanReport,
) -> Result<NodeRecord, StepError> {
    let instance: Instance = report.results.get(CREATE_INSTANCE)?;
    let password = report
        .results
        .payload(CREATE_INSTANCE)
        .and_then(|p| p.get("password"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let public_address = if report.results.contains(ALLOCATE_ADDRESS) {
        Some(report.results.get::<Address>(ALLOCATE_ADDRESS)?.ip)
    } else {
        None
    };
    Ok(NodeRecord {
        id: instance.id,
        name: instance.name,
        group: spec.group.clone(),
        partition: instance.partition,
        public_address,
        private_address: instance.private_address,
        credentials: Credentials {
            user: DEFAULT_LOGIN_USER.to_string(),
            password,
            private_key: key_pair.private_key.clone(),
        },
    })
}

// ── Step actions ─────────────────────────────────────────────────────
//
// Owned arguments only: each runs as a 'static future inside the pipeline.

fn encode<T: Serialize>(accepted: Accepted<T>) -> Result<Accepted<Value>, ProviderError> {
    let job = accepted.job;
    let value = serde_json::to_value(accepted.value).map_err(anyhow::Error::from)?;
    Ok(Accepted { value, job })
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ProviderError> {
    Ok(serde_json::from_value(value).map_err(anyhow::Error::from)?)
}

fn lookup<T: DeserializeOwned>(results: &StepResults, step: &str) -> Result<T, ProviderError> {
    results.get(step).map_err(|e| anyhow::Error::from(e).into())
}

async fn create_instance(
    backend: Arc<dyn ResourceBackend>,
    request: InstanceRequest,
) -> Result<Accepted<Value>, ProviderError> {
    encode(backend.create_instance(&request).await?)
}

async fn delete_instance(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let instance: Instance = decode(value)?;
    backend.delete_instance(&instance.id).await
}

async fn create_volume(
    backend: Arc<dyn ResourceBackend>,
    partition: Partition,
    spec: VolumeSpec,
) -> Result<Accepted<Value>, ProviderError> {
    encode(backend.create_volume(&partition, &spec).await?)
}

async fn delete_volume(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let volume: Volume = decode(value)?;
    backend.delete_volume(&volume.id).await
}

async fn attach_volume(
    backend: Arc<dyn ResourceBackend>,
    results: StepResults,
    create_step: String,
) -> Result<Accepted<Value>, ProviderError> {
    let instance: Instance = lookup(&results, CREATE_INSTANCE)?;
    let volume: Volume = lookup(&results, &create_step)?;
    let job = backend.attach_volume(&volume.id, &instance.id).await?;
    encode(Accepted {
        value: volume.id,
        job,
    })
}

async fn detach_volume(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let volume = decode(value)?;
    backend.detach_volume(&volume).await
}

async fn allocate_address(
    backend: Arc<dyn ResourceBackend>,
    partition: Partition,
) -> Result<Accepted<Value>, ProviderError> {
    encode(backend.allocate_address(&partition).await?)
}

async fn release_address(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let address: Address = decode(value)?;
    backend.release_address(&address.id).await
}

async fn enable_static_nat(
    backend: Arc<dyn ResourceBackend>,
    results: StepResults,
) -> Result<Accepted<Value>, ProviderError> {
    let instance: Instance = lookup(&results, CREATE_INSTANCE)?;
    let address: Address = lookup(&results, ALLOCATE_ADDRESS)?;
    let job = backend.enable_static_nat(&address.id, &instance.id).await?;
    encode(Accepted {
        value: address.id,
        job,
    })
}

async fn disable_static_nat(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let address: AddressId = decode(value)?;
    backend.disable_static_nat(&address).await
}

async fn create_forwarding_rule(
    backend: Arc<dyn ResourceBackend>,
    results: StepResults,
    port: u16,
) -> Result<Accepted<Value>, ProviderError> {
    let instance: Instance = lookup(&results, CREATE_INSTANCE)?;
    let address: Address = lookup(&results, ALLOCATE_ADDRESS)?;
    encode(
        backend
            .create_forwarding_rule(&address.id, &instance.id, port)
            .await?,
    )
}

async fn delete_forwarding_rule(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let rule: ForwardingRule = decode(value)?;
    backend.delete_forwarding_rule(&rule.id).await
}

async fn create_firewall_rule(
    backend: Arc<dyn ResourceBackend>,
    results: StepResults,
    port: u16,
) -> Result<Accepted<Value>, ProviderError> {
    let address: Address = lookup(&results, ALLOCATE_ADDRESS)?;
    encode(backend.create_firewall_rule(&address.id, port).await?)
}

async fn delete_firewall_rule(
    backend: Arc<dyn ResourceBackend>,
    value: Value,
) -> Result<Option<JobHandle>, ProviderError> {
    let rule: FirewallRule = decode(value)?;
    backend.delete_firewall_rule(&rule.id).await
}

async fn create_tags(
    backend: Arc<dyn ResourceBackend>,
    results: StepResults,
    tags: BTreeMap<String, String>,
) -> Result<Accepted<Value>, ProviderError> {
    let instance: Instance = lookup(&results, CREATE_INSTANCE)?;
    let job = backend.create_tags(&instance.id, &tags).await?;
    encode(Accepted { value: tags, job })
}
