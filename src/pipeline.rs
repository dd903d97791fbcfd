//! Ordered resource creation with compensating rollback.
//!
//! A [`ProvisioningPlan`] is an ordered list of [`ProvisioningStep`]s for one
//! node. [`ProvisioningPipeline::execute`] runs them strictly in sequence,
//! waiting on any job a step hands back. When a required step fails, every
//! step that already succeeded is compensated in reverse order, and the
//! original failure is returned along with whether the unwind was complete.
//! A step whose request was accepted but whose job then failed or timed out
//! may have been applied anyway, so it is compensated first.
//!
//! State per plan:
//! `Pending → Running(i) → Succeeded | Compensating(i) → CompensationSucceeded | CompensationFailed`

use std::collections::BTreeMap;
use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::job::{JobError, JobHandle, JobWaiter, WaitPolicy};
use crate::providers::provider::{Accepted, ProviderError};

type Action = Box<
    dyn FnOnce(StepResults) -> BoxFuture<'static, Result<Accepted<Value>, ProviderError>> + Send,
>;
type Compensation =
    Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<Option<JobHandle>, ProviderError>> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Backend(#[from] ProviderError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("no result recorded for step {step}")]
    MissingResult { step: String },

    #[error("result of step {step} has an unexpected shape: {source}")]
    MalformedResult {
        step: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Values produced by the steps that ran so far, keyed by step name.
///
/// `values` holds what each action returned immediately (identifiers, mostly);
/// `payloads` holds what the step's job reported on completion, when it had one.
#[derive(Debug, Clone, Default)]
pub struct StepResults {
    values: BTreeMap<String, Value>,
    payloads: BTreeMap<String, Value>,
}

impl StepResults {
    pub fn value(&self, step: &str) -> Option<&Value> {
        self.values.get(step)
    }

    pub fn payload(&self, step: &str) -> Option<&Value> {
        self.payloads.get(step)
    }

    pub fn contains(&self, step: &str) -> bool {
        self.values.contains_key(step)
    }

    /// Deserialize the immediate value of `step`.
    pub fn get<T: DeserializeOwned>(&self, step: &str) -> Result<T, StepError> {
        let value = self.values.get(step).ok_or_else(|| StepError::MissingResult {
            step: step.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|source| StepError::MalformedResult {
            step: step.to_string(),
            source,
        })
    }
}

/// One resource-creation action and the action that undoes it.
pub struct ProvisioningStep {
    name: String,
    action: Action,
    compensate: Option<Compensation>,
    depends_on_prior_success: bool,
    wait: Option<WaitPolicy>,
}

impl ProvisioningStep {
    /// `action` receives the results of earlier steps and returns the created
    /// resource, plus a job handle if the backend is still working on it.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(StepResults) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Accepted<Value>, ProviderError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move |results| action(results).boxed()),
            compensate: None,
            depends_on_prior_success: true,
            wait: None,
        }
    }

    /// Undo for this step. Receives the value the action returned. It must
    /// tolerate the resource being gone already; `NotFound` counts as undone.
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<JobHandle>, ProviderError>> + Send + 'static,
    {
        self.compensate = Some(Box::new(move |value| compensate(value).boxed()));
        self
    }

    /// Failure of this step is recorded but doesn't roll back the plan.
    pub fn best_effort(mut self) -> Self {
        self.depends_on_prior_success = false;
        self
    }

    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_best_effort(&self) -> bool {
        !self.depends_on_prior_success
    }
}

impl std::fmt::Debug for ProvisioningStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningStep")
            .field("name", &self.name)
            .field("compensated", &self.compensate.is_some())
            .field("depends_on_prior_success", &self.depends_on_prior_success)
            .finish()
    }
}

struct CompletedStep {
    index: usize,
    name: String,
    value: Value,
    compensate: Option<Compensation>,
    wait: Option<WaitPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanState {
    Pending,
    Running(usize),
    Succeeded,
    Compensating(usize),
    CompensationSucceeded,
    CompensationFailed,
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running(i) => write!(f, "Running({i})"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Compensating(i) => write!(f, "Compensating({i})"),
            Self::CompensationSucceeded => write!(f, "CompensationSucceeded"),
            Self::CompensationFailed => write!(f, "CompensationFailed"),
        }
    }
}

/// The steps for one node, in execution order.
pub struct ProvisioningPlan {
    pub node_group: String,
    pub node_name: String,
    steps: Vec<ProvisioningStep>,
    completed: Vec<CompletedStep>,
    state: PlanState,
}

impl ProvisioningPlan {
    pub fn new(node_group: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            node_group: node_group.into(),
            node_name: node_name.into(),
            steps: Vec::new(),
            completed: Vec::new(),
            state: PlanState::Pending,
        }
    }

    pub fn step(mut self, step: ProvisioningStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: ProvisioningStep) {
        self.steps.push(step);
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(ProvisioningStep::name).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn state(&self) -> &PlanState {
        &self.state
    }

    /// Names of steps that succeeded and haven't been compensated, in execution order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.completed.iter().map(|c| c.name.as_str()).collect()
    }

    fn transition(&mut self, state: PlanState) {
        info!(group = %self.node_group, node = %self.node_name, from = %self.state, to = %state, "plan state");
        self.state = state;
    }
}

/// Result of a plan that ran to completion.
#[derive(Debug)]
pub struct PlanReport {
    pub node_group: String,
    pub node_name: String,
    pub results: StepResults,
    /// Best-effort steps that failed without rolling the plan back.
    pub skipped: Vec<(String, StepError)>,
}

#[derive(Debug, thiserror::Error)]
#[error("{step} failed")]
pub struct CompensationFailure {
    pub step: String,
    pub index: usize,
    #[source]
    pub error: StepError,
}

/// How far the unwind after a failure got.
#[derive(Debug)]
pub enum Rollback {
    /// Every completed step was compensated, in reverse order.
    Complete { compensated: Vec<String> },
    /// Some compensations failed; those resources may still exist.
    Incomplete {
        compensated: Vec<String>,
        failures: Vec<CompensationFailure>,
    },
}

impl Rollback {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn compensated(&self) -> &[String] {
        match self {
            Self::Complete { compensated } | Self::Incomplete { compensated, .. } => compensated,
        }
    }
}

impl std::fmt::Display for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { compensated } => {
                write!(f, "rolled back {} step(s)", compensated.len())
            }
            Self::Incomplete { failures, .. } => {
                let steps: Vec<_> = failures.iter().map(|c| c.step.as_str()).collect();
                write!(
                    f,
                    "rollback incomplete, manual cleanup required for: {}",
                    steps.join(", ")
                )
            }
        }
    }
}

/// A required step failed. Carries the original cause, never a compensation error.
#[derive(Debug, thiserror::Error)]
#[error("step {index} ({step}) of node {node} failed: {cause}; {rollback}")]
pub struct StepFailure {
    pub node: String,
    pub step: String,
    pub index: usize,
    #[source]
    pub cause: StepError,
    pub rollback: Rollback,
}

/// Why a step's action didn't succeed. `accepted` holds the value the backend
/// returned when it took the request but the job then failed or timed out.
struct ActionFailure {
    cause: StepError,
    accepted: Option<Value>,
}

impl ActionFailure {
    fn refused(error: ProviderError) -> Self {
        Self {
            cause: error.into(),
            accepted: None,
        }
    }
}

/// Fails the named step's action when the `pipeline-step` failpoint is configured with its name.
fn injected_failure(step: &str) -> Result<(), ProviderError> {
    fail::fail_point!("pipeline-step", |target: Option<String>| {
        if target.as_deref() == Some(step) {
            Err(ProviderError::Rejected {
                message: format!("injected failure at {step}"),
            })
        } else {
            Ok(())
        }
    });
    Ok(())
}

#[derive(Clone)]
pub struct ProvisioningPipeline {
    waiter: JobWaiter,
}

impl ProvisioningPipeline {
    pub fn new(waiter: JobWaiter) -> Self {
        Self { waiter }
    }

    pub async fn execute(&self, mut plan: ProvisioningPlan) -> Result<PlanReport, StepFailure> {
        let steps = std::mem::take(&mut plan.steps);
        let mut results = StepResults::default();
        let mut skipped = Vec::new();

        for (index, step) in steps.into_iter().enumerate() {
            plan.transition(PlanState::Running(index));
            let ProvisioningStep {
                name,
                action,
                compensate,
                depends_on_prior_success,
                wait,
            } = step;
            info!(node = %plan.node_name, step = %name, index, "step started");

            match self.run_action(&name, action, &results, wait.as_ref()).await {
                Ok((value, payload)) => {
                    info!(node = %plan.node_name, step = %name, index, "step succeeded");
                    results.values.insert(name.clone(), value.clone());
                    if let Some(payload) = payload {
                        results.payloads.insert(name.clone(), payload);
                    }
                    plan.completed.push(CompletedStep {
                        index,
                        name,
                        value,
                        compensate,
                        wait,
                    });
                }
                Err(ActionFailure { cause, accepted }) if !depends_on_prior_success => {
                    warn!(node = %plan.node_name, step = %name, index, error = %cause, "best-effort step failed, continuing");
                    if let (Some(value), Some(compensate)) = (accepted, compensate) {
                        if let Err(error) = self
                            .run_compensation(compensate, value, wait.as_ref())
                            .await
                        {
                            warn!(node = %plan.node_name, step = %name, index, %error, "best-effort step left behind");
                        }
                    }
                    skipped.push((name, cause));
                }
                Err(ActionFailure { cause, accepted }) => {
                    error!(node = %plan.node_name, step = %name, index, error = %cause, "step failed");
                    // A step whose job failed after acceptance unwinds first.
                    if let (Some(value), Some(compensate)) = (accepted, compensate) {
                        plan.completed.push(CompletedStep {
                            index,
                            name: name.clone(),
                            value,
                            compensate: Some(compensate),
                            wait,
                        });
                    }
                    plan.transition(PlanState::Compensating(index));
                    let rollback = self.compensate(&mut plan).await;
                    plan.transition(if rollback.is_complete() {
                        PlanState::CompensationSucceeded
                    } else {
                        PlanState::CompensationFailed
                    });
                    return Err(StepFailure {
                        node: plan.node_name,
                        step: name,
                        index,
                        cause,
                        rollback,
                    });
                }
            }
        }

        plan.transition(PlanState::Succeeded);
        Ok(PlanReport {
            node_group: plan.node_group,
            node_name: plan.node_name,
            results,
            skipped,
        })
    }

    async fn run_action(
        &self,
        name: &str,
        action: Action,
        results: &StepResults,
        wait: Option<&WaitPolicy>,
    ) -> Result<(Value, Option<Value>), ActionFailure> {
        injected_failure(name).map_err(ActionFailure::refused)?;
        let accepted = action(results.clone())
            .await
            .map_err(ActionFailure::refused)?;
        match accepted.job {
            None => Ok((accepted.value, None)),
            Some(job) => match self.await_job(&job, wait).await.into_result() {
                Ok(payload) => Ok((accepted.value, Some(payload))),
                // The backend took the request, so it may have applied it.
                Err(cause) => Err(ActionFailure {
                    cause: cause.into(),
                    accepted: Some(accepted.value),
                }),
            },
        }
    }

    async fn await_job(
        &self,
        job: &JobHandle,
        wait: Option<&WaitPolicy>,
    ) -> crate::job::JobOutcome {
        match wait {
            Some(policy) => self.waiter.wait_with(job, policy).await,
            None => self.waiter.wait_for(job).await,
        }
    }

    /// Unwind completed steps newest-first. Keeps going past failures.
    async fn compensate(&self, plan: &mut ProvisioningPlan) -> Rollback {
        info!(node = %plan.node_name, steps = plan.completed.len(), "compensation started");
        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        while let Some(done) = plan.completed.pop() {
            let CompletedStep {
                index,
                name,
                value,
                compensate,
                wait,
            } = done;
            let Some(compensate) = compensate else {
                compensated.push(name);
                continue;
            };

            match self.run_compensation(compensate, value, wait.as_ref()).await {
                Ok(()) => {
                    info!(node = %plan.node_name, step = %name, index, "compensation step succeeded");
                    compensated.push(name);
                }
                Err(error) => {
                    error!(node = %plan.node_name, step = %name, index, %error, "compensation step failed");
                    failures.push(CompensationFailure {
                        step: name,
                        index,
                        error,
                    });
                }
            }
        }

        info!(node = %plan.node_name, compensated = compensated.len(), failed = failures.len(), "compensation finished");
        if failures.is_empty() {
            Rollback::Complete { compensated }
        } else {
            Rollback::Incomplete {
                compensated,
                failures,
            }
        }
    }

    async fn run_compensation(
        &self,
        compensate: Compensation,
        value: Value,
        wait: Option<&WaitPolicy>,
    ) -> Result<(), StepError> {
        match compensate(value).await {
            Ok(None) => Ok(()),
            Ok(Some(job)) => {
                self.await_job(&job, wait).await.into_result()?;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
