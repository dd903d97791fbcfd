//! Turning a backend's asynchronous job into a completion signal.
//!
//! Backends answer slow mutations with a job id. [`JobWaiter`] polls a
//! [`JobStatusClient`] under an explicit [`WaitPolicy`] (timeout, backoff,
//! transient retry budget) until the job reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::providers::provider::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a job the backend accepted but hasn't finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub submitted_at: Instant,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: JobId(id.into()),
            submitted_at: Instant::now(),
        }
    }
}

/// What a backend says about a job right now.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Succeeded(Value),
    Failed(String),
}

#[async_trait]
pub trait JobStatusClient: Send + Sync {
    async fn status(&self, job: &JobId) -> Result<JobStatus, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {job} failed: {reason}")]
    Backend { job: JobId, reason: String },

    #[error("job {job} status unavailable after {attempts} attempt(s): {source}")]
    Transport {
        job: JobId,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("job {job} still pending after {waited:?}")]
    TimedOut { job: JobId, waited: Duration },
}

/// Terminal result of waiting on a job. Produced once per handle.
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(JobError),
    TimedOut { job: JobId, waited: Duration },
}

impl JobOutcome {
    /// For callers that treat a timeout as fatal.
    pub fn into_result(self) -> Result<Value, JobError> {
        match self {
            Self::Succeeded(payload) => Ok(payload),
            Self::Failed(e) => Err(e),
            Self::TimedOut { job, waited } => Err(JobError::TimedOut { job, waited }),
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// How long and how often to poll.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Upper bound for the backed-off interval.
    pub max_poll_interval: Duration,
    /// Interval multiplier applied after every pending poll. 1.0 disables backoff.
    pub backoff_factor: f64,
    /// Fraction of the interval added as random jitter, in `[0, 1]`.
    pub jitter: f64,
    /// Consecutive transient status errors tolerated before giving up.
    pub transient_retries: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.1,
            transient_retries: 3,
        }
    }
}

impl WaitPolicy {
    /// Fixed interval, no jitter. Handy for tests and for backends with strict rate limits.
    pub fn fixed(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            max_poll_interval: poll_interval,
            backoff_factor: 1.0,
            jitter: 0.0,
            transient_retries: 3,
        }
    }

    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    /// `f64::max` discards NaN, and a factor too large to represent lands on the cap.
    fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_poll_interval.max(self.poll_interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor.max(1.0))
            .unwrap_or(cap)
            .min(cap)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return interval;
        }
        let extra = interval.as_secs_f64() * rand::rng().random_range(0.0..=jitter);
        interval.saturating_add(Duration::try_from_secs_f64(extra).unwrap_or_default())
    }
}

/// Polls a [`JobStatusClient`] until a job reaches a terminal state or its deadline.
#[derive(Clone)]
pub struct JobWaiter {
    client: Arc<dyn JobStatusClient>,
    policy: WaitPolicy,
}

impl JobWaiter {
    pub fn new(client: Arc<dyn JobStatusClient>, policy: WaitPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    pub async fn wait_for(&self, handle: &JobHandle) -> JobOutcome {
        self.wait_with(handle, &self.policy).await
    }

    /// Wait using a policy other than the default, e.g. a step-specific timeout.
    ///
    /// The deadline is measured from the start of this call. A status request
    /// in flight when the deadline passes is abandoned, so the call never
    /// overruns the timeout by more than scheduler latency.
    pub async fn wait_with(&self, handle: &JobHandle, policy: &WaitPolicy) -> JobOutcome {
        let started = Instant::now();
        let deadline = started
            .checked_add(policy.timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut interval = policy.poll_interval;
        let mut transport_failures = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return timed_out(handle, started);
            }

            match tokio::time::timeout(remaining, self.client.status(&handle.id)).await {
                Err(_) => return timed_out(handle, started),
                Ok(Ok(JobStatus::Succeeded(payload))) => {
                    debug!(job = %handle.id, elapsed = ?handle.submitted_at.elapsed(), "job succeeded");
                    return JobOutcome::Succeeded(payload);
                }
                Ok(Ok(JobStatus::Failed(reason))) => {
                    debug!(job = %handle.id, %reason, "job failed");
                    return JobOutcome::Failed(JobError::Backend {
                        job: handle.id.clone(),
                        reason,
                    });
                }
                Ok(Ok(JobStatus::Pending)) => transport_failures = 0,
                Ok(Err(error))
                    if error.is_transient() && transport_failures < policy.transient_retries =>
                {
                    transport_failures += 1;
                    warn!(job = %handle.id, attempt = transport_failures, %error, "job status poll failed, retrying");
                }
                Ok(Err(error)) => {
                    return JobOutcome::Failed(JobError::Transport {
                        job: handle.id.clone(),
                        attempts: transport_failures + 1,
                        source: error,
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return timed_out(handle, started);
            }
            tokio::time::sleep(policy.jittered(interval).min(remaining)).await;
            interval = policy.next_interval(interval);
        }
    }
}

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn timed_out(handle: &JobHandle, started: Instant) -> JobOutcome {
    let waited = started.elapsed();
    warn!(job = %handle.id, ?waited, "gave up waiting for job");
    JobOutcome::TimedOut {
        job: handle.id.clone(),
        waited,
    }
}
