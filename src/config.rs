use std::time::Duration;

use envconfig::Envconfig;
use tracing::warn;

use crate::job::WaitPolicy;

/// Orchestrator settings, read from `PROVISION_*` environment variables.
#[derive(Envconfig, Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// How long to wait on a single backend job.
    #[envconfig(from = "PROVISION_JOB_TIMEOUT_SECS", default = "600")]
    pub job_timeout_secs: u64,

    #[envconfig(from = "PROVISION_POLL_INTERVAL_MS", default = "1000")]
    pub poll_interval_ms: u64,

    #[envconfig(from = "PROVISION_MAX_POLL_INTERVAL_MS", default = "10000")]
    pub max_poll_interval_ms: u64,

    #[envconfig(from = "PROVISION_BACKOFF_FACTOR", default = "2.0")]
    pub backoff_factor: f64,

    #[envconfig(from = "PROVISION_POLL_JITTER", default = "0.1")]
    pub jitter: f64,

    /// Consecutive transient job-status errors tolerated per wait.
    #[envconfig(from = "PROVISION_TRANSIENT_RETRIES", default = "3")]
    pub transient_retries: u32,

    /// Provisioning operations allowed to run at once per partition.
    #[envconfig(from = "PROVISION_LANE_CONCURRENCY", default = "4")]
    pub lane_concurrency: usize,

    #[envconfig(from = "PROVISION_SECURITY_GROUP_TTL_SECS")]
    pub security_group_ttl_secs: Option<u64>,

    #[envconfig(from = "PROVISION_KEY_PAIR_TTL_SECS")]
    pub key_pair_ttl_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 600,
            poll_interval_ms: 1000,
            max_poll_interval_ms: 10_000,
            backoff_factor: 2.0,
            jitter: 0.1,
            transient_retries: 3,
            lane_concurrency: 4,
            security_group_ttl_secs: None,
            key_pair_ttl_secs: None,
        }
    }
}

impl OrchestratorConfig {
    /// Non-finite or negative backoff and jitter settings fall back to their defaults.
    pub fn wait_policy(&self) -> WaitPolicy {
        let defaults = WaitPolicy::default();
        WaitPolicy {
            timeout: Duration::from_secs(self.job_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            backoff_factor: usable_or(
                "PROVISION_BACKOFF_FACTOR",
                self.backoff_factor,
                defaults.backoff_factor,
            ),
            jitter: usable_or("PROVISION_POLL_JITTER", self.jitter, defaults.jitter),
            transient_retries: self.transient_retries,
        }
    }

    pub fn security_group_ttl(&self) -> Option<Duration> {
        self.security_group_ttl_secs.map(Duration::from_secs)
    }

    pub fn key_pair_ttl(&self) -> Option<Duration> {
        self.key_pair_ttl_secs.map(Duration::from_secs)
    }
}

fn usable_or(var: &'static str, value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        warn!(var, value, fallback, "ignoring unusable setting");
        fallback
    }
}
