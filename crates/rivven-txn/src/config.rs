//! Coordinator configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Invalid coordinator configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxConfigError {
    #[error("coordinator_partitions must be at least 1")]
    NoPartitions,

    #[error("metadata lookups need a non-zero retry delay")]
    ZeroRetryDelay,

    #[error("invalid retry backoff: initial {initial:?} exceeds max {max:?}")]
    InvertedBackoff { initial: Duration, max: Duration },

    #[error("invalid backoff factor: {0}")]
    BackoffFactor(u32),
}

/// Transaction coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lookups of the coordinator partition leader and shard before giving up
    pub metadata_dissemination_retries: u32,

    /// Delay between two leader/shard lookups
    pub metadata_dissemination_retry_delay: Duration,

    /// Upper bound to wait for a coordinator leader
    pub wait_for_leader_timeout: Duration,

    /// Upper bound for the log barrier before serving a request
    pub tm_sync_timeout: Duration,

    /// Timeout of a single participant RPC
    pub participant_timeout: Duration,

    /// Timeout of a forwarded coordinator request
    pub forward_timeout: Duration,

    /// Period of the expiry sweep
    pub tx_timeout_delay: Duration,

    /// Transaction timeout used when a client does not declare one
    pub default_transaction_timeout: Duration,

    /// Number of coordinator log partitions
    pub coordinator_partitions: u32,

    /// Retry policy for decided commit/abort fan-out
    pub rollforward: RetryConfig,

    /// Fan-out rounds attempted inline when a client request finds an
    /// unfinished transaction
    pub sync_rollforward_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            metadata_dissemination_retries: 30,
            metadata_dissemination_retry_delay: Duration::from_millis(500),
            wait_for_leader_timeout: Duration::from_secs(5),
            tm_sync_timeout: Duration::from_secs(2),
            participant_timeout: Duration::from_secs(10),
            forward_timeout: Duration::from_secs(10),
            tx_timeout_delay: Duration::from_secs(1),
            default_transaction_timeout: Duration::from_secs(60),
            coordinator_partitions: 1,
            rollforward: RetryConfig::default(),
            sync_rollforward_attempts: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), TxConfigError> {
        if self.coordinator_partitions == 0 {
            return Err(TxConfigError::NoPartitions);
        }
        if self.metadata_dissemination_retries > 0
            && self.metadata_dissemination_retry_delay.is_zero()
        {
            return Err(TxConfigError::ZeroRetryDelay);
        }
        self.rollforward.validate()
    }
}

/// Builder for [`CoordinatorConfig`]
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.config.metadata_dissemination_retries = retries;
        self.config.metadata_dissemination_retry_delay = delay;
        self
    }

    pub fn wait_for_leader_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_for_leader_timeout = timeout;
        self
    }

    pub fn tm_sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.tm_sync_timeout = timeout;
        self
    }

    pub fn participant_timeout(mut self, timeout: Duration) -> Self {
        self.config.participant_timeout = timeout;
        self
    }

    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.config.forward_timeout = timeout;
        self
    }

    pub fn tx_timeout_delay(mut self, delay: Duration) -> Self {
        self.config.tx_timeout_delay = delay;
        self
    }

    pub fn default_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_transaction_timeout = timeout;
        self
    }

    pub fn coordinator_partitions(mut self, partitions: u32) -> Self {
        self.config.coordinator_partitions = partitions;
        self
    }

    pub fn rollforward(mut self, retry: RetryConfig) -> Self {
        self.config.rollforward = retry;
        self
    }

    pub fn sync_rollforward_attempts(mut self, attempts: u32) -> Self {
        self.config.sync_rollforward_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<CoordinatorConfig, TxConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Exponential backoff for fan-out retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: u32,
    /// Randomize each delay in `[delay / 2, delay]`
    pub jitter: bool,
    /// `None` retries until success or shutdown
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_factor: 2,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// Fixed short delay, no jitter; for tests
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            backoff_factor: 1,
            jitter: false,
            max_attempts: None,
        }
    }

    pub fn validate(&self) -> Result<(), TxConfigError> {
        if self.initial_backoff > self.max_backoff {
            return Err(TxConfigError::InvertedBackoff {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        if self.backoff_factor == 0 {
            return Err(TxConfigError::BackoffFactor(self.backoff_factor));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_factor
            .checked_pow(attempt.min(16))
            .unwrap_or(u32::MAX);
        let delay = self
            .initial_backoff
            .saturating_mul(exp)
            .min(self.max_backoff);

        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
            Duration::from_millis(jittered)
        } else {
            delay
        }
    }

    /// `attempts` rounds have been made and no more are allowed
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Same policy capped at `attempts` rounds
    pub fn bounded(&self, attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..self.clone()
        }
    }
}
