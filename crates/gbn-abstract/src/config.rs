use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("window_size must be at least 1")]
    ZeroWindow,
    #[error("retransmit_timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
    #[error("latency range is inverted ({min} > {max})")]
    InvertedLatency { min: u64, max: u64 },
    #[error("{name} must be within [0, 1], got {value}")]
    RateOutOfRange { name: &'static str, value: f64 },
}

/// Per-flow Go-Back-N parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum number of sent-but-unacknowledged packets.
    pub window_size: usize,
    /// Timeout rounds tolerated without progress before giving up.
    pub max_retry: u32,
    pub retransmit_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_size: 4,
            max_retry: 5,
            retransmit_timeout_ms: 1000,
        }
    }
}

impl FlowConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.retransmit_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// What the scheduler does when a flow runs out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Sustained unreachability ends the whole session.
    #[default]
    StopEngine,
    /// Evict only the failing flow and keep serving the others.
    DropFlow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults for flows created implicitly by their first enqueue.
    #[serde(flatten)]
    pub flow: FlowConfig,
    /// Upper bound on scheduling latency between cycles.
    pub poll_interval_ms: u64,
    pub on_retry_exhausted: ExhaustionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            poll_interval_ms: 50,
            on_retry_exhausted: ExhaustionPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flow.validate()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

/// Behaviour of the simulated unreliable link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub loss_rate: f64,
    pub ack_loss_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            ack_loss_rate: 0.0,
            min_latency_ms: 10,
            max_latency_ms: 100,
            seed: 0,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("loss_rate", self.loss_rate), ("ack_loss_rate", self.ack_loss_rate)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::RateOutOfRange { name, value });
            }
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(ConfigError::InvertedLatency {
                min: self.min_latency_ms,
                max: self.max_latency_ms,
            });
        }
        Ok(())
    }
}
