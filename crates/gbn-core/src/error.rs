use gbn_abstract::FlowId;
use gbn_abstract::config::ConfigError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("{0} is finished and accepts no more data")]
    FlowFinished(FlowId),

    #[error("{0} is already registered")]
    FlowExists(FlowId),

    #[error("engine has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Why the scheduler loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `Scheduler::stop` was called.
    Requested,
    /// A flow hit its retry limit without any acknowledgement progress.
    RetriesExhausted { flow: FlowId },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::RetriesExhausted { flow } => write!(f, "retries exhausted on {flow}"),
        }
    }
}
