//! Go-Back-N reliable delivery over an unreliable datagram transport.
//!
//! ```text
//!  producer ──enqueue──▶ ┌──────────────┐ ◀──ACK── transport receive side
//!                        │ FlowRegistry │
//!                        │  (Flow, ...) │
//!                        └──────┬───────┘
//!                               │ one pass per cycle
//!                        ┌──────▼───────┐        ┌───────────┐
//!                        │  Scheduler   │──send─▶│ Transport │
//!                        └──────────────┘        └───────────┘
//! ```
//!
//! - [`flow`]       per-flow sliding window and state machine
//! - [`timer`]      single-shot retransmission timer
//! - [`registry`]   shared flow set with work / drain signalling
//! - [`scheduler`]  the loop that drives every flow

pub mod error;
pub mod flow;
pub mod registry;
pub mod scheduler;
pub mod timer;

pub use error::{EngineError, Result, StopReason};
pub use flow::{Flow, FlowSnapshot, FlowState, FlowStats, StepOutcome};
pub use registry::FlowRegistry;
pub use scheduler::{CycleOutcome, Scheduler};
pub use timer::Timer;
