pub mod channel;
pub mod scenario_runner;
pub mod simulation;
pub mod trace;

pub use channel::{LinkEventSummary, LossyChannel};
pub use simulation::Simulation;
pub use trace::SimulationReport;
