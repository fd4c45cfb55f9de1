pub mod config;
pub mod interface;
pub mod packet;
pub mod scenario;

pub use interface::{Transport, TransportError};
pub use packet::{Ack, FlowId, Packet, SeqNum};

pub use config::{ConfigError, EngineConfig, ExhaustionPolicy, FlowConfig, LinkConfig};
pub use scenario::{
    EngineConfigOverride, LinkConfigOverride, Scenario, ScenarioAction, ScenarioAssertion,
};
