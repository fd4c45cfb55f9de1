use crate::config::{EngineConfig, ExhaustionPolicy, LinkConfig};
use crate::packet::{FlowId, SeqNum};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub engine: EngineConfigOverride,
    #[serde(default)]
    pub link: LinkConfigOverride,
    #[serde(default)]
    pub actions: Vec<ScenarioAction>,
    #[serde(default)]
    pub assertions: Vec<ScenarioAssertion>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EngineConfigOverride {
    pub window_size: Option<usize>,
    pub max_retry: Option<u32>,
    pub retransmit_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub on_retry_exhausted: Option<ExhaustionPolicy>,
}

impl EngineConfigOverride {
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(v) = self.window_size {
            config.flow.window_size = v;
        }
        if let Some(v) = self.max_retry {
            config.flow.max_retry = v;
        }
        if let Some(v) = self.retransmit_timeout_ms {
            config.flow.retransmit_timeout_ms = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval_ms = v;
        }
        if let Some(v) = self.on_retry_exhausted {
            config.on_retry_exhausted = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LinkConfigOverride {
    pub loss_rate: Option<f64>,
    pub ack_loss_rate: Option<f64>,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub seed: Option<u64>,
}

impl LinkConfigOverride {
    pub fn apply_to(&self, config: &mut LinkConfig) {
        if let Some(v) = self.loss_rate {
            config.loss_rate = v;
        }
        if let Some(v) = self.ack_loss_rate {
            config.ack_loss_rate = v;
        }
        if let Some(v) = self.min_latency_ms {
            config.min_latency_ms = v;
        }
        if let Some(v) = self.max_latency_ms {
            config.max_latency_ms = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioAction {
    /// Producer hands a payload to a flow
    Enqueue { flow: FlowId, data: String },
    /// Producer signals end-of-stream for a flow
    Finish { flow: FlowId },
    /// Drop the first data packet of `flow` carrying `seq`
    DropNextData { flow: FlowId, seq: SeqNum },
    /// Drop the first ACK of `flow` carrying `ack`
    DropNextAck { flow: FlowId, ack: SeqNum },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioAssertion {
    /// The receiver side of `flow` got `data`
    DataDelivered { flow: FlowId, data: String },
    /// Total data packets put on the link (originals plus retransmissions)
    PacketCount { min: u32, max: Option<u32> },
    /// How the engine is expected to end
    EngineStopped { retries_exhausted: bool },
    /// The run must settle within this many milliseconds
    MaxDuration { ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scenario() {
        let scenario: Scenario = toml::from_str(
            r#"
            name = "single loss"
            description = "first packet is dropped once"

            [engine]
            window_size = 2
            on_retry_exhausted = "stop_engine"

            [link]
            seed = 9

            [[actions]]
            type = "enqueue"
            flow = 1
            data = "hello"

            [[actions]]
            type = "drop_next_data"
            flow = 1
            seq = 0

            [[actions]]
            type = "finish"
            flow = 1

            [[assertions]]
            type = "data_delivered"
            flow = 1
            data = "hello"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.actions.len(), 3);
        assert!(matches!(
            scenario.actions[1],
            ScenarioAction::DropNextData { flow: FlowId(1), seq: 0 }
        ));

        let mut engine = EngineConfig::default();
        scenario.engine.apply_to(&mut engine);
        assert_eq!(engine.flow.window_size, 2);
        assert_eq!(engine.on_retry_exhausted, ExhaustionPolicy::StopEngine);

        let mut link = LinkConfig::default();
        scenario.link.apply_to(&mut link);
        assert_eq!(link.seed, 9);
        assert_eq!(link.loss_rate, 0.0);
    }

    #[test]
    fn scenario_without_actions_parses() {
        let scenario: Scenario = toml::from_str(
            r#"
            name = "idle"

            [[assertions]]
            type = "packet_count"
            min = 0
            max = 0
            "#,
        )
        .unwrap();

        assert!(scenario.actions.is_empty());
        assert!(matches!(
            scenario.assertions[0],
            ScenarioAssertion::PacketCount { min: 0, max: Some(0) }
        ));
    }
}
