use gbn_abstract::{FlowId, LinkConfig};
use gbn_core::FlowSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::channel::LinkEventSummary;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub link: LinkConfig,
    pub duration_ms: u64,
    pub delivered: BTreeMap<FlowId, Vec<Vec<u8>>>,
    pub data_packets_sent: u32,
    pub acks_sent: u32,
    pub link_events: Vec<LinkEventSummary>,
    /// Flows still registered when the report was taken.
    pub flows: Vec<FlowSnapshot>,
    pub stop_reason: Option<String>,
}

impl SimulationReport {
    /// Payloads delivered on `flow`, lossily decoded as UTF-8.
    pub fn delivered_text(&self, flow: FlowId) -> Vec<String> {
        self.delivered
            .get(&flow)
            .map(|payloads| {
                payloads
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_flow_ids_as_map_keys() {
        let mut delivered = BTreeMap::new();
        delivered.insert(FlowId(3), vec![b"hi".to_vec()]);
        let report = SimulationReport {
            link: LinkConfig::default(),
            duration_ms: 12,
            delivered,
            data_packets_sent: 1,
            acks_sent: 1,
            link_events: Vec::new(),
            flows: Vec::new(),
            stop_reason: None,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["delivered"]["3"][0], serde_json::json!([104, 105]));
        assert_eq!(json["link"]["min_latency_ms"], 10);
        assert_eq!(report.delivered_text(FlowId(3)), vec!["hi".to_string()]);
        assert!(report.delivered_text(FlowId(4)).is_empty());
    }
}
