use anyhow::{Context, anyhow};
use gbn_abstract::{EngineConfig, LinkConfig, Scenario, ScenarioAction, ScenarioAssertion};
use gbn_core::StopReason;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::simulation::Simulation;
use crate::trace::SimulationReport;

const DEFAULT_MAX_DURATION_MS: u64 = 10_000;

pub fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    let scenario: Scenario = toml::from_str(&content).context("Failed to parse scenario")?;
    Ok(scenario)
}

pub async fn run_scenario(path: &Path) -> anyhow::Result<SimulationReport> {
    let scenario = load_scenario(path)?;
    run_loaded_scenario(scenario).await
}

pub async fn run_loaded_scenario(scenario: Scenario) -> anyhow::Result<SimulationReport> {
    info!("Running Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    let mut engine = EngineConfig::default();
    scenario.engine.apply_to(&mut engine);
    let mut link = LinkConfig::default();
    scenario.link.apply_to(&mut link);

    let sim = Simulation::new(engine, link)?;
    configure_actions(&sim, &scenario.actions)?;

    let max_duration = scenario
        .assertions
        .iter()
        .find_map(|a| match a {
            ScenarioAssertion::MaxDuration { ms } => Some(*ms),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_DURATION_MS);

    let reason = sim.run(Duration::from_millis(max_duration)).await?;
    let report = sim.export_report();
    check_assertions(&scenario.assertions, &report, reason)?;

    info!("Test Scenario Passed!");
    Ok(report)
}

/// Fault injections are registered before any data is queued so they apply
/// from the first transmission.
fn configure_actions(sim: &Simulation, actions: &[ScenarioAction]) -> anyhow::Result<()> {
    for action in actions {
        match action {
            ScenarioAction::DropNextData { flow, seq } => sim.channel().drop_next_data(*flow, *seq),
            ScenarioAction::DropNextAck { flow, ack } => sim.channel().drop_next_ack(*flow, *ack),
            _ => {}
        }
    }
    for action in actions {
        match action {
            ScenarioAction::Enqueue { flow, data } => {
                sim.enqueue(*flow, data.as_bytes())?;
            }
            ScenarioAction::Finish { flow } => sim.finish(*flow),
            _ => {}
        }
    }
    Ok(())
}

fn check_assertions(
    assertions: &[ScenarioAssertion],
    report: &SimulationReport,
    reason: StopReason,
) -> anyhow::Result<()> {
    for assertion in assertions {
        match assertion {
            ScenarioAssertion::DataDelivered { flow, data } => {
                let found = report
                    .delivered
                    .get(flow)
                    .is_some_and(|payloads| payloads.iter().any(|d| d == data.as_bytes()));
                if !found {
                    return Err(anyhow!(
                        "Assertion Failed: Data {:?} was not delivered on {}",
                        data,
                        flow
                    ));
                }
            }
            ScenarioAssertion::PacketCount { min, max } => {
                if report.data_packets_sent < *min {
                    return Err(anyhow!(
                        "Assertion Failed: Sent {} packets, expected min {}",
                        report.data_packets_sent,
                        min
                    ));
                }
                if let Some(max) = max
                    && report.data_packets_sent > *max
                {
                    return Err(anyhow!(
                        "Assertion Failed: Sent {} packets, expected max {}",
                        report.data_packets_sent,
                        max
                    ));
                }
            }
            ScenarioAssertion::EngineStopped { retries_exhausted } => {
                let exhausted = matches!(reason, StopReason::RetriesExhausted { .. });
                if exhausted != *retries_exhausted {
                    return Err(anyhow!(
                        "Assertion Failed: Engine ended with \"{}\", expected retries_exhausted = {}",
                        reason,
                        retries_exhausted
                    ));
                }
            }
            ScenarioAssertion::MaxDuration { .. } => {} // Enforced while running
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbn_abstract::FlowId;

    fn parse(toml_src: &str) -> Scenario {
        toml::from_str(toml_src).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn single_drop_is_recovered() {
        let scenario = parse(
            r#"
            name = "drop first packet"

            [engine]
            window_size = 2
            retransmit_timeout_ms = 300
            poll_interval_ms = 5

            [link]
            min_latency_ms = 20
            max_latency_ms = 20

            [[actions]]
            type = "drop_next_data"
            flow = 1
            seq = 0

            [[actions]]
            type = "enqueue"
            flow = 1
            data = "hello"

            [[actions]]
            type = "enqueue"
            flow = 1
            data = "world"

            [[actions]]
            type = "finish"
            flow = 1

            [[assertions]]
            type = "data_delivered"
            flow = 1
            data = "world"

            [[assertions]]
            type = "packet_count"
            min = 3

            [[assertions]]
            type = "engine_stopped"
            retries_exhausted = false
            "#,
        );

        let report = run_loaded_scenario(scenario).await.unwrap();
        assert_eq!(
            report.delivered_text(FlowId(1)),
            vec!["hello".to_string(), "world".to_string()]
        );
        assert!(
            report
                .link_events
                .iter()
                .any(|e| e.description.contains("DROP (deterministic seq) seq=0"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_reported() {
        let scenario = parse(
            r#"
            name = "dead link"

            [engine]
            max_retry = 1
            retransmit_timeout_ms = 100

            [link]
            loss_rate = 1.0

            [[actions]]
            type = "enqueue"
            flow = 4
            data = "never"

            [[actions]]
            type = "finish"
            flow = 4

            [[assertions]]
            type = "engine_stopped"
            retries_exhausted = true

            [[assertions]]
            type = "packet_count"
            min = 2
            max = 2
            "#,
        );

        let report = run_loaded_scenario(scenario).await.unwrap();
        assert_eq!(report.stop_reason.as_deref(), Some("retries exhausted on flow-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_assertion_is_an_error() {
        let scenario = parse(
            r#"
            name = "wrong expectation"

            [[actions]]
            type = "enqueue"
            flow = 1
            data = "a"

            [[actions]]
            type = "finish"
            flow = 1

            [[assertions]]
            type = "data_delivered"
            flow = 1
            data = "b"
            "#,
        );

        let err = run_loaded_scenario(scenario).await.unwrap_err();
        assert!(err.to_string().contains("was not delivered"));
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_bounds_the_run() {
        let scenario = parse(
            r#"
            name = "never finished"

            [[actions]]
            type = "enqueue"
            flow = 1
            data = "a"

            [[assertions]]
            type = "max_duration"
            ms = 500
            "#,
        );

        let err = run_loaded_scenario(scenario).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 500 ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn bundled_scenarios_pass() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios");
        for name in ["single_loss.toml", "dead_link.toml"] {
            run_scenario(&dir.join(name))
                .await
                .unwrap_or_else(|err| panic!("{name}: {err:#}"));
        }
    }

    #[test]
    fn missing_file_has_context() {
        let err = load_scenario(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read scenario file"));
    }
}
