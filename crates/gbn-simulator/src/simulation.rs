use anyhow::{Context, Result, bail};
use gbn_abstract::{EngineConfig, FlowId, LinkConfig, SeqNum};
use gbn_core::{EngineError, FlowRegistry, Scheduler, StopReason};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::channel::LossyChannel;
use crate::trace::SimulationReport;

/// A scheduler wired to a [`LossyChannel`] that shares its registry.
#[derive(Debug)]
pub struct Simulation {
    scheduler: Scheduler,
    channel: LossyChannel,
}

impl Simulation {
    pub fn new(engine: EngineConfig, link: LinkConfig) -> Result<Self> {
        link.validate().context("Invalid link configuration")?;
        let registry = FlowRegistry::new(engine.flow.clone());
        let channel = LossyChannel::new(link, registry.clone());
        let scheduler = Scheduler::with_registry(engine, registry, Arc::new(channel.clone()))
            .context("Invalid engine configuration")?;
        Ok(Self { scheduler, channel })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn channel(&self) -> &LossyChannel {
        &self.channel
    }

    pub fn registry(&self) -> &FlowRegistry {
        self.scheduler.registry()
    }

    /// Queue `data` on `flow`. A flow id that was already evicted starts
    /// over at seq 0, so the simulated receiver is reset with it.
    pub fn enqueue(&self, flow: FlowId, data: impl Into<Vec<u8>>) -> Result<SeqNum> {
        match self
            .registry()
            .open_flow(flow, self.scheduler.config().flow.clone())
        {
            Ok(()) => self.channel.reset_receiver(flow),
            Err(EngineError::FlowExists(_)) => {}
            Err(err) => return Err(err).with_context(|| format!("Failed to open {flow}")),
        }
        let seq = self
            .registry()
            .enqueue(flow, data.into())
            .with_context(|| format!("Failed to enqueue on {flow}"))?;
        Ok(seq)
    }

    pub fn finish(&self, flow: FlowId) {
        if !self.registry().mark_finished(flow) {
            warn!(%flow, "finish for unknown flow ignored");
        }
    }

    /// Start the engine and wait until every flow is drained or the engine
    /// halts on its own. Fails if neither happens within `limit`.
    pub async fn run(&self, limit: Duration) -> Result<StopReason> {
        self.scheduler.start();
        let outcome = tokio::time::timeout(limit, self.registry().wait_until_drained()).await;
        self.scheduler.stop();
        let reason = self.scheduler.join().await.unwrap_or(StopReason::Requested);

        match outcome {
            Ok(Ok(())) => {
                info!(elapsed_ms = self.channel.elapsed_ms(), "all flows drained");
                Ok(reason)
            }
            Ok(Err(EngineError::Stopped)) => {
                warn!(%reason, "engine stopped before draining");
                Ok(reason)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => bail!("Simulation timed out after {} ms", limit.as_millis()),
        }
    }

    pub fn export_report(&self) -> SimulationReport {
        let mut report = self.channel.report();
        report.stop_reason = self.scheduler.stop_reason().map(|r| r.to_string());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbn_abstract::FlowConfig;

    fn engine(window_size: usize, max_retry: u32) -> EngineConfig {
        EngineConfig {
            flow: FlowConfig {
                window_size,
                max_retry,
                retransmit_timeout_ms: 300,
            },
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lossless_link_delivers_in_order() {
        let sim = Simulation::new(engine(4, 5), LinkConfig::default()).unwrap();
        for i in 0..10 {
            sim.enqueue(FlowId(1), format!("m{i}")).unwrap();
        }
        sim.finish(FlowId(1));

        let reason = sim.run(Duration::from_secs(10)).await.unwrap();
        assert_eq!(reason, StopReason::Requested);

        let report = sim.export_report();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(report.delivered_text(FlowId(1)), expected);
        // Reordering on the link may force some go-back retransmissions.
        assert!(report.data_packets_sent >= 10);
        assert!(report.flows.is_empty());
        assert_eq!(report.stop_reason.as_deref(), Some("stop requested"));
    }

    #[tokio::test(start_paused = true)]
    async fn lossy_link_still_delivers_every_flow() {
        let link = LinkConfig {
            loss_rate: 0.2,
            ack_loss_rate: 0.1,
            seed: 7,
            ..Default::default()
        };
        let sim = Simulation::new(engine(3, 50), link).unwrap();
        for flow in 1..=3 {
            for i in 0..8 {
                sim.enqueue(FlowId(flow), format!("f{flow}-{i}")).unwrap();
            }
            sim.finish(FlowId(flow));
        }

        sim.run(Duration::from_secs(120)).await.unwrap();

        let report = sim.export_report();
        for flow in 1..=3 {
            let expected: Vec<String> = (0..8).map(|i| format!("f{flow}-{i}")).collect();
            assert_eq!(report.delivered_text(FlowId(flow)), expected);
        }
        assert!(report.data_packets_sent >= 24);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_link_exhausts_retries() {
        let link = LinkConfig {
            loss_rate: 1.0,
            ..Default::default()
        };
        let sim = Simulation::new(engine(2, 2), link).unwrap();
        sim.enqueue(FlowId(9), "lost").unwrap();
        sim.finish(FlowId(9));

        let reason = sim.run(Duration::from_secs(10)).await.unwrap();
        assert_eq!(reason, StopReason::RetriesExhausted { flow: FlowId(9) });

        let report = sim.export_report();
        // One original send plus two retransmissions.
        assert_eq!(report.data_packets_sent, 3);
        assert!(report.delivered_text(FlowId(9)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_flow_times_out() {
        let sim = Simulation::new(engine(2, 5), LinkConfig::default()).unwrap();
        sim.enqueue(FlowId(1), "open").unwrap();

        let err = sim.run(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(sim.channel().delivered(FlowId(1)), vec![b"open".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn reused_flow_id_is_delivered_again() {
        let link = LinkConfig {
            min_latency_ms: 10,
            max_latency_ms: 10,
            ..Default::default()
        };
        let sim = Simulation::new(engine(2, 5), link).unwrap();
        sim.scheduler().start();

        sim.enqueue(FlowId(1), "first").unwrap();
        sim.finish(FlowId(1));
        sim.registry().wait_until_drained().await.unwrap();
        assert!(!sim.registry().contains(FlowId(1)));

        assert_eq!(sim.enqueue(FlowId(1), "second").unwrap(), 0);
        sim.finish(FlowId(1));
        sim.run(Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            sim.export_report().delivered_text(FlowId(1)),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn rejects_inverted_latency() {
        let link = LinkConfig {
            min_latency_ms: 50,
            max_latency_ms: 10,
            ..Default::default()
        };
        assert!(Simulation::new(EngineConfig::default(), link).is_err());
    }
}
