use gbn_abstract::{FlowId, LinkConfig, Packet, SeqNum, Transport, TransportError};
use gbn_core::FlowRegistry;

use crate::trace::SimulationReport;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A compact textual summary of important link-layer events.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: u64,
    pub description: String,
}

/// Go-Back-N receiver for one flow: only the next expected packet is
/// accepted, everything else is discarded and re-ACKed.
#[derive(Debug, Default)]
struct ReceiverState {
    expected: SeqNum,
    delivered: Vec<Vec<u8>>,
}

struct ChannelState {
    rng: rand::rngs::StdRng,
    receivers: BTreeMap<FlowId, ReceiverState>,
    // Deterministic fault injection: drop the first data packet with (flow, seq)
    drop_data_once: Vec<(FlowId, SeqNum)>,
    // Deterministic fault injection: drop the first ACK with (flow, ack)
    drop_ack_once: Vec<(FlowId, SeqNum)>,
    data_packets_sent: u32,
    acks_sent: u32,
    link_events: Vec<LinkEventSummary>,
}

struct ChannelInner {
    config: LinkConfig,
    registry: FlowRegistry,
    started: Instant,
    state: Mutex<ChannelState>,
}

/// In-memory unreliable link with a GBN receiver on the far end.
///
/// Data packets are lost, delayed and reordered according to the
/// [`LinkConfig`]; the receiver answers with cumulative ACKs which travel
/// back over the same lossy link and are reported to the [`FlowRegistry`].
/// Every hop runs on its own tokio task, so `send` never re-enters the
/// registry.
#[derive(Clone)]
pub struct LossyChannel {
    inner: Arc<ChannelInner>,
}

impl LossyChannel {
    pub fn new(config: LinkConfig, registry: FlowRegistry) -> Self {
        let rng = rand::rngs::StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                registry,
                started: Instant::now(),
                state: Mutex::new(ChannelState {
                    rng,
                    receivers: BTreeMap::new(),
                    drop_data_once: Vec::new(),
                    drop_ack_once: Vec::new(),
                    data_packets_sent: 0,
                    acks_sent: 0,
                    link_events: Vec::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Register a deterministic fault: drop the first data packet of `flow` carrying `seq`.
    pub fn drop_next_data(&self, flow: FlowId, seq: SeqNum) {
        self.lock().drop_data_once.push((flow, seq));
    }

    /// Register a deterministic fault: drop the first ACK of `flow` carrying `ack`.
    pub fn drop_next_ack(&self, flow: FlowId, ack: SeqNum) {
        self.lock().drop_ack_once.push((flow, ack));
    }

    /// A new sender flow reuses `flow`: expect seq 0 again. Payloads
    /// already delivered are kept.
    pub fn reset_receiver(&self, flow: FlowId) {
        let mut state = self.lock();
        if let Some(receiver) = state.receivers.get_mut(&flow)
            && receiver.expected > 0
        {
            receiver.expected = 0;
            self.record(&mut state, format!("[{flow}] RECEIVER RESET"));
        }
    }

    /// Payloads the receiver side of `flow` accepted, in order.
    pub fn delivered(&self, flow: FlowId) -> Vec<Vec<u8>> {
        self.lock()
            .receivers
            .get(&flow)
            .map(|r| r.delivered.clone())
            .unwrap_or_default()
    }

    pub fn delivered_all(&self) -> BTreeMap<FlowId, Vec<Vec<u8>>> {
        self.lock()
            .receivers
            .iter()
            .map(|(flow, r)| (*flow, r.delivered.clone()))
            .collect()
    }

    /// Data packets handed to the link, originals and retransmissions.
    pub fn data_packets_sent(&self) -> u32 {
        self.lock().data_packets_sent
    }

    pub fn acks_sent(&self) -> u32 {
        self.lock().acks_sent
    }

    pub fn link_events(&self) -> Vec<LinkEventSummary> {
        self.lock().link_events.clone()
    }

    /// Snapshot of everything the link observed so far.
    pub fn report(&self) -> SimulationReport {
        // `send` runs under the registry lock, so never take it after ours.
        let flows = self.inner.registry.snapshots();
        let state = self.lock();
        SimulationReport {
            link: self.inner.config.clone(),
            duration_ms: self.elapsed_ms(),
            delivered: state
                .receivers
                .iter()
                .map(|(flow, r)| (*flow, r.delivered.clone()))
                .collect(),
            data_packets_sent: state.data_packets_sent,
            acks_sent: state.acks_sent,
            link_events: state.link_events.clone(),
            flows,
            stop_reason: None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &mut ChannelState, description: String) {
        state.link_events.push(LinkEventSummary {
            time: self.elapsed_ms(),
            description,
        });
    }

    fn latency(&self, state: &mut ChannelState) -> Duration {
        let ms = state
            .rng
            .random_range(self.inner.config.min_latency_ms..=self.inner.config.max_latency_ms);
        Duration::from_millis(ms)
    }

    /// Receiver side: a data packet reached the far end.
    fn on_arrival(&self, packet: Packet) {
        let mut state = self.lock();
        let receiver = state.receivers.entry(packet.flow).or_default();
        let accepted = packet.seq == receiver.expected;
        if accepted {
            receiver.delivered.push(packet.payload.to_vec());
            receiver.expected += 1;
        }
        let expected = receiver.expected;

        let description = if accepted {
            format!("[{}] DELIVERED seq={} ({} bytes)", packet.flow, packet.seq, packet.len())
        } else {
            format!("[{}] DISCARD seq={} (expect {})", packet.flow, packet.seq, expected)
        };
        self.record(&mut state, description);

        // Nothing received in order yet, so there is nothing to acknowledge.
        let Some(ack) = expected.checked_sub(1) else {
            return;
        };
        state.acks_sent += 1;

        if let Some(pos) = state
            .drop_ack_once
            .iter()
            .position(|(f, a)| *f == packet.flow && *a == ack)
        {
            state.drop_ack_once.remove(pos);
            self.record(&mut state, format!("[{}] DROP ACK (deterministic) ack={}", packet.flow, ack));
            debug!(flow = %packet.flow, ack, "deterministically dropping ACK");
            return;
        }

        if state.rng.random::<f64>() < self.inner.config.ack_loss_rate {
            self.record(&mut state, format!("[{}] DROP ACK (random loss) ack={}", packet.flow, ack));
            debug!(flow = %packet.flow, ack, "ACK lost in channel");
            return;
        }

        let latency = self.latency(&mut state);
        self.record(
            &mut state,
            format!("[{}] ACK ack={} (latency={}ms)", packet.flow, ack, latency.as_millis()),
        );
        drop(state);

        let registry = self.inner.registry.clone();
        let flow = packet.flow;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            registry.on_ack_received(flow, ack);
        });
    }
}

impl std::fmt::Debug for LossyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LossyChannel")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Transport for LossyChannel {
    fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.data_packets_sent += 1;

        if let Some(pos) = state
            .drop_data_once
            .iter()
            .position(|(f, s)| *f == packet.flow && *s == packet.seq)
        {
            state.drop_data_once.remove(pos);
            self.record(
                &mut state,
                format!("[{}] DROP (deterministic seq) seq={}", packet.flow, packet.seq),
            );
            debug!(flow = %packet.flow, seq = packet.seq, "deterministically dropping data packet");
            return Ok(());
        }

        if state.rng.random::<f64>() < self.inner.config.loss_rate {
            self.record(
                &mut state,
                format!("[{}] DROP (random loss) seq={}", packet.flow, packet.seq),
            );
            debug!(flow = %packet.flow, seq = packet.seq, "packet lost in channel");
            return Ok(());
        }

        let latency = self.latency(&mut state);
        self.record(
            &mut state,
            format!("[{}] SEND seq={} (latency={}ms)", packet.flow, packet.seq, latency.as_millis()),
        );
        drop(state);

        let channel = self.clone();
        let packet = packet.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            channel.on_arrival(packet);
        });
        Ok(())
    }
}
