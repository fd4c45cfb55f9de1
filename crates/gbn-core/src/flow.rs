//! Go-Back-N sender state for one logical connection.
//!
//! # Sequence-number layout
//!
//! ```text
//!   base            next_seq          last
//!    │                 │                │
//! ───┼─────────────────┼────────────────┼──▶ seq space
//!    │ <── in flight ─▶│ <── unsent ───▶│
//!    │ <────────── send buffer ────────▶│
//! ```
//!
//! Invariants kept by every operation:
//! - `base <= next_seq <= last + 1`
//! - `next_seq - base <= window_size`
//! - the timer is armed iff `base < next_seq` (checked at the end of every step)
//!
//! The flow itself does no locking. The registry lock serialises the
//! producer, the ACK path and the scheduler.

use bytes::Bytes;
use gbn_abstract::{FlowConfig, FlowId, Packet, SeqNum, Transport};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowState {
    Init,
    Wait,
    Send,
    Rcv,
    Timeout,
}

/// Result of one state-machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Progressed,
    /// Nothing to do until new data, an ACK or a timeout arrives.
    Idle,
    /// `retry_count` reached `max_retry` with no acknowledgement progress.
    RetriesExhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    /// First transmissions.
    pub packets_sent: u64,
    pub retransmissions: u64,
    pub send_failures: u64,
    pub timeouts: u64,
}

/// Point-in-time copy of a flow's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSnapshot {
    pub id: FlowId,
    pub state: FlowState,
    pub base: SeqNum,
    pub next_seq: SeqNum,
    pub last: Option<SeqNum>,
    pub window_size: usize,
    pub retry_count: u32,
    pub finished: bool,
    pub buffered: usize,
    pub timer_armed: bool,
    pub stats: FlowStats,
}

#[derive(Debug)]
pub struct Flow {
    id: FlowId,
    config: FlowConfig,
    base: SeqNum,
    next_seq: SeqNum,
    /// Payloads for `[base, base + len)`.
    buffer: VecDeque<Bytes>,
    state: FlowState,
    retry_count: u32,
    finished: bool,
    timer: Timer,
    stats: FlowStats,
}

impl Flow {
    /// `wake` is shared with the scheduler and notified when the timer fires.
    pub fn new(id: FlowId, config: FlowConfig, wake: Arc<Notify>) -> Self {
        Self {
            id,
            buffer: VecDeque::with_capacity(config.window_size),
            config,
            base: 0,
            next_seq: 0,
            state: FlowState::Init,
            retry_count: 0,
            finished: false,
            timer: Timer::new(wake),
            stats: FlowStats::default(),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn base(&self) -> SeqNum {
        self.base
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    /// Highest sequence number ever enqueued.
    pub fn last(&self) -> Option<SeqNum> {
        self.end().checked_sub(1)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Number of sent-but-unacknowledged packets.
    pub fn in_flight(&self) -> usize {
        (self.next_seq - self.base) as usize
    }

    pub fn has_unsent(&self) -> bool {
        self.next_seq < self.end()
    }

    /// Everything ever enqueued has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.buffer.is_empty()
    }

    /// No pending data, no pending ACK, no fired timer.
    pub fn is_idle(&self) -> bool {
        self.state == FlowState::Wait && self.is_drained() && !self.timer.is_expired()
    }

    /// Finished and fully acknowledged; safe to evict.
    pub fn is_complete(&self) -> bool {
        self.finished && self.is_drained()
    }

    /// Append a payload and return the sequence number assigned to it.
    pub fn enqueue(&mut self, payload: Bytes) -> Result<SeqNum> {
        if self.finished {
            return Err(EngineError::FlowFinished(self.id));
        }
        let seq = self.end();
        self.buffer.push_back(payload);
        debug!(flow = %self.id, seq, "enqueued");
        Ok(seq)
    }

    /// No more data will be enqueued on this flow.
    pub fn mark_finished(&mut self) {
        if !self.finished {
            debug!(flow = %self.id, last = ?self.last(), "marked finished");
            self.finished = true;
        }
    }

    /// Apply a cumulative ACK. Returns `true` if `base` advanced.
    ///
    /// Stale and duplicate ACKs are no-ops, as are ACKs for packets that
    /// were never sent.
    pub fn on_ack_received(&mut self, acked_up_to: SeqNum) -> bool {
        let new_base = acked_up_to.saturating_add(1);
        if new_base <= self.base {
            debug!(flow = %self.id, ack = acked_up_to, base = self.base, "stale ACK");
            return false;
        }
        if new_base > self.next_seq {
            warn!(
                flow = %self.id,
                ack = acked_up_to,
                next_seq = self.next_seq,
                "ACK for unsent data ignored"
            );
            return false;
        }

        let released = (new_base - self.base) as usize;
        self.buffer.drain(..released);
        self.base = new_base;
        self.state = FlowState::Rcv;
        debug!(flow = %self.id, base = self.base, released, "ACK advanced window");
        true
    }

    /// Move a fired timer into the state machine. A pending `Rcv` takes
    /// precedence because that step rearms the timer anyway.
    pub fn poll_timer(&mut self) {
        if self.state != FlowState::Rcv && self.timer.take_expired() {
            self.state = FlowState::Timeout;
        }
    }

    /// Advance the state machine by one transition.
    pub fn step(&mut self, transport: &dyn Transport) -> StepOutcome {
        match self.state {
            FlowState::Init => {
                self.state = FlowState::Wait;
                StepOutcome::Progressed
            }
            FlowState::Wait => {
                if self.has_unsent() {
                    self.state = FlowState::Send;
                    StepOutcome::Progressed
                } else {
                    StepOutcome::Idle
                }
            }
            FlowState::Send => {
                self.fill_window(transport);
                self.state = FlowState::Wait;
                StepOutcome::Progressed
            }
            FlowState::Rcv => {
                self.timer.disarm();
                if self.base != self.next_seq {
                    // Fresh deadline for the new oldest unacknowledged packet.
                    self.timer.arm(self.config.retransmit_timeout());
                }
                self.retry_count = 0;
                self.state = FlowState::Send;
                StepOutcome::Progressed
            }
            FlowState::Timeout => self.on_timeout(transport),
        }
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            id: self.id,
            state: self.state,
            base: self.base,
            next_seq: self.next_seq,
            last: self.last(),
            window_size: self.config.window_size,
            retry_count: self.retry_count,
            finished: self.finished,
            buffered: self.buffer.len(),
            timer_armed: self.timer.is_armed(),
            stats: self.stats.clone(),
        }
    }

    /// Cancel the retransmission timer, used when the engine shuts down.
    pub(crate) fn halt(&mut self) {
        self.timer.disarm();
    }

    /// Restore the retransmission timer after a restart if packets are
    /// still unacknowledged.
    pub(crate) fn resume(&mut self) {
        if self.base != self.next_seq && !self.timer.is_armed() {
            debug!(flow = %self.id, base = self.base, next_seq = self.next_seq, "timer resumed");
            self.timer.arm(self.config.retransmit_timeout());
        }
    }

    fn end(&self) -> SeqNum {
        self.base + self.buffer.len() as SeqNum
    }

    fn window_limit(&self) -> SeqNum {
        self.base + self.config.window_size as SeqNum
    }

    fn fill_window(&mut self, transport: &dyn Transport) {
        while self.next_seq < self.window_limit() && self.has_unsent() {
            self.transmit(transport, self.next_seq);
            self.stats.packets_sent += 1;
            if self.base == self.next_seq {
                self.timer.arm(self.config.retransmit_timeout());
            }
            self.next_seq += 1;
        }
    }

    fn on_timeout(&mut self, transport: &dyn Transport) -> StepOutcome {
        if self.base == self.next_seq {
            // Everything was acknowledged while the expiry was in flight.
            self.state = FlowState::Wait;
            return StepOutcome::Progressed;
        }
        self.stats.timeouts += 1;
        if self.retry_count >= self.config.max_retry {
            warn!(
                flow = %self.id,
                base = self.base,
                retries = self.retry_count,
                "retry limit reached"
            );
            return StepOutcome::RetriesExhausted;
        }

        self.retry_count += 1;
        self.timer.arm(self.config.retransmit_timeout());
        info!(
            flow = %self.id,
            base = self.base,
            next_seq = self.next_seq,
            retry = self.retry_count,
            "timeout, going back to base"
        );
        for seq in self.base..self.next_seq {
            self.transmit(transport, seq);
            self.stats.retransmissions += 1;
        }
        self.state = FlowState::Wait;
        StepOutcome::Progressed
    }

    fn transmit(&mut self, transport: &dyn Transport, seq: SeqNum) {
        let Some(payload) = self.buffer.get((seq - self.base) as usize) else {
            return;
        };
        let packet = Packet::new(self.id, seq, payload.clone());
        match transport.send(&packet) {
            Ok(()) => debug!(flow = %self.id, seq, bytes = packet.len(), "sent"),
            Err(err) => {
                // Recovered by the next timeout round.
                self.stats.send_failures += 1;
                warn!(flow = %self.id, seq, error = %err, "send failed");
            }
        }
    }
}
