//! The set of active flows shared by producers, the ACK path and the
//! scheduler.
//!
//! One mutex guards flow membership and every flow's fields. Two signals sit
//! next to it:
//! - `work` wakes a suspended scheduler (new data, ACK progress, timer
//!   expiry, stop). It is a single-waiter signal, so a wake that races ahead
//!   of the wait is kept as a permit instead of being lost.
//! - `drained` wakes producers waiting for the registry to empty out or for
//!   the engine to stop.
//!
//! Waiters always re-check their predicate after waking.

use bytes::Bytes;
use gbn_abstract::{Ack, FlowConfig, FlowId, SeqNum};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::flow::{Flow, FlowSnapshot};

pub(crate) struct RegistryState {
    pub(crate) flows: BTreeMap<FlowId, Flow>,
    pub(crate) closed: bool,
}

struct Inner {
    state: Mutex<RegistryState>,
    work: Arc<Notify>,
    drained: Notify,
    defaults: FlowConfig,
}

/// Cheap, cloneable handle to the shared flow set.
#[derive(Clone)]
pub struct FlowRegistry {
    inner: Arc<Inner>,
}

impl FlowRegistry {
    /// `defaults` apply to flows created by their first enqueue.
    pub fn new(defaults: FlowConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState {
                    flows: BTreeMap::new(),
                    closed: false,
                }),
                work: Arc::new(Notify::new()),
                drained: Notify::new(),
                defaults,
            }),
        }
    }

    /// Register a flow with its own parameters before any data arrives.
    pub fn open_flow(&self, id: FlowId, config: FlowConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Stopped);
        }
        if state.flows.contains_key(&id) {
            return Err(EngineError::FlowExists(id));
        }
        info!(flow = %id, window = config.window_size, "flow opened");
        let flow = Flow::new(id, config, Arc::clone(&self.inner.work));
        state.flows.insert(id, flow);
        Ok(())
    }

    /// Append `payload` to `id`, creating the flow on its first data.
    pub fn enqueue(&self, id: FlowId, payload: impl Into<Bytes>) -> Result<SeqNum> {
        let seq = {
            let mut state = self.lock();
            if state.closed {
                return Err(EngineError::Stopped);
            }
            let flow = state.flows.entry(id).or_insert_with(|| {
                info!(flow = %id, "flow created");
                Flow::new(id, self.inner.defaults.clone(), Arc::clone(&self.inner.work))
            });
            flow.enqueue(payload.into())?
        };
        self.wake_scheduler();
        Ok(seq)
    }

    /// Signal end-of-stream on `id`. Returns `false` if the flow is unknown.
    pub fn mark_finished(&self, id: FlowId) -> bool {
        let found = match self.lock().flows.get_mut(&id) {
            Some(flow) => {
                flow.mark_finished();
                true
            }
            None => false,
        };
        if found {
            self.wake_scheduler();
        }
        found
    }

    /// Report a cumulative ACK for `id`. Returns `true` if the window moved.
    pub fn on_ack_received(&self, id: FlowId, acked_up_to: SeqNum) -> bool {
        let advanced = match self.lock().flows.get_mut(&id) {
            Some(flow) => flow.on_ack_received(acked_up_to),
            None => {
                debug!(flow = %id, ack = acked_up_to, "ACK for unknown flow");
                false
            }
        };
        if advanced {
            self.wake_scheduler();
        }
        advanced
    }

    pub fn deliver(&self, ack: Ack) -> bool {
        self.on_ack_received(ack.flow, ack.acked_up_to)
    }

    /// Wait until every flow has been evicted.
    ///
    /// Fails with [`EngineError::Stopped`] if the engine stops while flows
    /// are still registered.
    pub async fn wait_until_drained(&self) -> Result<()> {
        loop {
            let notified = self.inner.drained.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.flows.is_empty() {
                    return Ok(());
                }
                if state.closed {
                    return Err(EngineError::Stopped);
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().flows.is_empty()
    }

    pub fn contains(&self, id: FlowId) -> bool {
        self.lock().flows.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn snapshot(&self, id: FlowId) -> Option<FlowSnapshot> {
        self.lock().flows.get(&id).map(Flow::snapshot)
    }

    pub fn snapshots(&self) -> Vec<FlowSnapshot> {
        self.lock().flows.values().map(Flow::snapshot).collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_scheduler(&self) {
        self.inner.work.notify_one();
    }

    pub(crate) async fn wait_for_work(&self) {
        self.inner.work.notified().await;
    }

    pub(crate) fn notify_drained(&self) {
        self.inner.drained.notify_waiters();
    }

    /// Reject further producer calls, cancel every timer and release
    /// drain waiters. Flows stay registered for inspection.
    pub(crate) fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            for flow in state.flows.values_mut() {
                flow.halt();
            }
        }
        self.notify_drained();
    }

    /// Accept producer calls again and restart timers for flows that were
    /// stopped with packets in flight.
    pub(crate) fn reopen(&self) {
        let mut state = self.lock();
        state.closed = false;
        for flow in state.flows.values_mut() {
            flow.resume();
        }
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FlowRegistry")
            .field("flows", &state.flows.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> FlowRegistry {
        FlowRegistry::new(FlowConfig::default())
    }

    #[tokio::test]
    async fn first_enqueue_creates_flow() {
        let reg = registry();
        assert!(reg.is_empty());
        assert_eq!(reg.enqueue(FlowId(3), &b"a"[..]).unwrap(), 0);
        assert_eq!(reg.enqueue(FlowId(3), &b"b"[..]).unwrap(), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot(FlowId(3)).unwrap().last, Some(1));
    }

    #[tokio::test]
    async fn open_flow_uses_its_own_config() {
        let reg = registry();
        let config = FlowConfig {
            window_size: 16,
            ..Default::default()
        };
        reg.open_flow(FlowId(1), config.clone()).unwrap();
        assert!(matches!(
            reg.open_flow(FlowId(1), config),
            Err(EngineError::FlowExists(FlowId(1)))
        ));
        reg.enqueue(FlowId(1), Bytes::from_static(b"x")).unwrap();
        assert_eq!(reg.snapshot(FlowId(1)).unwrap().window_size, 16);
    }

    #[tokio::test]
    async fn open_flow_rejects_invalid_config() {
        let reg = registry();
        let config = FlowConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            reg.open_flow(FlowId(1), config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_wakes_scheduler() {
        let reg = registry();
        reg.enqueue(FlowId(1), &b"a"[..]).unwrap();
        // The wake was stored as a permit before anyone waited.
        tokio::time::timeout(Duration::from_secs(1), reg.wait_for_work())
            .await
            .expect("wake permit lost");
    }

    #[tokio::test]
    async fn ack_for_unknown_flow_ignored() {
        let reg = registry();
        assert!(!reg.on_ack_received(FlowId(9), 0));
        assert!(!reg.mark_finished(FlowId(9)));
    }

    #[tokio::test]
    async fn empty_registry_is_drained_immediately() {
        assert!(registry().wait_until_drained().await.is_ok());
    }

    #[tokio::test]
    async fn close_releases_drain_waiters() {
        let reg = registry();
        reg.enqueue(FlowId(1), &b"a"[..]).unwrap();

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.wait_until_drained().await })
        };
        tokio::task::yield_now().await;
        reg.close();

        assert!(matches!(waiter.await.unwrap(), Err(EngineError::Stopped)));
        assert!(matches!(
            reg.enqueue(FlowId(1), &b"b"[..]),
            Err(EngineError::Stopped)
        ));
        // Flows survive closing for inspection.
        assert!(reg.contains(FlowId(1)));
    }
}
