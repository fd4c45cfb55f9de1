//! The loop that drives every flow's state machine.
//!
//! Each cycle takes the registry lock once, polls every flow's timer, steps
//! its state machine, and evicts flows that are finished and fully
//! acknowledged. Between cycles the loop either sleeps for the poll interval
//! or, when every flow is idle, suspends until something signals work.
//!
//! Stopping is cooperative: `stop()` clears the run flag and the loop exits
//! at the top of its next cycle. Retry exhaustion takes the same path.

use gbn_abstract::{EngineConfig, ExhaustionPolicy, FlowId, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Result, StopReason};
use crate::flow::{Flow, StepOutcome};
use crate::registry::FlowRegistry;

/// What a single pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Some flow may still make progress; poll again after the interval.
    Busy,
    /// Flows remain but none has anything to do.
    Suspend,
    /// The registry is empty.
    Drained,
    /// A flow exhausted its retries and the engine stopped.
    Stopped,
}

#[derive(Default)]
struct Control {
    loop_active: bool,
    handle: Option<JoinHandle<()>>,
    reason: Option<StopReason>,
}

struct Shared {
    config: EngineConfig,
    registry: FlowRegistry,
    transport: Arc<dyn Transport>,
    running: AtomicBool,
    control: Mutex<Control>,
}

/// Handle to the scheduling loop. Clones refer to the same loop.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let registry = FlowRegistry::new(config.flow.clone());
        Self::with_registry(config, registry, transport)
    }

    /// Drive an existing registry, e.g. one a transport already holds.
    pub fn with_registry(
        config: EngineConfig,
        registry: FlowRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                transport,
                running: AtomicBool::new(false),
                control: Mutex::new(Control::default()),
            }),
        })
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Why the last run ended, `None` while running or before the first stop.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.control().reason
    }

    /// Spawn the loop on the current tokio runtime. No-op if already running.
    pub fn start(&self) {
        let mut control = self.control();
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        control.reason = None;
        self.shared.registry.reopen();
        if control.loop_active {
            // A stopping loop has not exited yet; it sees the flag and carries on.
            return;
        }
        control.loop_active = true;
        control.handle = Some(tokio::spawn(self.clone().run()));
    }

    /// Ask the loop to exit after its current cycle. No-op if not running.
    pub fn stop(&self) {
        {
            let mut control = self.control();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
            control.reason.get_or_insert(StopReason::Requested);
        }
        self.shared.registry.wake_scheduler();
    }

    /// Wait for the loop to exit and return why it stopped.
    pub async fn join(&self) -> Option<StopReason> {
        let handle = self.control().handle.take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            error!(error = %err, "scheduler task failed");
        }
        self.stop_reason()
    }

    /// One scheduling pass over every flow.
    pub fn run_cycle(&self) -> CycleOutcome {
        let transport = self.shared.transport.as_ref();
        let mut state = self.shared.registry.lock();
        let mut evicted: Vec<FlowId> = Vec::new();
        let mut exhausted = None;

        for (id, flow) in state.flows.iter_mut() {
            flow.poll_timer();
            if flow.step(transport) == StepOutcome::RetriesExhausted {
                match self.shared.config.on_retry_exhausted {
                    ExhaustionPolicy::StopEngine => {
                        exhausted = Some(*id);
                        break;
                    }
                    ExhaustionPolicy::DropFlow => {
                        warn!(flow = %id, "dropping unreachable flow");
                        flow.halt();
                        evicted.push(*id);
                        continue;
                    }
                }
            }
            if flow.is_complete() {
                evicted.push(*id);
            }
        }

        for id in evicted {
            state.flows.remove(&id);
            info!(flow = %id, "flow evicted");
        }

        if let Some(flow) = exhausted {
            drop(state);
            self.halt(StopReason::RetriesExhausted { flow });
            return CycleOutcome::Stopped;
        }

        if state.flows.is_empty() {
            drop(state);
            self.shared.registry.notify_drained();
            return CycleOutcome::Drained;
        }

        if state.flows.values().all(Flow::is_idle) {
            CycleOutcome::Suspend
        } else {
            CycleOutcome::Busy
        }
    }

    async fn run(self) {
        let poll = self.shared.config.poll_interval();
        info!(
            window = self.shared.config.flow.window_size,
            max_retry = self.shared.config.flow.max_retry,
            "scheduler started"
        );

        loop {
            while self.is_running() {
                match self.run_cycle() {
                    CycleOutcome::Stopped => break,
                    CycleOutcome::Suspend => self.shared.registry.wait_for_work().await,
                    CycleOutcome::Busy | CycleOutcome::Drained => tokio::time::sleep(poll).await,
                }
            }

            if self.try_exit() {
                return;
            }
        }
    }

    /// Retire the loop unless `start` raced in while it was on the way out.
    fn try_exit(&self) -> bool {
        let mut control = self.control();
        if self.is_running() {
            return false;
        }
        control.loop_active = false;
        let reason = *control.reason.get_or_insert(StopReason::Requested);
        self.shared.registry.close();
        info!(%reason, "scheduler stopped");
        true
    }

    /// Stop from inside a pass. Runs without the registry lock held.
    fn halt(&self, reason: StopReason) {
        let mut control = self.control();
        self.shared.running.store(false, Ordering::Release);
        control.reason.get_or_insert(reason);
        warn!(%reason, "engine halting");
        self.shared.registry.close();
        self.shared.registry.wake_scheduler();
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.shared
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("registry", &self.shared.registry)
            .finish()
    }
}
