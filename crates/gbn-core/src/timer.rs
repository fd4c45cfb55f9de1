//! Single-shot retransmission timer.
//!
//! One timer per flow, guarding the oldest unacknowledged packet. Expiry is
//! only recorded here; the scheduler picks it up with [`Timer::take_expired`]
//! during its pass and runs the protocol logic under the registry lock.
//!
//! Cancellation uses a generation counter: every `arm`/`disarm` bumps the
//! generation, and a firing task only counts if it fired for the generation
//! that is still current.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

pub struct Timer {
    generation: u64,
    /// Highest generation whose deadline has passed.
    fired: Arc<AtomicU64>,
    wake: Arc<Notify>,
    task: Option<AbortHandle>,
    armed: bool,
}

impl Timer {
    /// `wake` is notified when the timer fires so a suspended scheduler
    /// re-runs its pass.
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            generation: 0,
            fired: Arc::new(AtomicU64::new(0)),
            wake,
            task: None,
            armed: false,
        }
    }

    /// Schedule one expiry after `duration`, replacing any pending one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&mut self, duration: Duration) {
        self.cancel_task();
        self.generation += 1;
        self.armed = true;

        let generation = self.generation;
        let fired = Arc::clone(&self.fired);
        let wake = Arc::clone(&self.wake);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            fired.fetch_max(generation, Ordering::AcqRel);
            wake.notify_one();
        });
        self.task = Some(handle.abort_handle());
    }

    /// Cancel the pending expiry, if any. Safe to call repeatedly.
    pub fn disarm(&mut self) {
        if !self.armed && self.task.is_none() {
            return;
        }
        self.cancel_task();
        self.generation += 1;
        self.armed = false;
    }

    /// `true` while an arm is outstanding (pending or fired but not yet taken).
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// `true` if the current arm has fired and has not been consumed.
    pub fn is_expired(&self) -> bool {
        self.armed && self.fired.load(Ordering::Acquire) >= self.generation
    }

    /// Consume a pending expiry. Returns `true` at most once per arm.
    pub fn take_expired(&mut self) -> bool {
        if !self.is_expired() {
            return false;
        }
        self.armed = false;
        self.task = None;
        true
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("generation", &self.generation)
            .field("armed", &self.armed)
            .field("expired", &self.is_expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(100);

    fn timer() -> Timer {
        Timer::new(Arc::new(Notify::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_deadline() {
        let mut t = timer();
        t.arm(TICK);
        assert!(t.is_armed());
        assert!(!t.take_expired());

        tokio::time::sleep(TICK + Duration::from_millis(1)).await;
        assert!(t.take_expired());
        assert!(!t.take_expired());
        assert!(!t.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_expiry() {
        let mut t = timer();
        t.arm(TICK);
        t.disarm();
        t.disarm();
        tokio::time::sleep(TICK * 2).await;
        assert!(!t.take_expired());
        assert!(!t.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_restarts_deadline() {
        let mut t = timer();
        t.arm(TICK);
        tokio::time::sleep(TICK / 2).await;
        t.arm(TICK);

        // The first deadline passes without effect.
        tokio::time::sleep(TICK / 2 + Duration::from_millis(1)).await;
        assert!(!t.take_expired());

        tokio::time::sleep(TICK / 2).await;
        assert!(t.take_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn firing_wakes_waiter() {
        let wake = Arc::new(Notify::new());
        let mut t = Timer::new(Arc::clone(&wake));
        t.arm(TICK);
        wake.notified().await;
        assert!(t.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fire_is_ignored_after_disarm() {
        let mut t = timer();
        t.arm(TICK);
        tokio::time::sleep(TICK + Duration::from_millis(1)).await;
        // Fired but never consumed; disarming discards it.
        t.disarm();
        assert!(!t.is_expired());
        assert!(!t.take_expired());
    }
}
