//! Shared delayed/periodic scheduler
//!
//! Timers run as tokio tasks. Callbacks are expected to be cheap (usually
//! posting an event to the coordinator) so they never touch shared state
//! directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Default)]
struct SchedulerInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, AbortHandle>>,
}

impl SchedulerInner {
    fn remove(&self, id: u64) -> Option<AbortHandle> {
        self.live.lock().ok().and_then(|mut live| live.remove(&id))
    }

    fn contains(&self, id: u64) -> bool {
        self.live
            .lock()
            .map(|live| live.contains_key(&id))
            .unwrap_or(false)
    }
}

/// Schedules callbacks once or repeatedly
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Handle to a scheduled callback
///
/// Cancelling is idempotent and safe after the timer has already fired.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    inner: Arc<SchedulerInner>,
}

impl TimerHandle {
    /// Stop the timer; a no-op if it already stopped
    pub fn cancel(&self) {
        if let Some(abort) = self.inner.remove(self.id) {
            abort.abort();
            debug!(timer = self.id, "Timer cancelled");
        }
    }

    /// True until a one-shot has fired or the timer is cancelled
    pub fn is_running(&self) -> bool {
        self.inner.contains(self.id)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `initial`, then every `repeat`
    ///
    /// A zero `repeat` makes the timer one-shot.
    pub fn schedule<F>(&self, mut task: F, initial: Duration, repeat: Duration) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();

        // Hold the registry lock across spawn so a zero-delay one-shot
        // cannot finish before it has been registered
        let mut live = match self.inner.live.lock() {
            Ok(live) => live,
            Err(poisoned) => poisoned.into_inner(),
        };

        let join = tokio::spawn(async move {
            if repeat.is_zero() {
                sleep(initial).await;
                if inner.remove(id).is_some() {
                    task();
                }
                return;
            }

            let mut ticker = interval_at(Instant::now() + initial, repeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        });

        live.insert(id, join.abort_handle());
        TimerHandle {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Convenience for a one-shot timer
    pub fn once<F>(&self, task: F, delay: Duration) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        self.schedule(
            move || {
                if let Some(task) = task.take() {
                    task();
                }
            },
            delay,
            Duration::ZERO,
        )
    }

    /// Cancel a timer; same as `handle.cancel()`
    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    /// Cancel every live timer
    pub fn cancel_all(&self) {
        let drained: Vec<AbortHandle> = match self.inner.live.lock() {
            Ok(mut live) => live.drain().map(|(_, abort)| abort).collect(),
            Err(_) => Vec::new(),
        };
        for abort in drained {
            abort.abort();
        }
    }

    /// Number of timers still scheduled
    pub fn active_count(&self) -> usize {
        self.inner.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}
