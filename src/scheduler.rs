//! Shared eviction scheduling
//!
//! One scheduler instance is shared across every pool of a process, the way
//! a shared executor backs all of a client's connection pools. Eviction work
//! is opportunistic and brief, so a single worker thread suffices.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};

pub struct EvictionScheduler {
    runtime: Runtime,
}

impl EvictionScheduler {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sealpool-eviction")
            .enable_time()
            .build()?;
        Ok(Self { runtime })
    }

    /// Run `task` on the scheduler thread as soon as possible.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.runtime.spawn(async move { task() });
    }

    /// Run `task` after `delay` and then at a fixed `interval`, until the
    /// returned handle is cancelled or the task itself returns false.
    pub fn schedule_at_fixed_rate(
        &self,
        delay: Duration,
        interval: Duration,
        task: impl Fn() -> bool + Send + 'static,
    ) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cancelled);
        // interval_at rejects a zero period.
        let period = interval.max(Duration::from_millis(1));
        let handle = self.runtime.spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if observed.load(Ordering::Acquire) || !task() {
                    break;
                }
            }
        });
        ScheduledTask {
            cancelled,
            abort: handle.abort_handle(),
        }
    }
}

/// Handle to a periodic task. Dropping the handle does not stop the task;
/// it must be cancelled.
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl ScheduledTask {
    /// Stop the task. Returns true only for the call that performed the
    /// cancellation.
    pub fn cancel(&self) -> bool {
        let cancelled = !self.cancelled.swap(true, Ordering::AcqRel);
        self.abort.abort();
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
