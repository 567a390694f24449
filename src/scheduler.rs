// Scheduler module - owns the repeating collection cycle
//
// Lifecycle: Stopped -> Running -> Stopping -> Stopped.
//
// # Architecture
// - One Tokio task runs cycles back to back, sleeping `period` after each one
// - The next cycle starts `period` after the previous one finished, so a slow
//   cycle never overlaps its successor
// - `stop()` cancels the sleep (or the cycle's fan-in) through a
//   CancellationToken and waits for the loop task to exit
// - Per-device and per-record errors are values inside the cycle; nothing
//   short of `stop()` ends the loop

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::collector::{Collector, CycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

struct Inner {
    state: SchedulerState,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Runs collection cycles at a fixed period
pub struct CollectionScheduler {
    collector: Arc<Collector>,

    /// Pause between the end of one cycle and the start of the next
    period: Duration,

    inner: Mutex<Inner>,
}

impl CollectionScheduler {
    pub fn new(collector: Arc<Collector>, period: Duration) -> Self {
        CollectionScheduler {
            collector,
            period,
            inner: Mutex::new(Inner {
                state: SchedulerState::Stopped,
                cancel: None,
                handle: None,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    /// Starts the cycle loop; does nothing unless the scheduler is stopped
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SchedulerState::Stopped {
            debug!("Scheduler already {:?}, start ignored", inner.state);
            return;
        }

        let cancel = CancellationToken::new();
        let collector = Arc::clone(&self.collector);
        let period = self.period;

        info!("Starting collection scheduler (every {}s)", period.as_secs());
        inner.handle = Some(tokio::spawn(Self::run_loop(collector, period, cancel.clone())));
        inner.cancel = Some(cancel);
        inner.state = SchedulerState::Running;
    }

    /// Stops the loop and waits until it has exited
    ///
    /// An in-flight cycle stops waiting immediately and gets its grace
    /// period to collect and flush what is already finished. No new cycle
    /// starts afterwards.
    pub async fn stop(&self) {
        let (cancel, handle) = {
            let mut inner = self.inner.lock();
            if inner.state != SchedulerState::Running {
                debug!("Scheduler is {:?}, stop ignored", inner.state);
                return;
            }
            inner.state = SchedulerState::Stopping;
            (inner.cancel.take(), inner.handle.take())
        };

        info!("Stopping collection scheduler");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler task panicked: {}", e);
            }
        }

        self.inner.lock().state = SchedulerState::Stopped;
        info!("Collection scheduler stopped");
    }

    /// Fire-and-forget cycle outside the schedule; `None` during shutdown
    pub fn force_sync(&self) -> Option<JoinHandle<CycleResult>> {
        self.collector.force_sync()
    }

    async fn run_loop(collector: Arc<Collector>, period: Duration, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let result = collector.run_cycle(&cancel).await;
            if result.cancelled {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }

        debug!("Collection loop exited");
    }
}
