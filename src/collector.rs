// Collector - one collection cycle, fan-out over the device fleet
//
// A cycle reads the inventory, takes a single timestamp, polls every device
// concurrently through the `DevicePoller`, turns the normalized metrics into
// points stamped with that timestamp and hands them to the writer.
//
// Each device resolves to its own typed outcome; a failing device never
// cancels or delays the others.
//
// Forced cycles run on a `TaskTracker` so shutdown can cancel them and wait
// until their points are written.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::device::DeviceError;
use crate::health::HealthReporter;
use crate::inventory::InventoryProvider;
use crate::normalizer::NormalizedMetric;
use crate::poller::DevicePoller;
use crate::storage::{StorageError, TimeSeriesPoint, TimeSeriesWriter};

/// Outcome of polling one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOutcome {
    pub alias: String,

    /// Number of queues collected, or why the device failed
    pub result: Result<usize, DeviceError>,
}

/// Outcome of one collection cycle
#[derive(Debug, Clone)]
pub struct CycleResult {
    /// Shared by every point of the cycle
    pub timestamp: DateTime<Utc>,

    pub devices_attempted: usize,

    pub outcomes: Vec<DeviceOutcome>,

    /// Points that reached the store
    pub points_written: usize,

    pub storage_error: Option<StorageError>,

    /// Set when the cycle was stopped before every device answered
    pub cancelled: bool,
}

impl CycleResult {
    fn new(timestamp: DateTime<Utc>, devices_attempted: usize) -> Self {
        CycleResult {
            timestamp,
            devices_attempted,
            outcomes: Vec::with_capacity(devices_attempted),
            points_written: 0,
            storage_error: None,
            cancelled: false,
        }
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }
}

type PollResult = (usize, Result<Vec<NormalizedMetric>, DeviceError>);

pub struct Collector {
    inventory: InventoryProvider,
    poller: Arc<DevicePoller>,
    writer: Arc<TimeSeriesWriter>,
    health: Arc<HealthReporter>,

    /// Measurement name of every point
    measurement: String,

    /// How long a cancelled cycle waits for in-flight polls
    grace: Duration,

    forced: TaskTracker,

    /// Fired at shutdown; cancels forced cycles still running
    forced_cancel: CancellationToken,
}

impl Collector {
    pub fn new(
        inventory: InventoryProvider,
        poller: Arc<DevicePoller>,
        writer: Arc<TimeSeriesWriter>,
        health: Arc<HealthReporter>,
        measurement: String,
        grace: Duration,
    ) -> Self {
        Collector {
            inventory,
            poller,
            writer,
            health,
            measurement,
            grace,
            forced: TaskTracker::new(),
            forced_cancel: CancellationToken::new(),
        }
    }

    /// Runs one full cycle
    ///
    /// When `cancel` fires, the cycle stops waiting immediately, gives the
    /// polls still in flight up to the grace period to finish, writes every
    /// point collected so far without waiting for the batch to fill, and
    /// reports the remaining devices as cancelled.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleResult {
        let devices = self.inventory.list().await;
        let timestamp = Utc::now();
        let mut result = CycleResult::new(timestamp, devices.len());

        if devices.is_empty() {
            warn!("No devices found in inventory, nothing to collect");
            self.health.record_cycle(&result);
            return result;
        }

        info!("Starting collection for {} device(s)", devices.len());

        let mut pending = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for (index, device) in devices.into_iter().enumerate() {
            pending.insert(index, device.alias.clone());
            let poller = Arc::clone(&self.poller);
            tasks.spawn(async move { (index, poller.poll(device).await) });
        }

        let mut points = Vec::new();
        let cancelled = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                joined = tasks.join_next() => match joined {
                    Some(joined) => self.absorb(joined, timestamp, &mut pending, &mut result, &mut points),
                    None => break false,
                },
            }
        };

        if cancelled {
            warn!(
                "Cycle cancelled, waiting up to {:?} for {} in-flight poll(s)",
                self.grace,
                pending.len()
            );
            let drain = async {
                while let Some(joined) = tasks.join_next().await {
                    self.absorb(joined, timestamp, &mut pending, &mut result, &mut points);
                }
            };
            if tokio::time::timeout(self.grace, drain).await.is_err() {
                warn!("{} poll(s) still running after grace period, abandoning", pending.len());
            }
            // Blocking workers finish on their own and close their sessions.
            tasks.detach_all();
            result.cancelled = true;
        }

        for (_, alias) in pending {
            let reason = if cancelled {
                DeviceError::Cancelled
            } else {
                DeviceError::Worker("poll task ended without a result".into())
            };
            result.outcomes.push(DeviceOutcome {
                alias,
                result: Err(reason),
            });
        }

        let total = points.len();
        match self.writer.write_now(points).await {
            Ok(_) => result.points_written = total,
            Err(e) => {
                error!("Storage write failed for cycle {}: {}", timestamp, e);
                if let StorageError::BatchFailed { failed, .. } = &e {
                    result.points_written = total.saturating_sub(*failed);
                }
                result.storage_error = Some(e);
            }
        }

        info!(
            "Collection cycle finished. Succeeded: {}/{}, points written: {}",
            result.successes(),
            result.devices_attempted,
            result.points_written
        );

        self.health.record_cycle(&result);
        result
    }

    /// Starts an out-of-band cycle in the background
    ///
    /// Independent of the schedule; may overlap a scheduled cycle. Returns
    /// `None` once `shutdown_forced()` has been called.
    pub fn force_sync(self: &Arc<Self>) -> Option<JoinHandle<CycleResult>> {
        if self.forced.is_closed() {
            warn!("Forced collection refused, shutting down");
            return None;
        }

        let collector = Arc::clone(self);
        let cancel = self.forced_cancel.child_token();
        Some(self.forced.spawn(async move {
            info!("Forced collection requested");
            collector.run_cycle(&cancel).await
        }))
    }

    /// Cancels forced cycles and waits until they have written their points
    ///
    /// Each one gets the grace period for its in-flight polls and the same
    /// again for its write.
    pub async fn shutdown_forced(&self) {
        self.forced.close();
        self.forced_cancel.cancel();

        if self.forced.is_empty() {
            return;
        }

        info!("Waiting for {} forced cycle(s) to finish", self.forced.len());
        if tokio::time::timeout(self.grace * 2, self.forced.wait()).await.is_err() {
            warn!("Forced cycle(s) still running after shutdown grace, abandoning");
        }
    }

    fn absorb(
        &self,
        joined: Result<PollResult, JoinError>,
        timestamp: DateTime<Utc>,
        pending: &mut BTreeMap<usize, String>,
        result: &mut CycleResult,
        points: &mut Vec<TimeSeriesPoint>,
    ) {
        let (index, polled) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                // Left in `pending`; reported once the cycle settles.
                error!("Poll task failed: {}", e);
                return;
            }
        };

        let Some(alias) = pending.remove(&index) else {
            return;
        };

        let outcome = match polled {
            Ok(metrics) => {
                let count = metrics.len();
                points.extend(
                    metrics
                        .into_iter()
                        .map(|metric| self.to_point(metric, &alias, timestamp)),
                );
                Ok(count)
            }
            Err(e) => Err(e),
        };

        result.outcomes.push(DeviceOutcome {
            alias,
            result: outcome,
        });
    }

    fn to_point(&self, metric: NormalizedMetric, alias: &str, timestamp: DateTime<Utc>) -> TimeSeriesPoint {
        TimeSeriesPoint::new(self.measurement.as_str(), timestamp)
            .tag("user_name", metric.name)
            .tag("target_ip", metric.target_ip)
            .tag("plan_profile", metric.plan_profile)
            .tag("router_alias", alias)
            .field("upload_bps", metric.upload_bps)
            .field("download_bps", metric.download_bps)
            .field("upload_bytes", metric.upload_bytes)
            .field("download_bytes", metric.download_bytes)
            .field("upload_packets", metric.upload_packets)
            .field("download_packets", metric.download_packets)
            .field("dropped_upload", metric.dropped_upload)
            .field("dropped_download", metric.dropped_download)
    }
}
