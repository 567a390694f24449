// Health reporter - storage reachability and per-device connectivity
//
// Overall status follows storage only: `healthy` when the store answers its
// ping, `degraded` otherwise. Device connectivity is reported per alias and
// never changes the overall status.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::collector::CycleResult;
use crate::inventory::InventoryProvider;
use crate::poller::DevicePoller;
use crate::storage::PointSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Connected,
    Disconnected,
}

impl From<bool> for Connectivity {
    fn from(reachable: bool) -> Self {
        if reachable {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Components {
    pub storage: Connectivity,

    /// Keyed by device alias
    pub devices: BTreeMap<String, Connectivity>,
}

/// Condensed view of the latest finished cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub timestamp: DateTime<Utc>,
    pub devices_attempted: usize,
    pub successes: usize,
    pub failures: usize,
    pub points_written: usize,
    pub storage_error: Option<String>,
    pub cancelled: bool,
    pub devices: BTreeMap<String, Connectivity>,
}

impl From<&CycleResult> for CycleSummary {
    fn from(result: &CycleResult) -> Self {
        CycleSummary {
            timestamp: result.timestamp,
            devices_attempted: result.devices_attempted,
            successes: result.successes(),
            failures: result.failures(),
            points_written: result.points_written,
            storage_error: result.storage_error.as_ref().map(|e| e.to_string()),
            cancelled: result.cancelled,
            devices: result
                .outcomes
                .iter()
                .map(|o| (o.alias.clone(), Connectivity::from(o.result.is_ok())))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Components,
    pub inventory_size: usize,
    pub last_cycle: Option<CycleSummary>,
}

/// Builds the aggregate from raw reachability results
pub fn aggregate(storage_reachable: bool, probes: Vec<(String, bool)>) -> (HealthStatus, Components) {
    let status = if storage_reachable {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    let components = Components {
        storage: storage_reachable.into(),
        devices: probes
            .into_iter()
            .map(|(alias, reachable)| (alias, reachable.into()))
            .collect(),
    };

    (status, components)
}

pub struct HealthReporter {
    inventory: InventoryProvider,
    poller: Arc<DevicePoller>,
    sink: Arc<dyn PointSink>,
    last_cycle: RwLock<Option<CycleSummary>>,
}

impl HealthReporter {
    pub fn new(inventory: InventoryProvider, poller: Arc<DevicePoller>, sink: Arc<dyn PointSink>) -> Self {
        HealthReporter {
            inventory,
            poller,
            sink,
            last_cycle: RwLock::new(None),
        }
    }

    /// Remembers the outcome of a finished cycle
    pub fn record_cycle(&self, result: &CycleResult) {
        *self.last_cycle.write() = Some(CycleSummary::from(result));
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.read().clone()
    }

    /// Pings storage and probes every device in the inventory
    ///
    /// Probes share the poller's worker pool; one probe failing does not
    /// affect the others.
    pub async fn check(&self) -> HealthReport {
        let devices = self.inventory.list().await;
        let inventory_size = devices.len();

        let probes = join_all(devices.into_iter().map(|device| {
            let alias = device.alias.clone();
            async move { (alias, self.poller.probe(device).await.is_ok()) }
        }));

        let (storage_reachable, probes) = tokio::join!(self.sink.ping(), probes);
        debug!(
            "Health check: storage reachable={}, {} device probe(s)",
            storage_reachable,
            probes.len()
        );

        let (status, components) = aggregate(storage_reachable, probes);
        HealthReport {
            status,
            components,
            inventory_size,
            last_cycle: self.last_cycle(),
        }
    }
}
