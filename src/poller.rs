// Device poller - per-device blocking interaction, isolated on a worker pool
//
// Device I/O is blocking, so every poll runs on Tokio's blocking thread pool
// and the async side only awaits its completion. A semaphore caps how many
// polls hold a connection at once, regardless of fleet size. The permit is
// moved into the blocking closure, so it is released only after the session
// has been closed.
//
// Failures never escape as faults: each poll resolves to a `Result` value.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::device::{DeviceApi, DeviceError, SessionGuard};
use crate::inventory::DeviceConfig;
use crate::normalizer::{normalize_all, NormalizedMetric};

/// Resource listing the per-subscriber simple queues
pub const QUEUE_RESOURCE: &str = "/queue/simple";

pub struct DevicePoller {
    api: Arc<dyn DeviceApi>,

    /// Bounds simultaneous device connections
    pool: Arc<Semaphore>,

    resource: String,
}

impl DevicePoller {
    /// Creates a poller allowing at most `pool_size` concurrent sessions
    pub fn new(api: Arc<dyn DeviceApi>, pool_size: usize) -> Self {
        DevicePoller {
            api,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            resource: QUEUE_RESOURCE.to_string(),
        }
    }

    /// Fetches and normalizes every queue of one device
    ///
    /// Opens its own session, lists the queue resource in one request and
    /// closes the session before returning, whatever the outcome.
    pub async fn poll(&self, device: DeviceConfig) -> Result<Vec<NormalizedMetric>, DeviceError> {
        let api = Arc::clone(&self.api);
        let resource = self.resource.clone();
        let alias = device.alias.clone();
        let host = device.host.clone();

        let result = self
            .run_blocking(move || fetch_queues(api.as_ref(), &device, &resource))
            .await;

        match &result {
            Ok(metrics) => debug!("Polled {} queue(s) from '{}'", metrics.len(), alias),
            Err(e) => error!("Error collecting from device '{}' ({}): {}", alias, host, e),
        }

        result
    }

    /// Connectivity probe: connect and close, no data fetched
    pub async fn probe(&self, device: DeviceConfig) -> Result<(), DeviceError> {
        let api = Arc::clone(&self.api);
        self.run_blocking(move || {
            api.connect(&device).map(|session| drop(SessionGuard::new(session)))
        })
        .await
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
    {
        let permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| DeviceError::Worker("worker pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .unwrap_or_else(|e| Err(DeviceError::Worker(e.to_string())))
    }
}

fn fetch_queues(
    api: &dyn DeviceApi,
    device: &DeviceConfig,
    resource: &str,
) -> Result<Vec<NormalizedMetric>, DeviceError> {
    let mut session = SessionGuard::new(api.connect(device)?);
    let records = session.list_resource(resource)?;
    drop(session);

    Ok(normalize_all(&records, &device.alias))
}
