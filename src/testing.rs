// Test doubles shared by the unit tests of the pipeline modules

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::device::{DeviceApi, DeviceError, DeviceSession, RawCounterRecord};
use crate::inventory::DeviceConfig;
use crate::storage::{PointSink, StorageError, TimeSeriesPoint};

pub fn device(alias: &str) -> DeviceConfig {
    DeviceConfig {
        host: format!("{}.lan", alias),
        port: 8728,
        username: "api".into(),
        password: "secret".into(),
        alias: alias.into(),
        use_ssl: false,
        ssl_verify: false,
    }
}

pub fn queue(name: &str, bytes: &str) -> RawCounterRecord {
    [
        ("name", name),
        ("target", "10.0.0.1/32"),
        ("rate", "100/200"),
        ("bytes", bytes),
    ]
    .into_iter()
    .collect()
}

/// Scripted device API
///
/// Every alias listed in `failing` refuses connections. Other devices return
/// their scripted records (or a single default queue) after `delay`.
#[derive(Default)]
pub struct FakeDeviceApi {
    pub failing: Vec<String>,
    pub records: HashMap<String, Vec<RawCounterRecord>>,
    pub delay: Duration,
    pub connected: Arc<AtomicUsize>,
    pub max_connected: Arc<AtomicUsize>,
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    pub listed: Arc<AtomicUsize>,
}

impl FakeDeviceApi {
    pub fn with_delay(delay: Duration) -> Self {
        FakeDeviceApi {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(mut self, aliases: &[&str]) -> Self {
        self.failing = aliases.iter().map(|a| a.to_string()).collect();
        self
    }
}

impl DeviceApi for FakeDeviceApi {
    fn connect(&self, config: &DeviceConfig) -> Result<Box<dyn DeviceSession>, DeviceError> {
        if self.failing.contains(&config.alias) {
            return Err(DeviceError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: "connection refused".into(),
            });
        }

        let now = self.connected.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_connected.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);

        let records = self
            .records
            .get(&config.alias)
            .cloned()
            .unwrap_or_else(|| vec![queue(&format!("{}-user", config.alias), "10/20")]);

        Ok(Box::new(FakeSession {
            records,
            delay: self.delay,
            connected: Arc::clone(&self.connected),
            closed: Arc::clone(&self.closed),
            listed: Arc::clone(&self.listed),
            open: true,
        }))
    }
}

struct FakeSession {
    records: Vec<RawCounterRecord>,
    delay: Duration,
    connected: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    listed: Arc<AtomicUsize>,
    open: bool,
}

impl DeviceSession for FakeSession {
    fn list_resource(&mut self, _path: &str) -> Result<Vec<RawCounterRecord>, DeviceError> {
        self.listed.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(self.records.clone())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.connected.fetch_sub(1, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// In-memory point sink with switchable failures
#[derive(Default)]
pub struct MemorySink {
    pub batches: Mutex<Vec<Vec<TimeSeriesPoint>>>,
    pub fail_writes: AtomicBool,
    pub unreachable: AtomicBool,
}

impl MemorySink {
    pub fn points(&self) -> Vec<TimeSeriesPoint> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl PointSink for MemorySink {
    async fn write_batch(&self, points: &[TimeSeriesPoint]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write("injected failure".into()));
        }
        self.batches.lock().push(points.to_vec());
        Ok(())
    }

    async fn ping(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}
