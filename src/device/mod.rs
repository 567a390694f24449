// Device module - the narrow capability the pipeline uses to talk to devices
//
// The collector only needs three things from a device: open a session,
// list one resource, close the session. Everything transport-specific lives
// behind the `DeviceApi` / `DeviceSession` traits so the poller can be driven
// by the RouterOS implementation in production and by fakes in tests.
//
// All calls here are blocking. The poller runs them on the blocking worker
// pool, never on the async scheduler.

use std::collections::HashMap;
use thiserror::Error;

use crate::inventory::DeviceConfig;

pub mod routeros;

/// Errors raised while talking to a device
///
/// They are always captured as values by the poller and never abort a cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Login rejected: {0}")]
    Login(String),

    #[error("Device returned an error: {0}")]
    Trap(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Device did not answer in time")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Poll cancelled before completion")]
    Cancelled,
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DeviceError::Timeout,
            _ => DeviceError::Io(e.to_string()),
        }
    }
}

/// One queue/subscriber entry as reported by a device
///
/// Vendor field names map to string-encoded values. This type never leaves a
/// single poll task; the normalizer turns it into a `NormalizedMetric`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCounterRecord {
    fields: HashMap<String, String>,
}

impl RawCounterRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl<K, V> FromIterator<(K, V)> for RawCounterRecord
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        RawCounterRecord {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Opens sessions to devices
pub trait DeviceApi: Send + Sync {
    /// Connects and authenticates. Blocks until the session is usable or
    /// the connection fails.
    fn connect(&self, config: &DeviceConfig) -> Result<Box<dyn DeviceSession>, DeviceError>;
}

/// An authenticated session with one device
pub trait DeviceSession: Send {
    /// Fetches every entry of a resource path (e.g. `/queue/simple`) in a
    /// single request
    fn list_resource(&mut self, path: &str) -> Result<Vec<RawCounterRecord>, DeviceError>;

    /// Releases the connection. Must be safe to call more than once.
    fn close(&mut self);
}

/// Closes the wrapped session when dropped, including during unwinding
pub struct SessionGuard {
    session: Box<dyn DeviceSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn DeviceSession>) -> Self {
        SessionGuard { session }
    }

    pub fn list_resource(&mut self, path: &str) -> Result<Vec<RawCounterRecord>, DeviceError> {
        self.session.list_resource(path)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSession {
        closed: Arc<AtomicUsize>,
    }

    impl DeviceSession for CountingSession {
        fn list_resource(&mut self, _path: &str) -> Result<Vec<RawCounterRecord>, DeviceError> {
            panic!("device exploded");
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_guard_closes_on_panic() {
        let closed = Arc::new(AtomicUsize::new(0));
        let session = Box::new(CountingSession {
            closed: Arc::clone(&closed),
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut guard = SessionGuard::new(session);
            let _ = guard.list_resource("/queue/simple");
        }));

        assert!(result.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_io_error_maps_to_timeout() {
        let err: DeviceError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err, DeviceError::Timeout);

        let err: DeviceError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst").into();
        assert!(matches!(err, DeviceError::Io(_)));
    }

    #[test]
    fn test_record_from_pairs() {
        let record: RawCounterRecord = [("name", "alice"), ("rate", "1/2")].into_iter().collect();
        assert_eq!(record.get("name"), Some("alice"));
        assert_eq!(record.get("rate"), Some("1/2"));
        assert_eq!(record.get("bytes"), None);
    }
}
