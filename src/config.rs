// Configuration module - process settings from flags, environment and .env
//
// This module is responsible for:
// 1. Declaring every tunable of the collector (storage, inventory, scheduling)
// 2. Reading them from command-line flags with environment-variable fallback
// 3. Validating values that would otherwise stall or break the pipeline

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors that can occur while validating configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Collector configuration
///
/// Every flag can also be supplied through the environment variable named in
/// its `env` attribute. A `.env` file in the working directory is loaded
/// before parsing.
///
/// # Example
/// ```bash
/// queue-metrics-collector --mongodb "mongodb://localhost:27017" --routers-path routers.json
/// MONGODB_URI=mongodb://localhost:27017 ROUTERS_JSON_ENV='[...]' queue-metrics-collector
/// ```
#[derive(Parser, Debug, Clone)]
#[command(name = "queue-metrics-collector", version, about = "Polls RouterOS queues and stores traffic counters")]
pub struct AppConfig {
    /// MongoDB connection URI
    #[arg(long = "mongodb", env = "MONGODB_URI")]
    pub mongodb_uri: String,

    /// Database holding the metrics collection
    #[arg(long = "database", env = "MONGODB_DATABASE", default_value = "monitoring")]
    pub database_name: String,

    /// Collection that receives one document per point
    #[arg(long, env = "METRICS_COLLECTION", default_value = "queue_traffic")]
    pub collection: String,

    /// Measurement name stamped on every point
    #[arg(long, env = "METRICS_MEASUREMENT", default_value = "mikrotik_traffic")]
    pub measurement: String,

    /// Inline JSON inventory; takes precedence over --routers-path
    #[arg(long = "routers-json", env = "ROUTERS_JSON_ENV")]
    pub routers_json: Option<String>,

    /// JSON inventory file
    #[arg(long = "routers-path", env = "ROUTERS_JSON_PATH", default_value = "routers.json")]
    pub routers_path: PathBuf,

    /// Seconds between the end of one cycle and the start of the next
    #[arg(long = "interval-secs", env = "COLLECTOR_INTERVAL_SECONDS", default_value_t = 300)]
    pub interval_secs: u64,

    /// Maximum number of devices polled at the same time
    #[arg(long = "pool-size", env = "COLLECTOR_POOL_SIZE", default_value_t = 20)]
    pub pool_size: usize,

    /// Connect/read/write timeout for a single device
    #[arg(long = "device-timeout-secs", env = "DEVICE_TIMEOUT_SECONDS", default_value_t = 10)]
    pub device_timeout_secs: u64,

    /// Points per storage write
    #[arg(long = "batch-size", env = "WRITER_BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,

    /// How long stop() waits for in-flight device polls
    #[arg(long = "shutdown-grace-secs", env = "SHUTDOWN_GRACE_SECONDS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Listen address of the health / forced-sync HTTP surface
    #[arg(long = "http-addr", env = "HTTP_ADDR", default_value = "0.0.0.0:8000")]
    pub http_addr: String,

    /// Create query indexes on the metrics collection at startup
    #[arg(long = "create-indexes")]
    pub create_indexes: bool,
}

impl AppConfig {
    /// Rejects settings the pipeline cannot run with
    ///
    /// # Returns
    /// * `Ok(SocketAddr)` - The parsed HTTP listen address
    /// * `Err(ConfigError)` - First invalid setting found
    pub fn validate(&self) -> Result<SocketAddr, ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval-secs", "must be greater than 0".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool-size", "must be greater than 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch-size", "must be greater than 0".into()));
        }
        self.http_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid("http-addr", format!("{}: {}", self.http_addr, e)))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Logs the effective settings (credentials excluded)
    pub fn log_summary(&self) {
        info!("Database: '{}', collection: '{}'", self.database_name, self.collection);
        info!(
            "Inventory: {}",
            if self.routers_json.is_some() {
                "inline JSON".to_string()
            } else {
                format!("file {}", self.routers_path.display())
            }
        );
        info!(
            "Cycle every {}s, pool size {}, device timeout {}s",
            self.interval_secs, self.pool_size, self.device_timeout_secs
        );
        info!(
            "Writer batch size {}, shutdown grace {}s",
            self.batch_size, self.shutdown_grace_secs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> AppConfig {
        let mut args = vec!["queue-metrics-collector", "--mongodb", "mongodb://localhost:27017"];
        args.extend_from_slice(extra);
        AppConfig::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);

        assert_eq!(config.database_name, "monitoring");
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.interval(), Duration::from_secs(300));
        assert_eq!(config.routers_path, PathBuf::from("routers.json"));
        assert!(!config.create_indexes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--interval-secs",
            "60",
            "--pool-size",
            "4",
            "--http-addr",
            "127.0.0.1:9000",
            "--create-indexes",
        ]);

        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.pool_size, 4);
        assert!(config.create_indexes);
        assert_eq!(config.validate().unwrap().port(), 9000);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = parse(&["--pool-size", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("pool-size", _))));

        let config = parse(&["--interval-secs", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("interval-secs", _))));
    }

    #[test]
    fn test_validate_rejects_bad_http_addr() {
        let config = parse(&["--http-addr", "not-an-address"]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("http-addr", _))));
    }
}
