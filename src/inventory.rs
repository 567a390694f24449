// Inventory module - resolves the set of devices to poll
//
// The inventory is re-read at the start of every cycle so that devices can be
// added or removed without restarting the collector. Two sources are
// supported: an inline JSON string (takes precedence) and a JSON file.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Default RouterOS API port (plain)
pub const DEFAULT_API_PORT: u16 = 8728;

/// Default RouterOS API port (TLS)
pub const DEFAULT_API_SSL_PORT: u16 = 8729;

/// Errors that can occur while loading the inventory
///
/// These never leave this module: `InventoryProvider::list` logs them and
/// returns an empty inventory instead.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Inventory is not a JSON list: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity and connection parameters of one polled device
///
/// # Example inventory entry
/// ```json
/// {
///   "host": "10.0.0.1",
///   "port": 8728,
///   "username": "api",
///   "password": "secret",
///   "alias": "core-router",
///   "use_ssl": false,
///   "ssl_verify": false
/// }
/// ```
#[derive(Clone, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub password: String,

    /// Stable name used to tag points and key health results
    pub alias: String,

    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default)]
    pub ssl_verify: bool,
}

fn default_port() -> u16 {
    DEFAULT_API_PORT
}

impl DeviceConfig {
    /// Port to dial, switching the plain default to the TLS default when
    /// `use_ssl` is set
    pub fn effective_port(&self) -> u16 {
        if self.use_ssl && self.port == DEFAULT_API_PORT {
            DEFAULT_API_SSL_PORT
        } else {
            self.port
        }
    }
}

// Keep passwords out of logs.
impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .field("alias", &self.alias)
            .field("use_ssl", &self.use_ssl)
            .field("ssl_verify", &self.ssl_verify)
            .finish()
    }
}

/// Supplies the current device list from the configured source
#[derive(Debug, Clone, Default)]
pub struct InventoryProvider {
    /// Inline JSON list (e.g. from ROUTERS_JSON_ENV)
    inline: Option<String>,

    /// JSON file used when no inline list is configured
    path: Option<PathBuf>,
}

impl InventoryProvider {
    pub fn new(inline: Option<String>, path: Option<PathBuf>) -> Self {
        // An empty env var counts as unset.
        let inline = inline.filter(|s| !s.trim().is_empty());
        InventoryProvider { inline, path }
    }

    /// Returns the devices to poll for this cycle
    ///
    /// Never fails: a missing source, an unreadable file or a malformed list
    /// all yield an empty inventory (logged). Individual entries that do not
    /// describe a device are dropped without affecting the rest.
    pub async fn list(&self) -> Vec<DeviceConfig> {
        match self.load().await {
            Ok(devices) => devices,
            Err(e) => {
                error!("Error loading device inventory: {}", e);
                Vec::new()
            }
        }
    }

    async fn load(&self) -> Result<Vec<DeviceConfig>, InventoryError> {
        if let Some(inline) = &self.inline {
            debug!("Loading inventory from inline JSON");
            return parse_inventory(inline);
        }

        let Some(path) = &self.path else {
            debug!("No inventory source configured");
            return Ok(Vec::new());
        };

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!("Inventory file {} does not exist", path.display());
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| InventoryError::Io {
                path: path.clone(),
                source,
            })?;

        parse_inventory(&content)
    }
}

/// Parses a JSON list of devices, skipping entries that fail validation
pub fn parse_inventory(content: &str) -> Result<Vec<DeviceConfig>, InventoryError> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(content)?;

    let mut devices = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<DeviceConfig>(entry) {
            Ok(device) => devices.push(device),
            Err(e) => warn!("Skipping inventory entry #{}: {}", index, e),
        }
    }

    Ok(devices)
}
