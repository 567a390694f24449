// Storage module - time-series points and their persistence to MongoDB
//
// This module is responsible for:
// 1. The point model shared by every cycle (measurement, tags, fields, time)
// 2. The `PointSink` seam to the store (MongoDB in production)
// 3. Splitting points into batches in `TimeSeriesWriter` and reporting
//    failed batches to the caller

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::{Client, Collection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long a health ping may wait for the server
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that can occur while persisting points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Write failed: {0}")]
    Write(String),

    #[error("{failed} point(s) lost in failed batch(es), {written} written: {reason}")]
    BatchFailed {
        failed: usize,
        written: usize,
        reason: String,
    },

    #[error("MongoDB connection failed: {0}")]
    Connect(String),
}

impl From<mongodb::error::Error> for StorageError {
    fn from(e: mongodb::error::Error) -> Self {
        StorageError::Write(e.to_string())
    }
}

/// A numeric or string field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        // BSON has no unsigned 64-bit type; counters that large saturate.
        FieldValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<FieldValue> for Bson {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Int(v) => Bson::Int64(v),
            FieldValue::Float(v) => Bson::Double(v),
            FieldValue::Text(v) => Bson::String(v),
        }
    }
}

/// One time-stamped, tagged, multi-field record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

impl TimeSeriesPoint {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        TimeSeriesPoint {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// MongoDB document layout:
    /// ```json
    /// {
    ///   "measurement": "mikrotik_traffic",
    ///   "tags": { "router_alias": "core", "user_name": "alice", ... },
    ///   "fields": { "upload_bps": 1000, "download_bytes": 123456, ... },
    ///   "time": ISODate("2024-01-15T10:30:00Z")
    /// }
    /// ```
    pub fn to_document(&self) -> Document {
        let tags: Document = self
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
            .collect();
        let fields: Document = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), Bson::from(v.clone())))
            .collect();

        doc! {
            "measurement": &self.measurement,
            "tags": tags,
            "fields": fields,
            "time": bson::DateTime::from_chrono(self.time),
        }
    }
}

/// Write path of the time-series store
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Persists a batch. Either the whole batch is handed to the store or an
    /// error is returned for the whole batch.
    async fn write_batch(&self, points: &[TimeSeriesPoint]) -> Result<(), StorageError>;

    /// Whether the store is reachable
    async fn ping(&self) -> bool;
}

/// MongoDB-backed point sink
///
/// Every point becomes one document in a single collection.
pub struct MongoPointSink {
    client: Client,
    database_name: String,
    collection_name: String,
    ping_timeout: Duration,
}

impl MongoPointSink {
    /// Creates the MongoDB client
    ///
    /// The driver connects lazily; an unreachable server is reported by
    /// `ping()` and by failed writes, not here.
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI (e.g., "mongodb://localhost:27017")
    /// * `database_name` - Database holding the metrics collection
    /// * `collection_name` - Collection receiving the points
    pub async fn connect(
        connection_string: &str,
        database_name: &str,
        collection_name: &str,
    ) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(connection_string)
            .await
            .map_err(|e| StorageError::Connect(e.to_string()))?;

        Ok(MongoPointSink {
            client,
            database_name: database_name.to_string(),
            collection_name: collection_name.to_string(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        })
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    fn collection(&self) -> Collection<Document> {
        self.client
            .database(&self.database_name)
            .collection(&self.collection_name)
    }

    /// Creates indexes for the usual history queries
    ///
    /// # Indexes
    /// - `tags.router_alias` + `time` - per-device history
    /// - `tags.user_name` + `time` - per-subscriber history
    pub async fn create_indexes(&self) -> Result<(), StorageError> {
        use mongodb::options::IndexOptions;
        use mongodb::IndexModel;

        info!("Creating indexes for collection '{}'", self.collection_name);

        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "tags.router_alias": 1, "time": -1 })
                .options(IndexOptions::builder().name("router_time_idx".to_string()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "tags.user_name": 1, "time": -1 })
                .options(IndexOptions::builder().name("user_time_idx".to_string()).build())
                .build(),
        ];

        self.collection().create_indexes(indexes, None).await?;
        info!("Successfully created indexes for collection '{}'", self.collection_name);
        Ok(())
    }
}

#[async_trait]
impl PointSink for MongoPointSink {
    async fn write_batch(&self, points: &[TimeSeriesPoint]) -> Result<(), StorageError> {
        if points.is_empty() {
            return Ok(());
        }

        let documents: Vec<Document> = points.iter().map(TimeSeriesPoint::to_document).collect();
        let result = self.collection().insert_many(documents, None).await?;

        debug!(
            "Inserted {} point(s) into '{}'",
            result.inserted_ids.len(),
            self.collection_name
        );
        Ok(())
    }

    async fn ping(&self) -> bool {
        let admin = self.client.database("admin");
        let ping = admin.run_command(doc! { "ping": 1 }, None);

        match tokio::time::timeout(self.ping_timeout, ping).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("MongoDB ping failed: {}", e);
                false
            }
            Err(_) => {
                warn!("MongoDB ping timed out after {:?}", self.ping_timeout);
                false
            }
        }
    }
}

/// Writes points to a `PointSink` in batches of at most `batch_size`
///
/// Every call writes all of its points before returning, so the caller
/// learns exactly how many reached the store. A failed batch is dropped;
/// the batches after it are still attempted.
pub struct TimeSeriesWriter {
    sink: Arc<dyn PointSink>,
    batch_size: usize,
}

impl TimeSeriesWriter {
    pub fn new(sink: Arc<dyn PointSink>, batch_size: usize) -> Self {
        TimeSeriesWriter {
            sink,
            batch_size: batch_size.max(1),
        }
    }

    /// Writes the points immediately
    ///
    /// # Returns
    /// * `Ok(usize)` - Points written to the store
    /// * `Err(StorageError::BatchFailed)` - At least one batch failed; carries
    ///   the failed and written counts
    pub async fn write_now(&self, points: Vec<TimeSeriesPoint>) -> Result<usize, StorageError> {
        let mut written = 0;
        let mut failed = 0;
        let mut last_error = None;

        for batch in points.chunks(self.batch_size) {
            match self.sink.write_batch(batch).await {
                Ok(()) => written += batch.len(),
                Err(e) => {
                    error!("Failed to write batch of {} point(s): {}", batch.len(), e);
                    failed += batch.len();
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => Ok(written),
            Some(e) => Err(StorageError::BatchFailed {
                failed,
                written,
                reason: e.to_string(),
            }),
        }
    }
}
