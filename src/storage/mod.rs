//! Device registry persistence
//!
//! Ingestion handlers and the HTTP API depend on [`DeviceRepository`] only;
//! [`InMemoryRepository`] is the implementation shipped with the binary.

use crate::models::{CreateDeviceRequest, Device, DeviceData, DeviceStatus, UpdateDeviceRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod retention;

pub use memory::InMemoryRepository;
pub use retention::{purge_telemetry_before, run_retention_sweep};

/// Default number of telemetry rows returned by a query
pub const DEFAULT_TELEMETRY_LIMIT: usize = 100;

/// Upper bound on the number of telemetry rows returned by a query
pub const MAX_TELEMETRY_LIMIT: usize = 1000;

/// Persistence errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Device not found: {id}")]
    NotFound { id: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Telemetry selection, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryQuery {
    pub device_id: String,
    /// Restrict to one `data_type`
    pub data_type: Option<String>,
    limit: usize,
}

impl TelemetryQuery {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            data_type: None,
            limit: DEFAULT_TELEMETRY_LIMIT,
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    /// Set the row limit, clamped to `1..=MAX_TELEMETRY_LIMIT`
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_TELEMETRY_LIMIT);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Storage seam for devices and their telemetry
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Register a device; it starts `offline` with every timestamp set to now
    async fn create_device(&self, request: CreateDeviceRequest) -> Result<Device, StorageError>;

    async fn get_device(&self, id: &str) -> Result<Device, StorageError>;

    /// All devices, most recently created first
    async fn list_devices(&self) -> Result<Vec<Device>, StorageError>;

    /// Apply the non-empty fields of `request` and bump `updated_at`
    async fn update_device(
        &self,
        id: &str,
        request: UpdateDeviceRequest,
    ) -> Result<Device, StorageError>;

    /// Remove a device together with its telemetry
    ///
    /// Telemetry filed under `id` is removed even when the device itself is
    /// unknown.
    async fn delete_device(&self, id: &str) -> Result<(), StorageError>;

    async fn set_device_status(
        &self,
        id: &str,
        status: DeviceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Refresh `last_seen` without touching the status
    async fn touch_device(&self, id: &str, last_seen: DateTime<Utc>) -> Result<(), StorageError>;

    /// Store one reading; the device must exist
    async fn save_telemetry(&self, data: DeviceData) -> Result<(), StorageError>;

    async fn query_telemetry(&self, query: &TelemetryQuery) -> Result<Vec<DeviceData>, StorageError>;

    /// Newest telemetry row of a device, if any
    async fn latest_telemetry(&self, device_id: &str) -> Result<Option<DeviceData>, StorageError>;

    /// Delete telemetry older than `before`, returning the number of rows removed
    async fn delete_telemetry_before(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, StorageError>;
}
