//! In-memory device repository

use super::{DeviceRepository, StorageError, TelemetryQuery};
use crate::models::{CreateDeviceRequest, Device, DeviceData, DeviceStatus, UpdateDeviceRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    devices: HashMap<String, Device>,
    /// Telemetry per device in insertion order
    telemetry: HashMap<String, Vec<DeviceData>>,
}

/// Repository backed by process memory; contents are lost on restart
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &str) -> StorageError {
    StorageError::NotFound { id: id.to_string() }
}

/// Treat empty strings like absent fields
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[async_trait]
impl DeviceRepository for InMemoryRepository {
    async fn create_device(&self, request: CreateDeviceRequest) -> Result<Device, StorageError> {
        if request.name.trim().is_empty() {
            return Err(StorageError::InvalidInput("name is required".to_string()));
        }
        if request.device_type.trim().is_empty() {
            return Err(StorageError::InvalidInput("type is required".to_string()));
        }

        let now = Utc::now();
        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            device_type: request.device_type,
            location: request.location,
            status: DeviceStatus::Offline,
            metadata: non_empty(request.metadata),
            created_at: now,
            updated_at: now,
            last_seen: now,
        };

        self.tables
            .write()
            .await
            .devices
            .insert(device.id.clone(), device.clone());
        Ok(device)
    }

    async fn get_device(&self, id: &str) -> Result<Device, StorageError> {
        self.tables
            .read()
            .await
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StorageError> {
        let mut devices: Vec<Device> = self.tables.read().await.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(devices)
    }

    async fn update_device(
        &self,
        id: &str,
        request: UpdateDeviceRequest,
    ) -> Result<Device, StorageError> {
        let mut tables = self.tables.write().await;
        let device = tables.devices.get_mut(id).ok_or_else(|| not_found(id))?;

        if let Some(name) = non_empty(request.name) {
            device.name = name;
        }
        if let Some(device_type) = non_empty(request.device_type) {
            device.device_type = device_type;
        }
        if let Some(location) = non_empty(request.location) {
            device.location = location;
        }
        if let Some(status) = request.status {
            device.status = status;
        }
        if let Some(metadata) = non_empty(request.metadata) {
            device.metadata = Some(metadata);
        }
        device.updated_at = Utc::now();

        Ok(device.clone())
    }

    async fn delete_device(&self, id: &str) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables.telemetry.remove(id);
        tables.devices.remove(id).ok_or_else(|| not_found(id))?;
        Ok(())
    }

    async fn set_device_status(
        &self,
        id: &str,
        status: DeviceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let device = tables.devices.get_mut(id).ok_or_else(|| not_found(id))?;
        device.status = status;
        device.last_seen = last_seen;
        device.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_device(&self, id: &str, last_seen: DateTime<Utc>) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let device = tables.devices.get_mut(id).ok_or_else(|| not_found(id))?;
        device.last_seen = last_seen;
        Ok(())
    }

    async fn save_telemetry(&self, data: DeviceData) -> Result<(), StorageError> {
        if data.device_id.is_empty() {
            return Err(StorageError::InvalidInput(
                "telemetry requires a device_id".to_string(),
            ));
        }
        let mut tables = self.tables.write().await;
        if !tables.devices.contains_key(&data.device_id) {
            return Err(not_found(&data.device_id));
        }
        tables
            .telemetry
            .entry(data.device_id.clone())
            .or_default()
            .push(data);
        Ok(())
    }

    async fn query_telemetry(
        &self,
        query: &TelemetryQuery,
    ) -> Result<Vec<DeviceData>, StorageError> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.telemetry.get(&query.device_id) else {
            return Ok(Vec::new());
        };

        let mut selected: Vec<DeviceData> = rows
            .iter()
            .filter(|row| {
                query
                    .data_type
                    .as_deref()
                    .map_or(true, |data_type| row.data_type == data_type)
            })
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps
        selected.reverse();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        selected.truncate(query.limit());
        Ok(selected)
    }

    async fn latest_telemetry(&self, device_id: &str) -> Result<Option<DeviceData>, StorageError> {
        let tables = self.tables.read().await;
        // max_by_key yields the last maximum, so the newest insert wins ties
        Ok(tables
            .telemetry
            .get(device_id)
            .and_then(|rows| rows.iter().max_by_key(|row| row.timestamp).cloned()))
    }

    async fn delete_telemetry_before(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.telemetry.get_mut(device_id) else {
            return Ok(0);
        };
        let initial = rows.len();
        rows.retain(|row| row.timestamp >= before);
        Ok(initial - rows.len())
    }
}
