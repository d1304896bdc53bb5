//! Device registry data model
//!
//! Records owned by the persistence layer plus the JSON payloads that devices
//! publish over MQTT.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Operational status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Error,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "error" => Ok(DeviceStatus::Error),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status '{other}'")),
        }
    }
}

/// A registered IoT device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub location: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One telemetry measurement reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Body of `POST /api/devices`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Body of `PUT /api/devices/{id}`; absent or empty fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDeviceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Status summary returned by `GET /api/devices/{id}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusView {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
}

impl From<&Device> for DeviceStatusView {
    fn from(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            status: device.status,
            last_seen: device.last_seen,
        }
    }
}

/// Telemetry payload published on `devices/{id}/data`
///
/// Required fields default to empty so that validation, not deserialization,
/// decides what is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Status payload published on `devices/{id}/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_status_parse_is_case_insensitive() {
        assert_eq!("online".parse::<DeviceStatus>(), Ok(DeviceStatus::Online));
        assert_eq!("OFFLINE".parse::<DeviceStatus>(), Ok(DeviceStatus::Offline));
        assert_eq!(" Error ".parse::<DeviceStatus>(), Ok(DeviceStatus::Error));
        assert_eq!(
            "maintenance".parse::<DeviceStatus>(),
            Ok(DeviceStatus::Maintenance)
        );
        assert!("rebooting".parse::<DeviceStatus>().is_err());
    }

    #[test]
    fn test_device_serializes_type_field() {
        let now = Utc::now();
        let device = Device {
            id: "dev-1".to_string(),
            name: "Sensor".to_string(),
            device_type: "temperature".to_string(),
            location: "lab".to_string(),
            status: DeviceStatus::Online,
            metadata: None,
            created_at: now,
            updated_at: now,
            last_seen: now,
        };

        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["type"], "temperature");
        assert_eq!(value["status"], "online");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_telemetry_message_tolerates_missing_fields() {
        let message: TelemetryMessage = serde_json::from_value(json!({
            "data": {"temperature": 21.5}
        }))
        .unwrap();

        assert!(message.device_id.is_empty());
        assert!(message.timestamp.is_empty());
        assert_eq!(message.data["temperature"], json!(21.5));
        assert!(message.metadata.is_none());
    }

    #[test]
    fn test_update_request_partial_body() {
        let request: UpdateDeviceRequest =
            serde_json::from_value(json!({"status": "maintenance"})).unwrap();
        assert_eq!(request.status, Some(DeviceStatus::Maintenance));
        assert!(request.name.is_none());
    }
}
