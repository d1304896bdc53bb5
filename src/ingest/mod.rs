//! Device message ingestion
//!
//! Handlers for the device topics. Each one parses and validates a payload,
//! then hands the result to the [`DeviceRepository`]. A message that fails at
//! any step is dropped with a single warning carrying the topic, the raw
//! payload and the reason; nothing is retried. Messages from devices that
//! are not registered are dropped the same way.

use crate::models::{DeviceData, DeviceStatus, StatusMessage, TelemetryMessage};
use crate::observability::metrics;
use crate::storage::{DeviceRepository, StorageError};
use crate::transport::MessageTransport;
use crate::transport::mqtt::topic::{
    DEVICE_CATCH_ALL_PATTERN, DEVICE_DATA_PATTERN, DEVICE_STATUS_PATTERN, TopicBuilder,
};
use crate::transport::mqtt::{InboundMessage, MessageHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Reasons a device message is dropped
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("invalid status '{0}'")]
    InvalidStatus(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// A validated telemetry message
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTelemetry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
    pub metadata: Option<Map<String, Value>>,
}

impl ParsedTelemetry {
    /// One record per numeric entry of `data`; other entries are skipped
    pub fn records(&self) -> Vec<DeviceData> {
        let metadata = self
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_string(m).ok());
        let units = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("units"))
            .and_then(Value::as_object);

        self.data
            .iter()
            .filter_map(|(key, value)| {
                let Some(number) = value.as_f64() else {
                    debug!(device_id = %self.device_id, key = %key, "Skipping non-numeric data point");
                    return None;
                };
                Some(DeviceData {
                    id: Uuid::new_v4().to_string(),
                    device_id: self.device_id.clone(),
                    timestamp: self.timestamp,
                    data_type: key.clone(),
                    value: number,
                    unit: units
                        .and_then(|u| u.get(key))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    metadata: metadata.clone(),
                })
            })
            .collect()
    }
}

/// A validated status message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatus {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, IngestError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IngestError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Parse and validate a telemetry payload
///
/// `device_id` and an RFC 3339 `timestamp` are required.
pub fn parse_telemetry(payload: &[u8]) -> Result<ParsedTelemetry, IngestError> {
    let message: TelemetryMessage = serde_json::from_slice(payload)?;
    if message.device_id.is_empty() {
        return Err(IngestError::MissingField("device_id"));
    }
    if message.timestamp.is_empty() {
        return Err(IngestError::MissingField("timestamp"));
    }
    let timestamp = parse_rfc3339(&message.timestamp)?;

    Ok(ParsedTelemetry {
        device_id: message.device_id,
        timestamp,
        data: message.data,
        metadata: message.metadata,
    })
}

/// Parse and validate a status payload
///
/// An absent or unparseable `last_seen` falls back to `received_at`.
pub fn parse_status(payload: &[u8], received_at: DateTime<Utc>) -> Result<ParsedStatus, IngestError> {
    let message: StatusMessage = serde_json::from_slice(payload)?;
    if message.device_id.is_empty() {
        return Err(IngestError::MissingField("device_id"));
    }
    if message.status.is_empty() {
        return Err(IngestError::MissingField("status"));
    }
    let status = message
        .status
        .parse::<DeviceStatus>()
        .map_err(|_| IngestError::InvalidStatus(message.status.clone()))?;

    let last_seen = match message.last_seen.as_deref().filter(|v| !v.is_empty()) {
        Some(raw) => parse_rfc3339(raw).unwrap_or_else(|e| {
            debug!(device_id = %message.device_id, error = %e, "Using receipt time for last_seen");
            received_at
        }),
        None => received_at,
    };

    Ok(ParsedStatus {
        device_id: message.device_id,
        status,
        last_seen,
    })
}

/// Log and count a dropped message
fn drop_message(message: &InboundMessage, error: &IngestError) {
    metrics().message_dropped();
    warn!(
        topic = %message.topic,
        payload = %message.payload_lossy(),
        reason = %error,
        "Dropping device message"
    );
}

/// Warn when a payload names a different device than its topic
fn check_topic_device(message: &InboundMessage, payload_device_id: &str) {
    if let Some(topic_device_id) = TopicBuilder::device_id_from_topic(&message.topic) {
        if topic_device_id != payload_device_id {
            warn!(
                topic = %message.topic,
                payload_device_id = %payload_device_id,
                "Payload device_id differs from topic, using payload value"
            );
        }
    }
}

/// Stores telemetry published on `devices/+/data`
pub struct TelemetryHandler {
    repository: Arc<dyn DeviceRepository>,
}

impl TelemetryHandler {
    pub fn new(repository: Arc<dyn DeviceRepository>) -> Self {
        Self { repository }
    }

    async fn ingest(&self, message: &InboundMessage) -> Result<usize, IngestError> {
        let telemetry = parse_telemetry(&message.payload)?;
        check_topic_device(message, &telemetry.device_id);

        // Unregistered devices fail here, before any row is written
        self.repository
            .touch_device(&telemetry.device_id, telemetry.timestamp)
            .await?;

        let records = telemetry.records();
        let stored = records.len();
        for record in records {
            self.repository.save_telemetry(record).await?;
        }

        info!(
            device_id = %telemetry.device_id,
            timestamp = %telemetry.timestamp.to_rfc3339(),
            data_points = stored,
            retain = message.retain,
            "Processed device data"
        );
        Ok(stored)
    }
}

#[async_trait]
impl MessageHandler for TelemetryHandler {
    async fn handle(&self, message: &InboundMessage) {
        let span = crate::ingest_span!(kind = "telemetry", topic = %message.topic);
        match self.ingest(message).instrument(span).await {
            Ok(_) => metrics().message_ingested(),
            Err(e) => drop_message(message, &e),
        }
    }
}

/// Applies status updates published on `devices/+/status`
pub struct StatusHandler {
    repository: Arc<dyn DeviceRepository>,
}

impl StatusHandler {
    pub fn new(repository: Arc<dyn DeviceRepository>) -> Self {
        Self { repository }
    }

    async fn ingest(&self, message: &InboundMessage) -> Result<ParsedStatus, IngestError> {
        let status = parse_status(&message.payload, Utc::now())?;
        check_topic_device(message, &status.device_id);

        self.repository
            .set_device_status(&status.device_id, status.status, status.last_seen)
            .await?;

        info!(
            device_id = %status.device_id,
            status = %status.status,
            last_seen = %status.last_seen.to_rfc3339(),
            retain = message.retain,
            "Processed device status"
        );
        Ok(status)
    }
}

#[async_trait]
impl MessageHandler for StatusHandler {
    async fn handle(&self, message: &InboundMessage) {
        let span = crate::ingest_span!(kind = "status", topic = %message.topic);
        match self.ingest(message).instrument(span).await {
            Ok(_) => metrics().message_ingested(),
            Err(e) => drop_message(message, &e),
        }
    }
}

/// Logs device traffic outside the data and status topics
#[derive(Debug, Default)]
pub struct CatchAllHandler;

#[async_trait]
impl MessageHandler for CatchAllHandler {
    async fn handle(&self, message: &InboundMessage) {
        if message.topic.ends_with("/data") || message.topic.ends_with("/status") {
            return;
        }
        info!(
            topic = %message.topic,
            retain = message.retain,
            payload = %message.payload_lossy(),
            "Received device message"
        );
    }
}

/// Subscribe the device handlers on `transport`: data, status, then catch-all
///
/// Registration order matters: the catch-all pattern also matches data and
/// status topics and must not shadow the specific handlers.
pub async fn register_device_handlers<T>(
    transport: &T,
    repository: Arc<dyn DeviceRepository>,
) -> Result<(), T::Error>
where
    T: MessageTransport + ?Sized,
{
    transport
        .subscribe(
            DEVICE_DATA_PATTERN,
            Arc::new(TelemetryHandler::new(Arc::clone(&repository))),
        )
        .await?;
    transport
        .subscribe(DEVICE_STATUS_PATTERN, Arc::new(StatusHandler::new(repository)))
        .await?;
    transport
        .subscribe(DEVICE_CATCH_ALL_PATTERN, Arc::new(CatchAllHandler))
        .await?;

    info!(
        patterns = ?[DEVICE_DATA_PATTERN, DEVICE_STATUS_PATTERN, DEVICE_CATCH_ALL_PATTERN],
        "Subscribed to device topics"
    );
    Ok(())
}
