//! Transport layer for device communication
//!
//! This module provides the transport abstraction and its MQTT implementation.

use crate::transport::mqtt::{ConnectionState, MessageHandler};
use std::sync::Arc;

pub mod mqtt;

/// Transport trait for device messaging
///
/// This trait provides an abstraction over the broker connection so
/// ingestion wiring and tools can be tested without a broker.
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Disconnect from the broker; safe to call in any state
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Route messages matching `pattern` to `handler`
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Self::Error>;

    /// Stop routing messages for `pattern`
    async fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error>;

    /// Publish a payload to a concrete topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), Self::Error>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
