//! Mock implementations for testing
//!
//! Provides a mock [`MessageTransport`] that keeps subscriptions in a real
//! [`HandlerRegistry`] and records publishes, so ingestion wiring can be
//! exercised without a broker.

use crate::transport::mqtt::{
    ConnectionState, HandlerRegistry, InboundMessage, LoggingHandler, MessageHandler, MqttError,
};
use crate::transport::MessageTransport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Topic, payload and QoS of a recorded publish
pub type PublishedMessage = (String, Vec<u8>, u8);

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    pub registry: Arc<HandlerRegistry>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    /// Patterns in the order they were subscribed
    pub subscribed_patterns: Arc<Mutex<Vec<String>>>,
    pub should_fail: bool,
    connected: AtomicBool,
}

impl MockTransport {
    /// A transport that starts connected
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn get_subscribed_patterns(&self) -> Vec<String> {
        self.subscribed_patterns.lock().await.clone()
    }

    /// Deliver a message as the broker would, awaiting the chosen handler
    pub async fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let message = InboundMessage::new(topic, payload);
        match self.registry.resolve(topic) {
            Some(resolved) => resolved.handler.handle(&message).await,
            None => LoggingHandler.handle(&message).await,
        }
    }

    fn check(&self) -> Result<(), MqttError> {
        if self.should_fail || !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected {
                state: self.connection_state(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(MqttError::ConnectionFailed("Mock connection failure".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Self::Error> {
        self.check()?;
        self.registry.register(pattern, handler);
        self.subscribed_patterns
            .lock()
            .await
            .push(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        self.check()?;
        self.registry.unregister(pattern);
        self.subscribed_patterns
            .lock()
            .await
            .retain(|p| p != pattern);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), Self::Error> {
        self.check()?;
        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload, qos));
        Ok(())
    }
}
