//! MQTT subscription dispatch for device traffic
//!
//! This module separates pure functions (topic matching, event routing, retry
//! decisions) from the I/O that drives the broker session.
//!
//! # Architecture
//!
//! - [`topic`] - Wildcard matching and device topic helpers
//! - [`registry`] - Pattern to handler map with deterministic resolution
//! - [`dispatcher`] - Sharded worker pool delivering messages to handlers
//! - [`connection`] - Connection state, broker options and retry policy
//! - [`events`] - Routing of rumqttc events and acknowledgement tracking
//! - [`client`] - Impure I/O: connect, subscribe, publish, event loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use iot_platform::config::{DispatchSection, MqttSection};
//! use iot_platform::transport::mqtt::{MqttClient, handler_fn};
//!
//! # tokio_test::block_on(async {
//! let client = MqttClient::with_dispatch(MqttSection::default(), &DispatchSection::default())?;
//! client.connect().await?;
//! client
//!     .subscribe(
//!         "devices/+/data",
//!         handler_fn(|msg| println!("{}: {}", msg.topic, msg.payload_lossy())),
//!     )
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod registry;
pub mod topic;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{
    ConnectionHandle, ConnectionState, MqttError, ReconnectConfig, RetryDecision,
};
pub use dispatcher::{
    Dispatcher, InboundMessage, LoggingHandler, MessageHandler, handler_fn,
};
pub use events::{AckKind, AckTracker, EventRoute, route_mqtt_event};
pub use registry::{HandlerRegistry, ResolvedHandler};
pub use topic::TopicBuilder;
