//! IoT Platform - device registry backend
//!
//! Devices publish telemetry and status messages to an MQTT broker; this crate
//! subscribes to them, validates and stores what arrives, and serves the
//! registry over HTTP.
//!
//! # Overview
//!
//! - MQTT topic matching with `+` and `#` wildcards
//! - Handler registry with deterministic resolution (exact pattern first,
//!   then the earliest registered wildcard)
//! - Sharded dispatch that preserves per-topic order and isolates handler panics
//! - Connection management with durable sessions, reconnect backoff and
//!   acknowledged publish/subscribe
//! - Device repository and a warp HTTP API
//!
//! # Quick Start
//!
//! ```rust
//! use iot_platform::transport::mqtt::{HandlerRegistry, handler_fn, topic};
//!
//! assert!(topic::matches("devices/+/data", "devices/sensor-1/data"));
//! assert!(topic::matches("devices/#", "devices/sensor-1/config/wifi"));
//! assert!(!topic::matches("devices/+/data", "devices/sensor-1/status"));
//!
//! let registry = HandlerRegistry::new();
//! registry.register("devices/#", handler_fn(|_| {}));
//! registry.register("devices/+/data", handler_fn(|_| {}));
//!
//! // Registration order decides between overlapping wildcards
//! let resolved = registry.resolve("devices/sensor-1/data").unwrap();
//! assert_eq!(resolved.pattern, "devices/#");
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod storage;
pub mod testing;
pub mod transport;

pub use config::{DispatchSection, MqttSection, PlatformConfig, ServerSection};
pub use error::{PlatformError, PlatformResult};
pub use models::{Device, DeviceData, DeviceStatus};
pub use storage::{DeviceRepository, InMemoryRepository};
pub use transport::MessageTransport;
pub use transport::mqtt::{ConnectionHandle, ConnectionState, MqttClient, MqttError};
