//! Observability: structured logging and process-wide metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use crate::{http_span, ingest_span, mqtt_span};
