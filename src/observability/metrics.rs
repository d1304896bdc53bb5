//! Thread-safe metrics collection
//!
//! Atomic counters for the MQTT connection, inbound dispatch and ingestion,
//! plus a bounded window of handler execution times.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of handler timings kept for percentile calculation
const TIMING_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex-protected window
#[derive(Debug)]
pub struct MetricsCollector {
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    disconnects: AtomicU64,
    reconnects: AtomicU64,
    connection_start_time: AtomicU64,

    messages_received: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_unhandled: AtomicU64,
    handler_panics: AtomicU64,

    messages_ingested: AtomicU64,
    messages_dropped: AtomicU64,

    publishes_ok: AtomicU64,
    publishes_failed: AtomicU64,

    handler_times: Mutex<Vec<u64>>, // in microseconds
    uptime_start: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            messages_unhandled: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            messages_ingested: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            publishes_ok: AtomicU64::new(0),
            publishes_failed: AtomicU64::new(0),
            handler_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.clear_connected();
    }

    /// Established link dropped without a local disconnect
    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.clear_connected();
    }

    /// Session closed by [`crate::transport::mqtt::MqttClient::disconnect`]
    pub fn mqtt_disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.clear_connected();
    }

    fn clear_connected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    // Dispatch metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dispatched(&self, duration: Duration) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.handler_times.lock() {
            times.push(duration.as_micros() as u64);
            if times.len() > TIMING_WINDOW {
                times.remove(0);
            }
        }
    }

    pub fn message_unhandled(&self) {
        self.messages_unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_panicked(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    // Ingestion metrics
    pub fn message_ingested(&self) {
        self.messages_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Publisher metrics
    pub fn publish_succeeded(&self) {
        self.publishes_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publishes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.disconnects,
            &self.reconnects,
            &self.connection_start_time,
            &self.messages_received,
            &self.messages_dispatched,
            &self.messages_unhandled,
            &self.handler_panics,
            &self.messages_ingested,
            &self.messages_dropped,
            &self.publishes_ok,
            &self.publishes_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.handler_times.lock() {
            times.clear();
        }
    }

    fn handler_time_statistics(&self) -> HandlerTimeStats {
        let Ok(times) = self.handler_times.lock() else {
            return HandlerTimeStats::default();
        };
        if times.is_empty() {
            return HandlerTimeStats::default();
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        HandlerTimeStats {
            avg_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: percentile(&sorted, 50.0),
            p95_us: percentile(&sorted, 95.0),
            p99_us: percentile(&sorted, 99.0),
        }
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected = self.mqtt_connected.load(Ordering::Relaxed);
        let start = self.connection_start_time.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            mqtt: MqttMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                disconnects: self.disconnects.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                connection_duration_seconds: if connected && start > 0 {
                    now.saturating_sub(start)
                } else {
                    0
                },
                publishes_ok: self.publishes_ok.load(Ordering::Relaxed),
                publishes_failed: self.publishes_failed.load(Ordering::Relaxed),
            },
            dispatch: DispatchMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
                messages_unhandled: self.messages_unhandled.load(Ordering::Relaxed),
                handler_panics: self.handler_panics.load(Ordering::Relaxed),
                handler_time: self.handler_time_statistics(),
            },
            ingest: IngestMetrics {
                messages_ingested: self.messages_ingested.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable metrics snapshot served at `GET /metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub mqtt: MqttMetrics,
    pub dispatch: DispatchMetrics,
    pub ingest: IngestMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub disconnects: u64,
    pub reconnects: u64,
    pub connection_duration_seconds: u64,
    pub publishes_ok: u64,
    pub publishes_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub messages_received: u64,
    pub messages_dispatched: u64,
    pub messages_unhandled: u64,
    pub handler_panics: u64,
    pub handler_time: HandlerTimeStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerTimeStats {
    pub avg_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestMetrics {
    pub messages_ingested: u64,
    pub messages_dropped: u64,
}

/// Nearest-rank percentile over an already sorted slice
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let collector = MetricsCollector::new();
        collector.mqtt_connection_attempt();
        collector.mqtt_connection_failed();
        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.mqtt.connection_attempts, 2);
        assert_eq!(snapshot.mqtt.connection_failures, 1);
        assert_eq!(snapshot.mqtt.connections_established, 1);
        assert!(snapshot.mqtt.connected);

        collector.mqtt_connection_lost();
        let snapshot = collector.snapshot();
        assert!(!snapshot.mqtt.connected);
        assert_eq!(snapshot.mqtt.connections_lost, 1);
        assert_eq!(snapshot.mqtt.connection_duration_seconds, 0);
    }

    #[test]
    fn test_graceful_disconnect_is_not_a_lost_connection() {
        let collector = MetricsCollector::new();
        collector.mqtt_connection_established();
        collector.mqtt_disconnected();

        let snapshot = collector.snapshot();
        assert!(!snapshot.mqtt.connected);
        assert_eq!(snapshot.mqtt.disconnects, 1);
        assert_eq!(snapshot.mqtt.connections_lost, 0);
        assert_eq!(snapshot.mqtt.connection_failures, 0);
    }

    #[test]
    fn test_dispatch_counters_and_timings() {
        let collector = MetricsCollector::new();
        collector.message_received();
        collector.message_received();
        collector.message_dispatched(Duration::from_micros(100));
        collector.message_dispatched(Duration::from_micros(300));
        collector.message_unhandled();
        collector.handler_panicked();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.dispatch.messages_received, 2);
        assert_eq!(snapshot.dispatch.messages_dispatched, 2);
        assert_eq!(snapshot.dispatch.messages_unhandled, 1);
        assert_eq!(snapshot.dispatch.handler_panics, 1);
        assert_eq!(snapshot.dispatch.handler_time.avg_us, 200.0);
        assert_eq!(snapshot.dispatch.handler_time.p99_us, 300.0);
    }

    #[test]
    fn test_timing_window_is_bounded() {
        let collector = MetricsCollector::new();
        for _ in 0..(TIMING_WINDOW + 50) {
            collector.message_dispatched(Duration::from_micros(1));
        }
        assert_eq!(collector.handler_times.lock().unwrap().len(), TIMING_WINDOW);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.publish_succeeded();
        collector.publish_failed();
        collector.message_dropped();
        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.mqtt.publishes_ok, 0);
        assert_eq!(snapshot.mqtt.publishes_failed, 0);
        assert_eq!(snapshot.ingest.messages_dropped, 0);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[5], 99.0), 5.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 50.0), 3.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 100.0), 5.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let value = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(value["mqtt"]["connected"].is_boolean());
        assert!(value["dispatch"]["handler_time"]["p95_us"].is_number());
    }
}
