//! Pure connection state management for the MQTT client
//!
//! Connection state, the injectable [`ConnectionHandle`], transport errors,
//! option construction from configuration and the retry policy.

use crate::config::MqttSection;
use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::mqttbytes::v5::ConnectProperties;
use rumqttc::v5::{MqttOptions, mqttbytes::QoS};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

/// Largest packet accepted from or sent to the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// First delay of the post-connection reconnect backoff
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection state for the MQTT client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a client's connection state
///
/// Cheap to clone; hand one to every component that reports connectivity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn new(state_rx: watch::Receiver<ConnectionState>) -> Self {
        Self { state_rx }
    }

    /// A handle frozen at `state`, for components running without a client
    pub fn fixed(state: ConnectionState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { state_rx: rx }
    }

    /// Current state snapshot, never blocks
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the state satisfies `predicate` or `limit` elapses
    pub async fn wait_for<F>(&self, limit: Duration, predicate: F) -> Option<ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.state_rx.clone();
        let waited = tokio::time::timeout(limit, async {
            loop {
                let current = *rx.borrow_and_update();
                if predicate(current) {
                    return Some(current);
                }
                if rx.changed().await.is_err() {
                    let last = *rx.borrow();
                    return predicate(last).then_some(last);
                }
            }
        })
        .await;
        waited.ok().flatten()
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to '{pattern}' rejected by broker: {reason}")]
    SubscriptionRejected { pattern: String, reason: String },
    #[error("No {operation} acknowledgement within {timeout:?}")]
    AckTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("Client shut down before the operation completed")]
    Shutdown,
    #[error("Serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
}

/// Map a configured QoS number onto the wire enum, clamping values above 2
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Client identifier presented to the broker
///
/// With `unique_client_id` a suffix keeps concurrent processes from
/// colliding on the same identity.
pub fn effective_client_id(config: &MqttSection, suffix: u128) -> String {
    if config.unique_client_id {
        format!("{}-{suffix}", config.client_id)
    } else {
        config.client_id.clone()
    }
}

/// Whether the URL scheme asks for TLS; `None` for unsupported schemes
fn scheme_uses_tls(scheme: &str) -> Option<bool> {
    match scheme {
        "mqtt" | "tcp" => Some(false),
        "mqtts" | "ssl" => Some(true),
        _ => None,
    }
}

/// Build rumqttc options from configuration
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let invalid = || MqttError::InvalidBrokerUrl(config.broker_url.clone());

    let url = Url::parse(&config.broker_url).map_err(|_| invalid())?;
    let tls = scheme_uses_tls(url.scheme()).ok_or_else(invalid)?;
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut mqtt_options = MqttOptions::new(effective_client_id(config, suffix), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(config.keep_alive());

    // Durable sessions keep subscriptions on the broker across reconnects
    mqtt_options.set_clean_start(config.clean_session);
    if !config.clean_session {
        let mut properties = ConnectProperties::new();
        properties.session_expiry_interval = Some(config.session_expiry_secs);
        mqtt_options.set_connect_properties(properties);
    }
    // Updates the connect properties in place, so it must come after them
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}

/// What the event loop should do after a failed poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then poll again
    Retry(Duration),
    /// Stop the event loop and settle in `Disconnected`
    GiveUp,
}

/// Retry policy for initial connection and post-connection link loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub connect_retry: bool,
    pub connect_retry_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&MqttSection::default())
    }
}

impl From<&MqttSection> for ReconnectConfig {
    fn from(config: &MqttSection) -> Self {
        let max_delay = config.max_reconnect_interval().max(INITIAL_RECONNECT_DELAY);
        Self {
            auto_reconnect: config.auto_reconnect,
            initial_delay: INITIAL_RECONNECT_DELAY,
            max_delay,
            connect_retry: config.connect_retry,
            connect_retry_interval: config.connect_retry_interval(),
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff: the delay doubles per attempt up to `max_delay`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Decide how to continue after the `attempt`-th consecutive failure
    ///
    /// Before the first successful connection only `connect_retry` applies,
    /// at a fixed interval. Afterwards only `auto_reconnect` applies, with
    /// exponential backoff.
    pub fn decide(&self, ever_connected: bool, attempt: u32) -> RetryDecision {
        match (ever_connected, self.connect_retry, self.auto_reconnect) {
            (false, true, _) => RetryDecision::Retry(self.connect_retry_interval),
            (false, false, _) => RetryDecision::GiveUp,
            (true, _, true) => RetryDecision::Retry(self.calculate_backoff_delay(attempt)),
            (true, _, false) => RetryDecision::GiveUp,
        }
    }
}
