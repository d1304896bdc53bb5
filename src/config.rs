//! Configuration system for the IoT platform
//!
//! Configuration is read from a TOML file (every field has a default, so an
//! empty file is valid) and then overridden by environment variables using the
//! platform's historical variable names (`MQTT_BROKER`, `SERVER_PORT`, ...).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default config file locations, tried in order when no path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["iot-platform.toml", "config/iot-platform.toml"];

/// Top-level platform configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlatformConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// HTTP server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

/// MQTT section: broker address, session semantics and retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL (`mqtt://`, `tcp://`, `mqtts://` or `ssl://`)
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Base client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Append a timestamp suffix so concurrent processes never share an identity
    #[serde(default = "default_true")]
    pub unique_client_id: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Quality of service for publish and subscribe (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// `false` requests a durable session whose subscriptions survive reconnects
    #[serde(default)]
    pub clean_session: bool,
    /// Session expiry requested for durable sessions
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Ceiling for the reconnect backoff after link loss
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval_secs: u64,
    /// Retry the initial connection forever instead of failing fast
    #[serde(default)]
    pub connect_retry: bool,
    #[serde(default = "default_connect_retry_interval")]
    pub connect_retry_interval_secs: u64,
    /// Drain window granted to in-flight acknowledgements on disconnect
    #[serde(default = "default_disconnect_drain")]
    pub disconnect_drain_ms: u64,
    /// Upper bound on waiting for PubAck/SubAck/UnsubAck
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_subscribe_wait_attempts")]
    pub subscribe_wait_attempts: u32,
    #[serde(default = "default_subscribe_wait_interval")]
    pub subscribe_wait_interval_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            unique_client_id: true,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            qos: default_qos(),
            clean_session: false,
            session_expiry_secs: default_session_expiry(),
            auto_reconnect: true,
            max_reconnect_interval_secs: default_max_reconnect_interval(),
            connect_retry: false,
            connect_retry_interval_secs: default_connect_retry_interval(),
            disconnect_drain_ms: default_disconnect_drain(),
            publish_timeout_secs: default_publish_timeout(),
            subscribe_wait_attempts: default_subscribe_wait_attempts(),
            subscribe_wait_interval_ms: default_subscribe_wait_interval(),
        }
    }
}

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_secs(self.connect_retry_interval_secs)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval_secs)
    }

    pub fn disconnect_drain(&self) -> Duration {
        Duration::from_millis(self.disconnect_drain_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn subscribe_wait_interval(&self) -> Duration {
        Duration::from_millis(self.subscribe_wait_interval_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "iot-platform-server".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_qos() -> u8 {
    1
}

fn default_session_expiry() -> u32 {
    3600
}

fn default_max_reconnect_interval() -> u64 {
    60
}

fn default_connect_retry_interval() -> u64 {
    5
}

fn default_disconnect_drain() -> u64 {
    250
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_subscribe_wait_attempts() -> u32 {
    10
}

fn default_subscribe_wait_interval() -> u64 {
    100
}

/// Inbound message dispatch section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    /// Number of dispatch workers; a topic always lands on the same worker
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue length per worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

/// Telemetry retention section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    /// Telemetry older than this is purged; 0 keeps everything
    #[serde(default = "default_retention_hours")]
    pub telemetry_retention_hours: u64,
    #[serde(default = "default_retention_sweep_interval")]
    pub retention_sweep_interval_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            telemetry_retention_hours: default_retention_hours(),
            retention_sweep_interval_secs: default_retention_sweep_interval(),
        }
    }
}

impl StorageSection {
    /// `None` when retention is disabled
    pub fn telemetry_retention(&self) -> Option<Duration> {
        (self.telemetry_retention_hours > 0)
            .then(|| Duration::from_secs(self.telemetry_retention_hours.saturating_mul(3600)))
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_secs)
    }
}

fn default_retention_hours() -> u64 {
    24 * 30
}

fn default_retention_sweep_interval() -> u64 {
    3600
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PlatformConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: PlatformConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = PlatformConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup
    ///
    /// Empty values are ignored, as are numeric or boolean values that fail to
    /// parse; the previous value is kept in both cases.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get("SERVER_HOST") {
            self.server.host = host;
        }
        override_parsed(&mut self.server.port, get("SERVER_PORT"));
        override_parsed(
            &mut self.storage.telemetry_retention_hours,
            get("TELEMETRY_RETENTION_HOURS"),
        );

        let mqtt = &mut self.mqtt;
        if let Some(broker) = get("MQTT_BROKER") {
            mqtt.broker_url = broker;
        }
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            mqtt.client_id = client_id;
        }
        if let Some(username) = get("MQTT_USERNAME") {
            mqtt.username = Some(username);
        }
        if let Some(password) = get("MQTT_PASSWORD") {
            mqtt.password = Some(password);
        }
        override_parsed(&mut mqtt.keep_alive_secs, get("MQTT_KEEP_ALIVE"));
        override_parsed(&mut mqtt.connect_timeout_secs, get("MQTT_CONNECT_TIMEOUT"));
        override_parsed(&mut mqtt.qos, get("MQTT_QOS"));
        override_parsed(&mut mqtt.clean_session, get("MQTT_CLEAN_SESSION"));
        override_parsed(&mut mqtt.auto_reconnect, get("MQTT_AUTO_RECONNECT"));
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be at least 1".to_string(),
            ));
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch.workers must be at least 1".to_string(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.telemetry_retention_hours > 0
            && self.storage.retention_sweep_interval_secs == 0
        {
            return Err(ConfigError::InvalidConfig(
                "storage.retention_sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the HTTP server binds to
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[server]
host = "127.0.0.1"
port = 18080

[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "test-platform"
connect_timeout_secs = 2

[dispatch]
workers = 2
queue_capacity = 16
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Replace `target` with the parsed value when present and valid
fn override_parsed<T: std::str::FromStr>(target: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: PlatformConfig = toml::from_str("").unwrap();
        assert_eq!(config, PlatformConfig::default());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.connect_timeout_secs, 30);
        assert_eq!(config.mqtt.qos, 1);
        assert!(!config.mqtt.clean_session);
        assert!(config.mqtt.auto_reconnect);
        assert!(!config.mqtt.connect_retry);
        assert_eq!(config.mqtt.connect_retry_interval_secs, 5);
        assert_eq!(config.mqtt.disconnect_drain_ms, 250);
        assert_eq!(config.dispatch.workers, 4);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[server]
host = "127.0.0.1"
port = 9000

[mqtt]
broker_url = "tcp://broker.local:1884"
client_id = "edge-gateway"
unique_client_id = false
username = "device-user"
password = "s3cret"
keep_alive_secs = 30
qos = 2
clean_session = true
auto_reconnect = false
connect_retry = true
connect_retry_interval_secs = 2

[dispatch]
workers = 8
queue_capacity = 1024
"#;

        let config: PlatformConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:9000");
        assert_eq!(config.mqtt.client_id, "edge-gateway");
        assert!(!config.mqtt.unique_client_id);
        assert_eq!(config.mqtt.username.as_deref(), Some("device-user"));
        assert_eq!(config.mqtt.password.as_deref(), Some("s3cret"));
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.mqtt.qos, 2);
        assert!(config.mqtt.clean_session);
        assert!(!config.mqtt.auto_reconnect);
        assert!(config.mqtt.connect_retry);
        assert_eq!(config.mqtt.connect_retry_interval(), Duration::from_secs(2));
        assert_eq!(config.dispatch.workers, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PlatformConfig::default();
        config.apply_overrides_from(lookup(&[
            ("SERVER_PORT", "9090"),
            ("MQTT_BROKER", "tcp://10.0.0.5:1883"),
            ("MQTT_CLIENT_ID", "override-id"),
            ("MQTT_USERNAME", "user"),
            ("MQTT_PASSWORD", "pass"),
            ("MQTT_KEEP_ALIVE", "15"),
            ("MQTT_QOS", "0"),
            ("MQTT_CLEAN_SESSION", "true"),
            ("MQTT_AUTO_RECONNECT", "false"),
        ]));

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.mqtt.broker_url, "tcp://10.0.0.5:1883");
        assert_eq!(config.mqtt.client_id, "override-id");
        assert_eq!(config.mqtt.username.as_deref(), Some("user"));
        assert_eq!(config.mqtt.password.as_deref(), Some("pass"));
        assert_eq!(config.mqtt.keep_alive_secs, 15);
        assert_eq!(config.mqtt.qos, 0);
        assert!(config.mqtt.clean_session);
        assert!(!config.mqtt.auto_reconnect);
    }

    #[test]
    fn test_invalid_env_values_keep_previous() {
        let mut config = PlatformConfig::default();
        config.apply_overrides_from(lookup(&[
            ("SERVER_PORT", "not-a-port"),
            ("MQTT_KEEP_ALIVE", "-3"),
            ("MQTT_QOS", "300"),
            ("MQTT_AUTO_RECONNECT", "maybe"),
            ("MQTT_CLIENT_ID", ""),
        ]));

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.qos, 1);
        assert!(config.mqtt.auto_reconnect);
        assert_eq!(config.mqtt.client_id, "iot-platform-server");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PlatformConfig::default();
        config.mqtt.qos = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let mut config = PlatformConfig::default();
        config.dispatch.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PlatformConfig::default();
        config.mqtt.client_id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_retention() {
        let config = PlatformConfig::default();
        assert_eq!(
            config.storage.telemetry_retention(),
            Some(Duration::from_secs(30 * 24 * 3600))
        );

        let config: PlatformConfig =
            toml::from_str("[storage]\ntelemetry_retention_hours = 0\nretention_sweep_interval_secs = 0")
                .unwrap();
        assert_eq!(config.storage.telemetry_retention(), None);
        assert!(config.validate().is_ok());

        let mut config = PlatformConfig::default();
        config.apply_overrides_from(lookup(&[("TELEMETRY_RETENTION_HOURS", "12")]));
        assert_eq!(
            config.storage.telemetry_retention(),
            Some(Duration::from_secs(12 * 3600))
        );
        config.storage.retention_sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_is_not_serialized() {
        let mut config = PlatformConfig::test_config();
        config.mqtt.password = Some("hunter2".to_string());
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iot-platform.toml");
        std::fs::write(&path, "[dispatch]\nworkers = 3\n").unwrap();

        let config = PlatformConfig::load_from_file(&path).unwrap();
        assert_eq!(config.dispatch.workers, 3);

        std::fs::write(&path, "[dispatch]\nworkers = 0\n").unwrap();
        assert!(PlatformConfig::load_from_file(&path).is_err());

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            PlatformConfig::load_from_file(&missing),
            Err(ConfigError::FileRead(_))
        ));
    }
}
