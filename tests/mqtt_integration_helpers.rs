//! MQTT Integration Test Helpers
//!
//! Broker-backed tests expect a broker at localhost:1883 and skip themselves
//! when none answers.

use iot_platform::config::{DispatchSection, MqttSection};
use iot_platform::transport::mqtt::MqttClient;
use std::net::TcpStream;
use std::time::Duration;
use uuid::Uuid;

/// MQTT broker URL used by broker-backed tests
pub const MQTT_BROKER_URL: &str = "mqtt://localhost:1883";
pub const MQTT_BROKER_ADDR: &str = "127.0.0.1:1883";

/// True when something accepts TCP connections on the broker port
pub fn broker_available() -> bool {
    MQTT_BROKER_ADDR
        .parse()
        .ok()
        .and_then(|addr| TcpStream::connect_timeout(&addr, Duration::from_millis(300)).ok())
        .is_some()
}

/// Skip the calling test when no broker is running
#[allow(unused_macros)]
macro_rules! require_broker {
    () => {
        if !mqtt_integration_helpers::broker_available() {
            eprintln!("Skipping: no MQTT broker at {}", mqtt_integration_helpers::MQTT_BROKER_ADDR);
            return;
        }
    };
}

/// Config pointing at the local broker with a unique client id
pub fn mqtt_config(prefix: &str) -> MqttSection {
    MqttSection {
        broker_url: MQTT_BROKER_URL.to_string(),
        client_id: format!("{prefix}-{}", Uuid::new_v4()),
        unique_client_id: false,
        clean_session: true,
        connect_timeout_secs: 5,
        publish_timeout_secs: 5,
        ..MqttSection::default()
    }
}

/// Config pointing at a port nothing listens on
#[allow(dead_code)]
pub fn unreachable_config(prefix: &str) -> MqttSection {
    MqttSection {
        broker_url: "mqtt://127.0.0.1:9".to_string(),
        connect_timeout_secs: 2,
        subscribe_wait_attempts: 3,
        subscribe_wait_interval_ms: 20,
        disconnect_drain_ms: 50,
        ..mqtt_config(prefix)
    }
}

/// Client with its own registry and dispatcher
pub fn client(config: MqttSection) -> MqttClient {
    MqttClient::with_dispatch(config, &DispatchSection::default())
        .expect("test config should be valid")
}

/// Unique topic root so concurrent test runs never see each other's traffic
#[allow(dead_code)]
pub fn unique_root() -> String {
    format!("iot-test/{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_config_uses_localhost() {
        let config = mqtt_config("helper");
        assert_eq!(config.broker_url, "mqtt://localhost:1883");
        assert!(config.client_id.starts_with("helper-"));
        assert_ne!(mqtt_config("helper").client_id, config.client_id);
    }
}
