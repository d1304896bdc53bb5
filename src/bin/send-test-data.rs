//! Simulated device publisher
//!
//! Publishes randomised telemetry for one or more devices, plus a status
//! message every third batch, so the ingestion path can be exercised without
//! real hardware.
//!
//! ## Usage
//!
//! ```bash
//! # One device, default interval
//! send-test-data --device 0a0e35e6-eeba-49ea-a02f-444a722fabe1
//!
//! # Two devices, every second, stop after 10 batches
//! send-test-data --device sensor-a --device sensor-b --interval 1 --count 10
//! ```

use chrono::Utc;
use clap::Parser;
use iot_platform::config::{DEFAULT_CONFIG_PATHS, PlatformConfig};
use iot_platform::models::{StatusMessage, TelemetryMessage};
use iot_platform::observability::init_default_logging;
use iot_platform::transport::mqtt::{MqttClient, TopicBuilder};
use rand::Rng;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Batches between two status messages
const STATUS_EVERY: u64 = 3;

const STATUSES: [&str; 4] = ["online", "offline", "error", "maintenance"];

#[derive(Parser)]
#[command(
    name = "send-test-data",
    about = "Publish simulated device telemetry to the IoT platform broker"
)]
struct Args {
    /// Device id to simulate; repeat for several devices
    #[arg(long = "device", required = true)]
    devices: Vec<String>,

    /// Seconds between batches
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Stop after this many batches (runs until interrupted when absent)
    #[arg(long)]
    count: Option<u64>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the broker URL from configuration
    #[arg(long, env = "MQTT_BROKER")]
    broker_url: Option<String>,
}

fn load_config(args: &Args) -> Result<PlatformConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => PlatformConfig::load_from_file(path)?,
        None => match DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
        {
            Some(path) => PlatformConfig::load_from_file(&path)?,
            None => PlatformConfig::from_env()?,
        },
    };

    if let Some(broker_url) = &args.broker_url {
        config.mqtt.broker_url = broker_url.clone();
    }
    // Never share a session with the server
    config.mqtt.client_id = "test-sender".to_string();
    config.mqtt.unique_client_id = true;
    config.mqtt.clean_session = true;
    Ok(config)
}

fn random_telemetry(device_id: &str, sequence: u64) -> TelemetryMessage {
    let mut rng = rand::thread_rng();
    let mut data = Map::new();
    data.insert("temperature".into(), json!(rng.gen_range(20.0..30.0)));
    data.insert("humidity".into(), json!(rng.gen_range(40.0..70.0)));
    data.insert("pressure".into(), json!(rng.gen_range(1000.0..1050.0)));
    data.insert("voltage".into(), json!(rng.gen_range(3.0..3.5)));

    let mut metadata = Map::new();
    metadata.insert("sequence".into(), json!(sequence));
    metadata.insert("quality".into(), json!("good"));
    metadata.insert(
        "units".into(),
        json!({"temperature": "C", "humidity": "%", "pressure": "hPa", "voltage": "V"}),
    );

    TelemetryMessage {
        device_id: device_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        data,
        metadata: Some(metadata),
    }
}

fn random_status(device_id: &str) -> StatusMessage {
    let mut rng = rand::thread_rng();
    let status = STATUSES[rng.gen_range(0..STATUSES.len())];

    let mut metadata = Map::new();
    metadata.insert("battery".into(), Value::from(rng.gen_range(80..100)));
    metadata.insert("signal".into(), Value::from(rng.gen_range(70..100)));

    StatusMessage {
        device_id: device_id.to_string(),
        status: status.to_string(),
        last_seen: Some(Utc::now().to_rfc3339()),
        metadata: Some(metadata),
    }
}

async fn send_batch(client: &MqttClient, devices: &[String], batch: u64) {
    for device_id in devices {
        let topic = TopicBuilder::data_topic(device_id);
        match client
            .publish_json(&topic, &random_telemetry(device_id, batch))
            .await
        {
            Ok(()) => info!(topic = %topic, batch, "Sent device data"),
            Err(e) => warn!(topic = %topic, error = %e, "Failed to publish device data"),
        }

        if batch % STATUS_EVERY == 0 {
            let status = random_status(device_id);
            let topic = TopicBuilder::status_topic(device_id);
            match client.publish_json(&topic, &status).await {
                Ok(()) => info!(topic = %topic, status = %status.status, "Sent device status"),
                Err(e) => warn!(topic = %topic, error = %e, "Failed to publish device status"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_default_logging();

    let config = load_config(&args)?;
    let client = MqttClient::with_dispatch(config.mqtt.clone(), &config.dispatch)?;

    info!(broker = %config.mqtt.broker_url, "Connecting to MQTT broker");
    if let Err(e) = client.connect().await {
        error!(error = %e, "Failed to connect to MQTT broker");
        return Err(e.into());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let mut batch = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down test sender");
                break;
            }
            _ = ticker.tick() => {
                batch += 1;
                send_batch(&client, &args.devices, batch).await;
                if args.count.is_some_and(|count| batch >= count) {
                    info!(batches = batch, "Requested batch count sent");
                    break;
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
