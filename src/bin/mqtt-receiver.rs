//! Standalone device topic listener
//!
//! Subscribes to the exact data and status topics of the given devices, with
//! no wildcards, and logs every message it receives. Messages are also
//! appended to a log file so a run can be compared against what a sender
//! published.
//!
//! ## Usage
//!
//! ```bash
//! mqtt-receiver --device device001 --device device002
//!
//! # Console only
//! mqtt-receiver --device device001 --no-log-file
//! ```

use chrono::{Local, Utc};
use clap::Parser;
use iot_platform::config::{DEFAULT_CONFIG_PATHS, PlatformConfig};
use iot_platform::observability::init_default_logging;
use iot_platform::transport::mqtt::{InboundMessage, MqttClient, TopicBuilder, handler_fn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "mqtt-receiver",
    about = "Log messages published on the topics of specific devices"
)]
struct Args {
    /// Device id to listen for; repeat for several devices
    #[arg(long = "device", required = true)]
    devices: Vec<String>,

    /// File that received messages are appended to
    #[arg(long, value_name = "FILE", default_value = "mqtt-receiver.log")]
    log_file: PathBuf,

    /// Log to the console only
    #[arg(long)]
    no_log_file: bool,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the broker URL from configuration
    #[arg(long, env = "MQTT_BROKER")]
    broker_url: Option<String>,
}

/// Append-only message log shared by every subscription
///
/// Handlers run on several dispatch workers at once; the mutex keeps each
/// entry on a line of its own.
struct MessageLog {
    file: Mutex<File>,
}

impl MessageLog {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append(&self, entry: &str) {
        let line = format!("[{}] {entry}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "Failed to write to message log");
        }
    }
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
    // A durable session under an id of its own, so messages published while
    // the receiver reconnects are still delivered
    config.mqtt.client_id = format!("mqtt-receiver-{}", Utc::now().format("%Y%m%d%H%M%S"));
    config.mqtt.unique_client_id = false;
    config.mqtt.clean_session = false;
    Ok(config)
}

fn describe(kind: &str, message: &InboundMessage) -> String {
    format!(
        "Received device {kind} from {}: {}",
        message.topic,
        message.payload_lossy()
    )
}

async fn subscribe_device(
    client: &MqttClient,
    device_id: &str,
    log: Option<&Arc<MessageLog>>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let topics = [
        (TopicBuilder::data_topic(device_id), "data"),
        (TopicBuilder::status_topic(device_id), "status"),
    ];

    let mut subscribed = Vec::with_capacity(topics.len());
    for (topic, kind) in topics {
        let log = log.cloned();
        client
            .subscribe(
                &topic,
                handler_fn(move |message| {
                    let entry = describe(kind, message);
                    info!(topic = %message.topic, retain = message.retain, "{entry}");
                    if let Some(log) = &log {
                        log.append(&entry);
                    }
                }),
            )
            .await?;
        subscribed.push(topic);
    }
    Ok(subscribed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_default_logging();

    let log = if args.no_log_file {
        None
    } else {
        Some(Arc::new(MessageLog::open(&args.log_file).map_err(|e| {
            error!(path = %args.log_file.display(), error = %e, "Failed to open message log");
            e
        })?))
    };

    let config = load_config(&args)?;
    let client = MqttClient::with_dispatch(config.mqtt.clone(), &config.dispatch)?;

    if let Err(e) = client.connect().await {
        error!(broker = %config.mqtt.broker_url, error = %e, "Failed to connect to MQTT broker");
        client.disconnect().await?;
        return Err(e.into());
    }
    info!(broker = %config.mqtt.broker_url, "Receiver connected to MQTT broker");

    for device_id in &args.devices {
        match subscribe_device(&client, device_id, log.as_ref()).await {
            Ok(topics) => info!(device_id = %device_id, ?topics, "Subscribed to device topics"),
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Failed to subscribe to device topics");
                client.disconnect().await?;
                return Err(e);
            }
        }
    }

    if let Some(log) = &log {
        log.append("MQTT receiver started");
        info!(path = %args.log_file.display(), "Appending received messages to file");
    }
    info!("Waiting for messages, press Ctrl+C to exit");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    if let Some(log) = &log {
        log.append("MQTT receiver stopped");
    }
    info!("Shutting down MQTT receiver");
    client.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_appends_stay_on_separate_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receiver.log");
        let log = Arc::new(MessageLog::open(&path).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for n in 0..50 {
                        log.append(&format!("writer {w} message {n} {}", "x".repeat(200)));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 8 * 50);
        for line in lines {
            assert!(line.starts_with('['), "interleaved entry: {line}");
            assert!(line.ends_with(&"x".repeat(200)), "interleaved entry: {line}");
        }
    }

    #[test]
    fn test_reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receiver.log");

        MessageLog::open(&path).unwrap().append("first run");
        MessageLog::open(&path).unwrap().append("second run");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.lines().next().unwrap().ends_with("first run"));
        assert!(contents.lines().nth(1).unwrap().ends_with("second run"));
    }

    #[test]
    fn test_describe_names_kind_topic_and_payload() {
        let message = InboundMessage::new("devices/device001/status", br#"{"status":"online"}"#.to_vec());
        assert_eq!(
            describe("status", &message),
            r#"Received device status from devices/device001/status: {"status":"online"}"#
        );
    }

    #[test]
    fn test_receiver_uses_a_durable_session() {
        let args = Args::parse_from([
            "mqtt-receiver",
            "--device",
            "device001",
            "--broker-url",
            "mqtt://broker.test:1883",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.mqtt.broker_url, "mqtt://broker.test:1883");
        assert!(config.mqtt.client_id.starts_with("mqtt-receiver-"));
        assert!(!config.mqtt.clean_session);
        assert!(!config.mqtt.unique_client_id);
    }
}
