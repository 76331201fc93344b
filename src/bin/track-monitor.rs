//! Topic monitor for the tracker protocol
//!
//! Watches device telemetry, command traffic and presence broadcasts on a
//! live broker, with syntax highlighted JSON payloads.

use clap::Parser;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Topic monitor for the tracker protocol
#[derive(Parser)]
#[command(name = "track-monitor")]
#[command(about = "Monitor tracker device traffic on an MQTT broker")]
#[command(version)]
struct Args {
    /// Monitoring mode (all, locations, statuses, commands, or presence)
    #[arg(short, long, default_value = "all")]
    mode: MonitorMode,

    /// Output format (pretty, compact, or json)
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Topic namespace the devices publish under
    #[arg(long, default_value = "devices")]
    namespace: String,

    /// Only show traffic for this device ID
    #[arg(long)]
    device_id: Option<String>,

    /// MQTT broker host
    #[arg(long, default_value = "broker.hivemq.com")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    /// MQTT username (optional)
    #[arg(long)]
    username: Option<String>,

    /// MQTT password (optional)
    #[arg(long)]
    password: Option<String>,
}

/// Monitoring modes for different slices of tracker traffic
#[derive(Clone, Debug, clap::ValueEnum)]
enum MonitorMode {
    /// Monitor all tracker traffic
    All,
    /// Monitor location fixes (canonical and legacy topics)
    Locations,
    /// Monitor device connectivity status frames
    Statuses,
    /// Monitor command, response and pending-command traffic
    Commands,
    /// Monitor application presence broadcasts
    Presence,
}

/// Output formatting options
#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    /// Color-coded, human-readable with timestamps (default)
    Pretty,
    /// Single line per message, minimal formatting
    Compact,
    /// Raw JSON output for programmatic processing
    Json,
}

/// Message types with associated colors and mode relevance
#[derive(Debug, Clone, PartialEq)]
enum MessageType {
    /// Location fixes (<ns>/+/location and legacy localizacao)
    Location,
    /// Device connectivity frames (<ns>/+/status)
    Status,
    /// Commands sent to devices (<ns>/+/command)
    Command,
    /// Device acknowledgements (<ns>/+/response and legacy comando)
    Response,
    /// Parked commands awaiting delivery (<ns>/+/pending)
    Pending,
    /// Application presence broadcasts (system/status)
    Presence,
    /// Unknown message type
    Unknown,
}

impl MessageType {
    fn from_topic(topic: &str) -> Self {
        if topic == "system/status" {
            Self::Presence
        } else if topic.ends_with("/location") || topic.ends_with("/localizacao") {
            Self::Location
        } else if topic.ends_with("/status") {
            Self::Status
        } else if topic.ends_with("/command") {
            Self::Command
        } else if topic.ends_with("/response") || topic.ends_with("/comando") {
            Self::Response
        } else if topic.ends_with("/pending") {
            Self::Pending
        } else {
            Self::Unknown
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Location => "LOCATION",
            Self::Status => "STATUS",
            Self::Command => "COMMAND",
            Self::Response => "RESPONSE",
            Self::Pending => "PENDING",
            Self::Presence => "PRESENCE",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn color_code(&self) -> &'static str {
        match self {
            Self::Location => "\x1b[1;32m", // Green
            Self::Status => "\x1b[1;33m",   // Yellow
            Self::Command => "\x1b[1;34m",  // Blue
            Self::Response => "\x1b[1;36m", // Cyan
            Self::Pending => "\x1b[1;35m",  // Magenta
            Self::Presence => "\x1b[1;93m", // Bright Yellow
            Self::Unknown => "\x1b[0;37m",  // White
        }
    }

    /// Check if this message type should be shown in the given monitor mode
    fn is_relevant_for_mode(&self, mode: &MonitorMode) -> bool {
        match mode {
            MonitorMode::All => true,
            MonitorMode::Locations => matches!(self, Self::Location),
            MonitorMode::Statuses => matches!(self, Self::Status),
            MonitorMode::Commands => {
                matches!(self, Self::Command | Self::Response | Self::Pending)
            }
            MonitorMode::Presence => matches!(self, Self::Presence),
        }
    }
}

const RESET: &str = "\x1b[0m";

/// ANSI color codes for JSON syntax highlighting
const JSON_KEY_COLOR: &str = "\x1b[94m"; // Bright blue
const JSON_STRING_COLOR: &str = "\x1b[92m"; // Bright green
const JSON_NUMBER_COLOR: &str = "\x1b[93m"; // Bright yellow
const JSON_BOOL_COLOR: &str = "\x1b[95m"; // Bright magenta
const JSON_NULL_COLOR: &str = "\x1b[90m"; // Dark gray
const JSON_PUNCT_COLOR: &str = "\x1b[37m"; // White

fn push_quoted(out: &mut String, color: &str, s: &str) {
    out.push_str(color);
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
    out.push_str(RESET);
}

fn push_punct(out: &mut String, punct: &str) {
    out.push_str(JSON_PUNCT_COLOR);
    out.push_str(punct);
    out.push_str(RESET);
}

/// Render a JSON value with two-space indentation and syntax colors
fn render_json(value: &Value, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent + 1);
    let close_pad = "  ".repeat(indent);

    match value {
        Value::Null => {
            out.push_str(JSON_NULL_COLOR);
            out.push_str("null");
            out.push_str(RESET);
        }
        Value::Bool(b) => {
            out.push_str(JSON_BOOL_COLOR);
            out.push_str(if *b { "true" } else { "false" });
            out.push_str(RESET);
        }
        Value::Number(n) => {
            out.push_str(JSON_NUMBER_COLOR);
            out.push_str(&n.to_string());
            out.push_str(RESET);
        }
        Value::String(s) => push_quoted(out, JSON_STRING_COLOR, s),
        Value::Array(items) => {
            if items.is_empty() {
                push_punct(out, "[]");
                return;
            }
            push_punct(out, "[");
            for (i, item) in items.iter().enumerate() {
                out.push('\n');
                out.push_str(&pad);
                render_json(item, indent + 1, out);
                if i + 1 < items.len() {
                    push_punct(out, ",");
                }
            }
            out.push('\n');
            out.push_str(&close_pad);
            push_punct(out, "]");
        }
        Value::Object(map) => {
            if map.is_empty() {
                push_punct(out, "{}");
                return;
            }
            push_punct(out, "{");
            for (i, (key, item)) in map.iter().enumerate() {
                out.push('\n');
                out.push_str(&pad);
                push_quoted(out, JSON_KEY_COLOR, key);
                push_punct(out, ": ");
                render_json(item, indent + 1, out);
                if i + 1 < map.len() {
                    push_punct(out, ",");
                }
            }
            out.push('\n');
            out.push_str(&close_pad);
            push_punct(out, "}");
        }
    }
}

fn highlight_json(value: &Value) -> String {
    let mut out = String::new();
    render_json(value, 0, &mut out);
    out
}

fn format_message(
    msg_type: &MessageType,
    topic: &str,
    payload: &str,
    retained: bool,
    format: &OutputFormat,
) -> String {
    let timestamp = chrono::Utc::now().format("%H:%M:%S");

    match format {
        OutputFormat::Json => {
            let json_output = serde_json::json!({
                "timestamp": timestamp.to_string(),
                "message_type": msg_type.label(),
                "topic": topic,
                "retained": retained,
                "payload": if let Ok(json) = serde_json::from_str::<Value>(payload) {
                    json
                } else {
                    Value::String(payload.to_string())
                }
            });
            serde_json::to_string(&json_output).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Compact => {
            let retained_tag = if retained { " [retained]" } else { "" };
            format!(
                "{} [{}]{} {} {}",
                timestamp,
                msg_type.label(),
                retained_tag,
                topic,
                payload.replace('\n', " ").trim()
            )
        }
        OutputFormat::Pretty => {
            let color = msg_type.color_code();
            let label = msg_type.label();
            let retained_tag = if retained { " (retained)" } else { "" };

            let formatted_payload = if let Ok(json) = serde_json::from_str::<Value>(payload) {
                highlight_json(&json)
            } else {
                payload.to_string()
            };

            format!(
                "{color}[{label}]{RESET}{retained_tag} {timestamp} {topic}\n{formatted_payload}\n{RESET}"
            )
        }
    }
}

async fn setup_mqtt_client(
    args: &Args,
) -> Result<(AsyncClient, EventLoop), Box<dyn std::error::Error>> {
    // Unique client ID to avoid conflicts with other monitors
    let client_id = format!("track-monitor-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker_host, args.broker_port);

    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(std::time::Duration::from_secs(60));
    mqtt_options.set_max_packet_size(1024 * 1024, 1024 * 1024); // 1MB
    mqtt_options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
    Ok((client, eventloop))
}

async fn subscribe_to_topics(
    client: &AsyncClient,
    args: &Args,
) -> Result<(), rumqttc::ClientError> {
    let ns = &args.namespace;
    let dev = args.device_id.as_deref().unwrap_or("+");

    match args.mode {
        MonitorMode::All => {
            info!("Subscribing to all tracker topics under namespace: {ns}");

            for segment in [
                "location",
                "localizacao",
                "status",
                "command",
                "response",
                "comando",
                "pending",
            ] {
                client
                    .subscribe(format!("{ns}/{dev}/{segment}"), QoS::AtLeastOnce)
                    .await?;
            }
            client.subscribe("system/status", QoS::AtLeastOnce).await?;
        }
        MonitorMode::Locations => {
            info!("Subscribing to location topics");

            client
                .subscribe(format!("{ns}/{dev}/location"), QoS::AtLeastOnce)
                .await?;
            client
                .subscribe(format!("{ns}/{dev}/localizacao"), QoS::AtLeastOnce)
                .await?;
        }
        MonitorMode::Statuses => {
            info!("Subscribing to device status topics");

            client
                .subscribe(format!("{ns}/{dev}/status"), QoS::AtLeastOnce)
                .await?;
        }
        MonitorMode::Commands => {
            info!("Subscribing to command traffic topics");

            for segment in ["command", "response", "comando", "pending"] {
                client
                    .subscribe(format!("{ns}/{dev}/{segment}"), QoS::AtLeastOnce)
                    .await?;
            }
        }
        MonitorMode::Presence => {
            info!("Subscribing to presence broadcasts");

            client.subscribe("system/status", QoS::AtLeastOnce).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("track_monitor=info,rumqttc=warn")
        .init();

    let args = Args::parse();

    println!("Tracklink - Topic Monitor");
    println!("=========================");
    println!("Mode: {:?}", args.mode);
    println!("Format: {:?}", args.format);
    println!("Namespace: {}", args.namespace);
    println!("MQTT Broker: {}:{}", args.broker_host, args.broker_port);

    if let Some(ref device_id) = args.device_id {
        println!("Device Filter: {device_id}");
    }

    println!("Press Ctrl+C to stop monitoring");
    println!();

    // Show what we're monitoring
    let dev = args.device_id.as_deref().unwrap_or("+");
    match args.mode {
        MonitorMode::All => {
            println!("Monitoring ALL tracker traffic:");
            println!("  - Location fixes, status frames, command traffic");
            println!("  - Application presence broadcasts");
        }
        MonitorMode::Locations => {
            println!("Monitoring LOCATION traffic:");
            println!("  - {}/{dev}/location (canonical fixes)", args.namespace);
            println!("  - {}/{dev}/localizacao (legacy firmware)", args.namespace);
        }
        MonitorMode::Statuses => {
            println!("Monitoring STATUS traffic:");
            println!("  - {}/{dev}/status (connectivity frames)", args.namespace);
        }
        MonitorMode::Commands => {
            println!("Monitoring COMMAND traffic:");
            println!("  - {}/{dev}/command (outbound commands)", args.namespace);
            println!(
                "  - {}/{dev}/response (device acknowledgements)",
                args.namespace
            );
            println!("  - {}/{dev}/pending (parked commands)", args.namespace);
        }
        MonitorMode::Presence => {
            println!("Monitoring PRESENCE broadcasts:");
            println!("  - system/status (application presence)");
        }
    }
    println!();

    // Handle Ctrl+C gracefully
    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received...");
        shutdown_clone.store(true, std::sync::atomic::Ordering::Relaxed);

        // If we don't exit within 2 seconds, force exit
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        warn!("Graceful shutdown timed out, forcing exit");
        std::process::exit(0);
    });

    // Main connection loop with automatic reconnection
    let mut reconnect_delay = 1;
    const MAX_RECONNECT_DELAY: u64 = 30;

    loop {
        if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            info!("Shutting down monitor...");
            break;
        }

        info!("Connecting to MQTT broker...");

        let (client, mut eventloop) = match setup_mqtt_client(&args).await {
            Ok(client_and_loop) => client_and_loop,
            Err(e) => {
                error!("Failed to setup MQTT client: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(reconnect_delay)).await;
                reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
                continue;
            }
        };

        if let Err(e) = subscribe_to_topics(&client, &args).await {
            error!("Failed to subscribe to topics: {}", e);
            tokio::time::sleep(std::time::Duration::from_secs(reconnect_delay)).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
            continue;
        }

        // Reset reconnect delay on successful connection
        reconnect_delay = 1;
        let mut connection_stable = false;

        // Process MQTT events until disconnection
        loop {
            if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                info!("Disconnecting from MQTT broker...");
                let disconnect_timeout = tokio::time::timeout(
                    std::time::Duration::from_millis(500),
                    client.disconnect(),
                )
                .await;

                if disconnect_timeout.is_err() {
                    warn!("Disconnect timed out, forcing exit");
                }
                return Ok(());
            }

            // Poll with timeout to allow regular shutdown checks
            let poll_result =
                tokio::time::timeout(std::time::Duration::from_millis(100), eventloop.poll()).await;

            match poll_result {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let topic = &publish.topic;
                    let payload = String::from_utf8_lossy(&publish.payload);

                    let msg_type = MessageType::from_topic(topic);

                    if !msg_type.is_relevant_for_mode(&args.mode) {
                        continue;
                    }

                    let formatted =
                        format_message(&msg_type, topic, &payload, publish.retain, &args.format);
                    match args.format {
                        OutputFormat::Json | OutputFormat::Compact => println!("{formatted}"),
                        OutputFormat::Pretty => print!("{formatted}"),
                    }
                }
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!("✅ Connected to MQTT broker");
                    connection_stable = true;
                }
                Ok(Ok(Event::Incoming(Packet::SubAck(_)))) => {
                    info!("✅ Successfully subscribed to topics");
                }
                Ok(Ok(_)) => {} // Ignore other events
                Ok(Err(e)) => {
                    if connection_stable {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        error!("MQTT connection error during setup: {}", e);
                    }
                    break; // Exit inner loop to reconnect
                }
                Err(_) => {
                    // Timeout occurred, continue to check for shutdown
                    continue;
                }
            }
        }

        // Connection lost, wait before reconnecting
        if !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            warn!("Reconnecting in {} seconds...", reconnect_delay);
            tokio::time::sleep(std::time::Duration::from_secs(reconnect_delay)).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
        }
    }

    Ok(())
}
