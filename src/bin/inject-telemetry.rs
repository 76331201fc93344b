//! Telemetry injection utility
//!
//! Publishes synthetic location fixes (and optionally a status frame) for a
//! device, for exercising a running tracker service against a live broker.
//!
//! ## Usage
//!
//! ```bash
//! # Five fixes, one second apart, walking away from the default position
//! inject-telemetry --device-id tk-4821
//!
//! # A burst with speed and battery readings
//! inject-telemetry --device-id tk-4821 --count 20 --interval-ms 200 \
//!   --speed 42 --battery 87
//!
//! # Legacy firmware shape (localizacao topic segment)
//! inject-telemetry --device-id tk-4821 --legacy
//!
//! # Follow up with a connectivity status frame
//! inject-telemetry --device-id tk-4821 --count 1 --status offline
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::time::{sleep, Duration};
use tracklink::protocol::{
    device_topic, ConnectivityStatus, DeviceStatus, LocationReport, MessageKind,
};

#[derive(Parser)]
#[command(
    name = "inject-telemetry",
    about = "Inject synthetic device telemetry for testing a tracker service",
    long_about = "Publishes synthetic location fixes (and optionally a status frame) for a\ndevice, for exercising a running tracker service against a live broker."
)]
struct Args {
    /// Target device ID
    #[arg(long, required = true)]
    device_id: String,

    /// Number of fixes to publish
    #[arg(long, default_value_t = 5)]
    count: u32,

    /// Delay between fixes in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Starting latitude
    #[arg(long, default_value_t = -23.5505, allow_hyphen_values = true)]
    latitude: f64,

    /// Starting longitude
    #[arg(long, default_value_t = -46.6333, allow_hyphen_values = true)]
    longitude: f64,

    /// Speed in km/h to report on every fix
    #[arg(long)]
    speed: Option<f64>,

    /// Battery percentage to report on every fix
    #[arg(long)]
    battery: Option<u8>,

    /// Publish on the legacy localizacao topic segment
    #[arg(long)]
    legacy: bool,

    /// Publish a final status frame (online, offline or error)
    #[arg(long)]
    status: Option<String>,

    /// Topic namespace the service is watching
    #[arg(long, default_value = "devices")]
    namespace: String,

    /// MQTT broker host
    #[arg(long, default_value = "broker.hivemq.com")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,
}

struct TelemetryInjector {
    client: AsyncClient,
    namespace: String,
}

impl TelemetryInjector {
    async fn new(args: &Args) -> Result<Self, Box<dyn std::error::Error>> {
        let client_id = format!(
            "inject-telemetry-{}",
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs()
        );

        let mut mqttoptions = MqttOptions::new(client_id, &args.broker_host, args.broker_port);
        mqttoptions.set_keep_alive(Duration::from_secs(60));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Drive the event loop in the background
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("MQTT eventloop error: {e}");
                        break;
                    }
                }
            }
        });

        // Wait for connection
        println!(
            "Connecting to MQTT broker {}:{}...",
            args.broker_host, args.broker_port
        );
        sleep(Duration::from_millis(1000)).await;

        Ok(TelemetryInjector {
            client,
            namespace: args.namespace.clone(),
        })
    }

    fn location_topic(&self, device_id: &str, legacy: bool) -> String {
        if legacy {
            format!("{}/{}/localizacao", self.namespace, device_id)
        } else {
            device_topic(&self.namespace, device_id, MessageKind::Location)
        }
    }

    async fn inject_fixes(&self, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
        let topic = self.location_topic(&args.device_id, args.legacy);

        println!("\n📤 Injecting {} fixes to {topic}", args.count);
        if let Some(speed) = args.speed {
            println!("   Speed: {speed} km/h");
        }
        if let Some(battery) = args.battery {
            println!("   Battery: {battery}%");
        }

        for i in 0..args.count {
            // Walk north-east a little on each fix so movement shows up
            let report = LocationReport {
                latitude: args.latitude + f64::from(i) * 0.0004,
                longitude: args.longitude + f64::from(i) * 0.0003,
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                speed: args.speed,
                battery: args.battery,
                signal: None,
                address: None,
            };
            let payload = serde_json::to_string(&report)?;

            self.client
                .publish(&topic, QoS::AtLeastOnce, false, payload)
                .await?;
            println!(
                "   Fix {}/{}: {:.4}, {:.4}",
                i + 1,
                args.count,
                report.latitude,
                report.longitude
            );

            if i + 1 < args.count {
                sleep(Duration::from_millis(args.interval_ms)).await;
            }
        }

        println!("✓ Fixes injected successfully");
        Ok(())
    }

    async fn inject_status(
        &self,
        device_id: &str,
        status: ConnectivityStatus,
        battery: Option<u8>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let topic = device_topic(&self.namespace, device_id, MessageKind::Status);
        let frame = DeviceStatus {
            status,
            battery,
            signal: None,
        };
        let payload = serde_json::to_string(&frame)?;

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await?;
        println!("✓ Status frame injected on {topic}");
        Ok(())
    }
}

fn parse_status(s: &str) -> Result<ConnectivityStatus, String> {
    match s.to_lowercase().as_str() {
        "online" => Ok(ConnectivityStatus::Online),
        "offline" => Ok(ConnectivityStatus::Offline),
        "error" => Ok(ConnectivityStatus::Error),
        other => Err(format!(
            "unknown status '{other}' (expected online, offline or error)"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Validate the status value before connecting
    let status = match args.status.as_deref().map(parse_status).transpose() {
        Ok(status) => status,
        Err(e) => {
            eprintln!("✗ {e}");
            std::process::exit(1);
        }
    };

    if args.count == 0 && status.is_none() {
        eprintln!("✗ Nothing to inject (count is 0 and no --status given)");
        std::process::exit(1);
    }

    let injector = TelemetryInjector::new(&args).await?;

    if args.count > 0 {
        if let Err(e) = injector.inject_fixes(&args).await {
            eprintln!("✗ Failed to inject fixes: {e}");
            std::process::exit(1);
        }
    }

    if let Some(status) = status {
        if let Err(e) = injector
            .inject_status(&args.device_id, status, args.battery)
            .await
        {
            eprintln!("✗ Failed to inject status: {e}");
            std::process::exit(1);
        }
    }

    // Brief pause to allow message delivery
    sleep(Duration::from_millis(500)).await;

    println!("\n💡 Watch the service pick these up with:");
    println!(
        "   cargo run --bin track-monitor -- --device-id {}",
        args.device_id
    );

    Ok(())
}
