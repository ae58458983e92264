//! Mesh Bridge Node - Meshtastic MQTT uplink consumer
//!
//! This binary runs the mesh bridge against a broker and:
//! - Connects and subscribes to the Meshtastic envelope topic
//! - Drains decoded text messages every poll interval
//! - Writes each message to stdout as one JSON line

mod settings;

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use mesh_bridge::{IncomingTextMessage, MeshBridge, MqttTransport, VERSION};
use settings::{ConsumerSettings, Settings};

#[derive(Parser)]
#[command(name = "mesh-bridge-node")]
#[command(about = "Bridge Meshtastic MQTT text traffic to JSON lines")]
struct Args {
    /// Settings file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Broker address (overrides the settings file)
    #[arg(long, short)]
    address: Option<String>,

    /// Broker port (overrides the settings file)
    #[arg(long, short)]
    port: Option<u16>,

    /// Broker username (overrides the settings file)
    #[arg(long, short)]
    username: Option<String>,

    /// Time between queue drains, e.g. "5s" (overrides the settings file)
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for messages
    let verbose = args.verbose || std::env::var_os("DEBUG").is_some_and(|v| !v.is_empty());
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Mesh Bridge Node v{}", VERSION);

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(address) = args.address {
        settings.mqtt.address = address;
    }
    if let Some(port) = args.port {
        settings.mqtt.port = port;
    }
    if let Some(username) = args.username {
        settings.mqtt.username = Some(username);
    }
    if let Some(interval) = args.poll_interval {
        settings.consumer.poll_interval = interval;
    }
    settings.validate().context("invalid settings")?;
    debug!(settings = ?settings, "Settings loaded");

    let config = settings.bridge_config();
    let transport = MqttTransport::new(config.mqtt.clone());
    let bridge = MeshBridge::connect(transport, config)
        .await
        .with_context(|| format!("failed to connect to broker {}", settings.mqtt.endpoint()))?;
    bridge.start().await?;

    info!(
        poll_interval = %humantime::format_duration(settings.consumer.poll_interval),
        "Draining bridge queue"
    );
    let mut interval = tokio::time::interval(settings.consumer.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                emit(bridge.drain_all(), &settings.consumer)?;
                if !bridge.is_running() {
                    warn!("Network loop stopped, exiting");
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    bridge.stop().await?;
    emit(bridge.drain_all(), &settings.consumer)?;

    let stats = bridge.stats();
    info!(
        deliveries = stats.deliveries,
        text_messages = stats.text_messages,
        metadata_updates = stats.metadata_updates,
        decode_errors = stats.decode_errors,
        "Mesh bridge stats"
    );
    bridge.shutdown().await?;

    info!("Mesh Bridge Node stopped");
    Ok(())
}

/// Write each wanted message as a JSON line on stdout
fn emit(messages: Vec<IncomingTextMessage>, consumer: &ConsumerSettings) -> anyhow::Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    debug!(count = messages.len(), "Drained messages");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for message in messages {
        if !consumer.wants(message.channel_id()) {
            debug!(channel = %message.channel_id(), "Skipping message on unlinked channel");
            continue;
        }
        serde_json::to_writer(&mut out, &message)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
