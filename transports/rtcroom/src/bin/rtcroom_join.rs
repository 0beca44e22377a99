//! Room join binary
//!
//! Joins a room, logs every room event and optionally subscribes to all
//! streams or publishes a data stream. Runs until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Join with a token and watch the room
//! rtcroom-join --token "$ROOM_TOKEN"
//!
//! # Subscribe to everything published in the room
//! rtcroom-join --token "$ROOM_TOKEN" --subscribe
//!
//! # Full configuration from a TOML file
//! rtcroom-join --config room.toml --publish-data
//! ```
//!
//! # Environment Variables
//!
//! - `RTCROOM_TOKEN`: Room token (overridden by `--token`)
//! - `RUST_LOG`: Logging level (default: `info`)

use anyhow::Context;
use clap::Parser;
use rtcroom::{
    PublishOptions, Room, RoomConfig, RoomEvent, Stream, StreamOptions, SubscribeOptions,
};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rtcroom-join", version, about = "Join a room and log its events")]
struct Args {
    /// Room token
    #[arg(long, env = "RTCROOM_TOKEN")]
    token: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Subscribe to every remote stream
    #[arg(long)]
    subscribe: bool,

    /// Publish a data-only stream once connected
    #[arg(long)]
    publish_data: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!(version = rtcroom::version(), "rtcroom join starting");

    let config = load_config(&args)?;
    let (room, mut events) = Room::with_config(config);
    room.connect().context("failed to start connecting")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, leaving room");
                room.disconnect();
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !handle_event(&room, &args, event) {
                    break;
                }
            }
        }
    }

    info!("rtcroom join stopped");
    Ok(())
}

/// Returns false once the room is gone
fn handle_event(room: &Room, args: &Args, event: RoomEvent) -> bool {
    info!(event = event.name(), "Room event");
    match event {
        RoomEvent::RoomConnected { streams } => {
            info!("Connected with {} streams in the room", streams.len());
            if args.subscribe {
                for stream in streams.iter().filter(|s| !s.local) {
                    spawn_subscribe(room, stream.id.clone());
                }
            }
            if args.publish_data {
                let room = room.clone();
                tokio::spawn(async move {
                    let stream = Stream::local(StreamOptions {
                        data: true,
                        label: Some("data".to_string()),
                        ..Default::default()
                    });
                    match room.publish(stream, PublishOptions::default()).await {
                        Ok(id) => info!("Published data stream {}", id),
                        Err(e) => error!("Failed to publish data stream: {}", e),
                    }
                });
            }
        }
        RoomEvent::StreamAdded { stream } if args.subscribe && !stream.local => {
            spawn_subscribe(room, stream.id);
        }
        RoomEvent::StreamFailed {
            stream,
            message,
            origin,
            ..
        } => {
            warn!("Stream {} failed ({}): {}", stream.id, origin, message);
        }
        RoomEvent::RoomDisconnected { message } => {
            info!("Room disconnected: {}", message);
            return false;
        }
        _ => {}
    }
    true
}

fn spawn_subscribe(room: &Room, stream_id: String) {
    let room = room.clone();
    tokio::spawn(async move {
        if let Err(e) = room.subscribe(&stream_id, SubscribeOptions::default()).await {
            warn!("Failed to subscribe to {}: {}", stream_id, e);
        }
    });
}

fn load_config(args: &Args) -> anyhow::Result<RoomConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            RoomConfig::from_toml_str(&text)?
        }
        None => RoomConfig::default(),
    };
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
