use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chorus_client_core::config::ChorusConfig;
use chorus_client_core::media::devices::{MemoryPreferences, SyntheticDevices};
use chorus_client_core::media::rtc::RtcFactory;
use chorus_client_core::session::{MeshClient, SessionDeps, SessionEvent};
use chorus_client_core::signaling::websocket::WebSocketSignaling;
use chorus_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use clap::{Args, Parser};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("chorus: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "chorus",
    about = "Join a full-mesh voice/video channel",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        env = "CHORUS_SIGNALING_URL",
        help = "Channel gateway URL (http, https, ws or wss)"
    )]
    signaling_url: Option<String>,

    #[arg(long, short = 'c', env = "CHORUS_CHANNEL_ID", help = "Channel to join")]
    channel: Option<String>,

    #[arg(
        long,
        env = "CHORUS_PEER_ID",
        help = "Participant id; a random one is generated when omitted"
    )]
    peer_id: Option<String>,

    #[arg(long, env = "CHORUS_DISPLAY_NAME")]
    display_name: Option<String>,

    #[arg(long, help = "Publish the camera after joining")]
    camera: bool,

    #[arg(long, help = "Join with the microphone muted")]
    muted: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CHORUS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CHORUS_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self, fallback_file: Option<&str>) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone().or_else(|| fallback_file.map(PathBuf::from)),
        }
    }
}

async fn run() -> Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("chorus: ignoring .env: {err}");
        }
    }
    let cli = Cli::parse();
    let (config, config_error) = match ChorusConfig::from_env() {
        Ok(config) => (config, None),
        Err(err) => (ChorusConfig::default(), Some(err)),
    };

    let log_config = cli.logging.to_config(config.log_path.as_deref());
    logctl::init(&log_config).context("failed to initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    if let Some(err) = config_error {
        warn!(error = %err, "invalid CHORUS_* configuration; using defaults");
    }

    let signaling_url = cli
        .signaling_url
        .or(config.signaling_url.clone())
        .ok_or_else(|| anyhow!("no signaling url; pass --signaling-url or set CHORUS_SIGNALING_URL"))?;
    let channel = cli
        .channel
        .or(config.channel_id.clone())
        .ok_or_else(|| anyhow!("no channel; pass --channel or set CHORUS_CHANNEL_ID"))?;
    let peer_id = cli
        .peer_id
        .or(config.peer_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let display_name = cli.display_name.or(config.display_name.clone());

    let deps = SessionDeps {
        signaling: Arc::new(WebSocketSignaling::new(&signaling_url)?),
        factory: Arc::new(RtcFactory::new(peer_id.clone())?),
        devices: Arc::new(SyntheticDevices::new()),
        preferences: Arc::new(MemoryPreferences::new()),
        fallback_ice_servers: config.fallback_ice_servers(),
        timing: config.session_timing(),
    };
    let client = MeshClient::new(deps, peer_id.clone(), display_name);
    let handle = client
        .join(&channel)
        .await
        .with_context(|| format!("failed to join channel {channel}"))?;
    info!(%channel, %peer_id, "joined channel");

    if cli.muted {
        handle.set_muted(true)?;
    }
    if cli.camera {
        if let Err(err) = handle.set_camera(true).await {
            warn!(error = %err, "camera unavailable; continuing with audio only");
        }
    }

    let mut events = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; leaving channel");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Closed) => break,
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "failed to encode session event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.leave().await;
    Ok(())
}
