mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use relaycast_api::{AppState, Features};
use relaycast_core::config::{HlsSettings, IngestSettings, SfuSettings};
use relaycast_core::{logging, Config};
use relaycast_sfu::engine::default_media_codecs;
use relaycast_sfu::hls::{prepare_output_dir, start_ingest, IngestSource, TranscoderProcess};
use relaycast_sfu::{
    BridgeConfig, EncodingPreset, FfmpegLauncher, HlsBridge, LoopbackConfig, LoopbackEngine,
    SfuConfig, SfuManager,
};

use server::RelaycastServer;

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "WebRTC SFU with HLS output", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "RELAYCAST_CONFIG")]
    config: Option<String>,

    /// HTTP listen host, overrides the configuration file
    #[arg(long)]
    host: Option<String>,

    /// HTTP listen port, overrides the configuration file
    #[arg(long)]
    port: Option<u16>,
}

fn parse_ip(value: &str, field: &str) -> Result<IpAddr> {
    value
        .parse()
        .with_context(|| format!("{field} is not a valid IP address: {value}"))
}

fn loopback_config(settings: &SfuSettings) -> Result<LoopbackConfig> {
    Ok(LoopbackConfig {
        listen_ip: parse_ip(&settings.listen_ip, "sfu.listen_ip")?,
        announced_ip: parse_ip(&settings.announced_ip, "sfu.announced_ip")?,
        rtc_min_port: settings.rtc_min_port,
        rtc_max_port: settings.rtc_max_port,
        max_transports: 0,
        media_codecs: default_media_codecs(),
    })
}

fn bridge_config(settings: &HlsSettings, preset: EncodingPreset) -> BridgeConfig {
    BridgeConfig {
        output_dir: PathBuf::from(&settings.output_dir),
        base_port: settings.base_port,
        port_stride: settings.port_stride,
        max_bridges: u32::try_from(settings.max_bridges).unwrap_or(u32::MAX),
        list_size: settings.list_size,
        preset,
        ..BridgeConfig::default()
    }
}

fn ingest_source(settings: &IngestSettings) -> Result<IngestSource> {
    Ok(IngestSource {
        ip: parse_ip(&settings.ip, "hls.ingest.ip")?,
        port: settings.port,
        payload_type: settings.payload_type,
        codec_name: settings.codec.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, CLI flags win
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(relaycast_core::Error::Validation(errors).into());
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Relaycast server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Media engine
    let engine = LoopbackEngine::new(loopback_config(&config.sfu)?);
    let preset = EncodingPreset::from_low_resource(config.hls.low_resource);
    info!(mode = preset.label(), "Encoding preset selected");

    // 5. Transcoder probe; the real-time relay runs without it
    let launcher = if config.hls.enabled {
        match FfmpegLauncher::probe(&config.hls.ffmpeg_path).await {
            Ok(launcher) => {
                info!(ffmpeg = %launcher.program().display(), "Transcoder available");
                Some(Arc::new(launcher))
            }
            Err(e) => {
                error!(error = %e, "HLS output disabled");
                None
            }
        }
    } else {
        info!("HLS output disabled by configuration");
        None
    };

    let hls_dir = PathBuf::from(&config.hls.output_dir);
    if launcher.is_some() {
        prepare_output_dir(&hls_dir)
            .await
            .with_context(|| format!("Failed to create {}", hls_dir.display()))?;
    }

    let bridge = launcher.as_ref().map(|launcher| {
        Arc::new(HlsBridge::new(
            Arc::new(engine.clone()),
            launcher.clone(),
            bridge_config(&config.hls, preset),
        ))
    });

    // 6. Optional always-on ingest transcoder
    let mut ingest: Option<Box<dyn TranscoderProcess>> = None;
    if let (Some(launcher), Some(settings)) = (&launcher, &config.hls.ingest) {
        let source = ingest_source(settings)?;
        match start_ingest(launcher.as_ref(), &hls_dir, &source, preset, config.hls.list_size).await {
            Ok(process) => ingest = Some(process),
            Err(e) => warn!(error = %e, "Failed to start ingest transcoder"),
        }
    }

    // 7. SFU manager
    let manager = SfuManager::new(
        SfuConfig {
            catch_up_delay_ms: config.sfu.catch_up_delay_ms,
            peer_channel_capacity: config.sfu.peer_channel_capacity,
        },
        Arc::new(engine),
        bridge.clone(),
    );
    let forwards_media = manager.forwards_media();
    if !forwards_media {
        warn!("Media engine only negotiates sessions; no RTP reaches consumers or HLS relays");
    }

    let state = AppState {
        manager,
        features: Features {
            webrtc: forwards_media,
            hls: bridge.is_some(),
            ffmpeg: launcher.is_some(),
        },
        preset,
        max_message_size: config.sfu.max_message_size,
    };

    // 8. Serve until a shutdown signal arrives
    RelaycastServer::new(config, state, hls_dir, ingest).start().await
}
