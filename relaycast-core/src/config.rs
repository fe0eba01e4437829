use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::logging::{parse_log_level, LogFormat};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuSettings,
    pub hls: HlsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Real-time relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuSettings {
    /// Address the engine binds WebRTC transports to
    pub listen_ip: String,
    /// Address advertised to clients in ICE candidates
    pub announced_ip: String,
    /// Lowest port handed out for WebRTC transports
    pub rtc_min_port: u16,
    /// Highest port handed out for WebRTC transports
    pub rtc_max_port: u16,
    /// Delay before a newly connected peer is told about existing producers
    pub catch_up_delay_ms: u64,
    /// Capacity of each peer's outbound message queue
    pub peer_channel_capacity: usize,
    /// Maximum inbound signaling message size in bytes
    pub max_message_size: usize,
}

impl Default for SfuSettings {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            catch_up_delay_ms: 1000,
            peer_channel_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

/// HLS output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsSettings {
    pub enabled: bool,
    /// Directory the playlists, segments and SDP files are written to
    pub output_dir: String,
    /// Transcoder executable
    pub ffmpeg_path: String,
    /// First RTP port handed to a bridge
    pub base_port: u16,
    /// Distance between consecutive bridge ports (RTP + RTCP)
    pub port_stride: u16,
    /// Maximum number of concurrent bridges (0 = limited by port space)
    pub max_bridges: usize,
    /// Number of segments kept in each playlist
    pub list_size: u32,
    /// Use the resource-constrained encoding preset
    pub low_resource: bool,
    /// Always-on transcoder fed by an external RTP sender
    pub ingest: Option<IngestSettings>,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: "./public/hls".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            base_port: 5004,
            port_stride: 2,
            max_bridges: 0,
            list_size: 5,
            low_resource: false,
            ingest: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    pub ip: String,
    pub port: u16,
    pub payload_type: u8,
    #[serde(default = "default_ingest_codec")]
    pub codec: String,
}

fn default_ingest_codec() -> String {
    "VP8".to_string()
}

impl Config {
    /// Load configuration from an optional file and environment variables
    ///
    /// Priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (RELAYCAST_SERVER__PORT, etc.)
        builder = builder.add_source(
            Environment::with_prefix("RELAYCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut config: Self = config.try_deserialize()?;

        // Honour the deployment-wide switch used by container images
        if std::env::var("LOW_RESOURCE").is_ok_and(|v| v == "true") {
            config.hls.low_resource = true;
        }

        Ok(config)
    }

    /// Check value ranges; returns every problem found
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if parse_log_level(&self.logging.level).is_none() {
            errors.push(format!(
                "logging.level ({}) must be one of trace, debug, info, warn, error",
                self.logging.level
            ));
        }
        if LogFormat::parse(&self.logging.format).is_none() {
            errors.push(format!(
                "logging.format ({}) must be json or pretty",
                self.logging.format
            ));
        }

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.sfu.rtc_min_port == 0 || self.sfu.rtc_min_port > self.sfu.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) must be non-zero and <= sfu.rtc_max_port ({})",
                self.sfu.rtc_min_port, self.sfu.rtc_max_port
            ));
        }
        if self.sfu.peer_channel_capacity == 0 {
            errors.push("sfu.peer_channel_capacity must be non-zero".to_string());
        }
        if self.sfu.max_message_size == 0 {
            errors.push("sfu.max_message_size must be non-zero".to_string());
        }
        if self.hls.enabled {
            if self.hls.base_port == 0 {
                errors.push("hls.base_port must be non-zero".to_string());
            }
            if self.hls.port_stride == 0 {
                errors.push("hls.port_stride must be non-zero".to_string());
            }
            if self.hls.list_size == 0 {
                errors.push("hls.list_size must be non-zero".to_string());
            }
            if self.hls.output_dir.trim().is_empty() {
                errors.push("hls.output_dir must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
