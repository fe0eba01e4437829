//! Media engine boundary
//!
//! The SFU never touches ICE, DTLS, SRTP or RTP itself. Everything that
//! negotiates or moves packets sits behind these traits; the orchestration
//! layer only creates, connects and closes engine objects and forwards their
//! negotiated parameters to clients.
//!
//! Parameter types mirror the JSON shapes browser clients exchange with the
//! server. Fields the orchestration never inspects (header extensions,
//! encodings, RTCP settings) are carried as opaque JSON values.

mod loopback;

pub use loopback::{LoopbackConfig, LoopbackEngine};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("transport allocation failed: {0}")]
    TransportAllocation(String),

    #[error("transport {0} is closed")]
    TransportClosed(TransportId),

    #[error("transport {0} already connected")]
    AlreadyConnected(TransportId),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("invalid rtp parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown producer: {0}")]
    UnknownProducer(ProducerId),

    #[error("consumer {0} is closed")]
    ConsumerClosed(ConsumerId),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Codec the router is able to route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Codec name without the kind prefix (`video/VP8` -> `VP8`)
    #[must_use]
    pub fn codec_name(&self) -> &str {
        codec_name(&self.mime_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Router capabilities for a codec list, assigning dynamic payload types
    /// from 100 upwards where none is preferred.
    #[must_use]
    pub fn from_media_codecs(codecs: Vec<RtpCodecCapability>) -> Self {
        let codecs = codecs
            .into_iter()
            .zip(100u8..)
            .map(|(mut codec, payload_type)| {
                codec.preferred_payload_type.get_or_insert(payload_type);
                codec
            })
            .collect();

        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    #[must_use]
    pub fn find(&self, kind: MediaKind, mime_type: &str) -> Option<&RtpCodecCapability> {
        self.codecs
            .iter()
            .find(|c| c.kind == kind && c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecParameters {
    #[must_use]
    pub fn codec_name(&self) -> &str {
        codec_name(&self.mime_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Options for an internal, unencrypted RTP transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainTransportOptions {
    pub listen_ip: IpAddr,
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub enable_srtp: bool,
}

impl PlainTransportOptions {
    /// Loopback-only, rtcp-muxed, no SRTP, explicit remote
    #[must_use]
    pub fn local(listen_ip: IpAddr) -> Self {
        Self {
            listen_ip,
            rtcp_mux: true,
            comedia: false,
            enable_srtp: false,
        }
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Codecs the router accepts, as advertised to clients
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether RTP actually flows from producers to their consumers
    fn forwards_media(&self) -> bool {
        true
    }

    async fn create_webrtc_transport(&self) -> EngineResult<Arc<dyn WebRtcTransport>>;

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> EngineResult<Arc<dyn PlainTransport>>;
}

/// Client-facing ICE/DTLS transport
#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> &TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;

    /// Finalize the secure channel with the remote DTLS parameters
    async fn connect(&self, remote: DtlsParameters) -> EngineResult<()>;
    fn is_connected(&self) -> bool;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>>;

    /// Closes the transport and everything created on it
    fn close(&self);
    fn is_closed(&self) -> bool;

    /// Cancelled once the transport closes, whoever closed it
    fn closed_token(&self) -> CancellationToken;
}

/// Server-internal RTP transport without ICE or DTLS
#[async_trait]
pub trait PlainTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Send RTP to a fixed remote address
    async fn connect(&self, ip: IpAddr, port: u16) -> EngineResult<()>;
    fn remote(&self) -> Option<SocketAddr>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>>;

    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn resume(&self) -> EngineResult<()>;
    fn is_paused(&self) -> bool;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Codecs the router is configured with
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: params(&[("x-google-start-bitrate", Value::from(1000))]),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: params(&[
                ("packetization-mode", Value::from(1)),
                ("profile-level-id", Value::from("42e01f")),
                ("level-asymmetry-allowed", Value::from(1)),
            ]),
            rtcp_feedback: Vec::new(),
        },
    ]
}

fn codec_name(mime_type: &str) -> &str {
    mime_type
        .split_once('/')
        .map_or(mime_type, |(_, name)| name)
}
