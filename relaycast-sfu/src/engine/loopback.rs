//! In-process media engine
//!
//! Negotiates everything a real engine would (ids, ICE credentials, DTLS
//! fingerprints, consumer RTP parameters) and enforces the same object
//! lifecycle rules, but moves no packets. Used by the test suite and by the
//! server when no external engine is wired in.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{
    default_media_codecs, Consumer, DtlsFingerprint, DtlsParameters, DtlsRole, EngineError,
    EngineResult, IceCandidate, IceParameters, MediaEngine, PlainTransport,
    PlainTransportOptions, Producer, RtpCapabilities, RtpCodecCapability, RtpParameters,
    WebRtcTransport,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Address transports would bind to
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates
    pub announced_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Maximum simultaneously open transports (0 = unlimited)
    pub max_transports: usize,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            max_transports: 0,
            media_codecs: default_media_codecs(),
        }
    }
}

struct EngineInner {
    config: LoopbackConfig,
    capabilities: RtpCapabilities,
    producers: DashMap<ProducerId, Arc<LoopbackProducer>>,
    port_cursor: AtomicU32,
    open_transports: AtomicUsize,
}

impl EngineInner {
    fn reserve_transport(&self) -> EngineResult<()> {
        let limit = self.config.max_transports;
        self.open_transports
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (limit == 0 || open < limit).then_some(open + 1)
            })
            .map(|_| ())
            .map_err(|open| {
                EngineError::TransportAllocation(format!("transport limit reached ({open} open)"))
            })
    }

    fn release_transport(&self) {
        self.open_transports.fetch_sub(1, Ordering::AcqRel);
    }

    fn next_port(&self) -> u16 {
        let min = u32::from(self.config.rtc_min_port);
        let span = u32::from(self.config.rtc_max_port).saturating_sub(min) + 1;
        let offset = self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(min + offset).unwrap_or(self.config.rtc_max_port)
    }

    fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
        transport_closed: CancellationToken,
    ) -> EngineResult<Arc<LoopbackConsumer>> {
        let producer = self
            .producers
            .get(producer_id)
            .map(|p| Arc::clone(p.value()))
            .filter(|p| !p.is_closed())
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;

        let codecs: Vec<_> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                rtp_capabilities
                    .find(producer.kind, &codec.mime_type)
                    .map(|cap| {
                        let mut codec = codec.clone();
                        if let Some(pt) = cap.preferred_payload_type {
                            codec.payload_type = pt;
                        }
                        codec
                    })
            })
            .collect();

        if codecs.is_empty() {
            let mime = producer
                .rtp_parameters
                .codecs
                .first()
                .map_or_else(|| "none".to_string(), |c| c.mime_type.clone());
            return Err(EngineError::UnsupportedCodec(mime));
        }

        let id = ConsumerId::new(Uuid::new_v4().to_string());
        let rtp_parameters = RtpParameters {
            mid: Some(id.as_str().chars().take(8).collect()),
            codecs,
            header_extensions: producer.rtp_parameters.header_extensions.clone(),
            encodings: vec![json!({ "ssrc": random_ssrc() })],
            rtcp: Some(json!({ "cname": producer.id.as_str(), "reducedSize": true })),
        };

        Ok(Arc::new(LoopbackConsumer {
            id,
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            producer_closed: producer.closed.clone(),
            transport_closed,
        }))
    }
}

/// Engine that negotiates but does not forward media
#[derive(Clone)]
pub struct LoopbackEngine {
    inner: Arc<EngineInner>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(config: LoopbackConfig) -> Self {
        let capabilities = RtpCapabilities::from_media_codecs(config.media_codecs.clone());
        debug!(
            listen_ip = %config.listen_ip,
            announced_ip = %config.announced_ip,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            codecs = capabilities.codecs.len(),
            "Loopback media engine created"
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                capabilities,
                producers: DashMap::new(),
                port_cursor: AtomicU32::new(0),
                open_transports: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of live producers across all transports
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.inner.producers.len()
    }

    /// Number of transports (WebRTC and plain) not yet closed
    #[must_use]
    pub fn open_transport_count(&self) -> usize {
        self.inner.open_transports.load(Ordering::Acquire)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.capabilities.clone()
    }

    fn forwards_media(&self) -> bool {
        false
    }

    async fn create_webrtc_transport(&self) -> EngineResult<Arc<dyn WebRtcTransport>> {
        self.inner.reserve_transport()?;

        let id = TransportId::new(Uuid::new_v4().to_string());
        let port = self.inner.next_port();
        let ip = self.inner.config.announced_ip;

        let transport = LoopbackWebRtcTransport {
            ice: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            candidates: vec![
                IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: 1_076_302_079,
                    ip,
                    port,
                    protocol: "udp".to_string(),
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                },
                IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: 1_076_276_479,
                    ip,
                    port,
                    protocol: "tcp".to_string(),
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                },
            ],
            dtls: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint(&id),
                }],
            },
            id,
            engine: Arc::clone(&self.inner),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            producers: Mutex::new(Vec::new()),
        };

        debug!(transport_id = %transport.id, port, "Created WebRTC transport");
        Ok(Arc::new(transport))
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> EngineResult<Arc<dyn PlainTransport>> {
        if options.enable_srtp {
            return Err(EngineError::TransportAllocation(
                "SRTP is not supported on plain transports".to_string(),
            ));
        }
        self.inner.reserve_transport()?;

        let transport = LoopbackPlainTransport {
            id: TransportId::new(Uuid::new_v4().to_string()),
            engine: Arc::clone(&self.inner),
            remote: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        };

        debug!(
            transport_id = %transport.id,
            listen_ip = %options.listen_ip,
            "Created plain transport"
        );
        Ok(Arc::new(transport))
    }
}

struct LoopbackWebRtcTransport {
    id: TransportId,
    engine: Arc<EngineInner>,
    ice: IceParameters,
    candidates: Vec<IceCandidate>,
    dtls: DtlsParameters,
    connected: AtomicBool,
    closing: AtomicBool,
    closed: CancellationToken,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
}

#[async_trait]
impl WebRtcTransport for LoopbackWebRtcTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls.clone()
    }

    async fn connect(&self, remote: DtlsParameters) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed(self.id.clone()));
        }
        if remote.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "remote DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyConnected(self.id.clone()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed(self.id.clone()));
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters("no codecs".to_string()));
        }
        for codec in &rtp_parameters.codecs {
            if self
                .engine
                .capabilities
                .find(kind, &codec.mime_type)
                .is_none()
            {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(Uuid::new_v4().to_string()),
            kind,
            rtp_parameters,
            closed: CancellationToken::new(),
            engine: Arc::downgrade(&self.engine),
        });

        self.engine
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));

        // Lost a race with close(): do not leave a live producer behind
        if self.is_closed() {
            producer.close();
            return Err(EngineError::TransportClosed(self.id.clone()));
        }

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed(self.id.clone()));
        }
        let consumer =
            self.engine
                .consume(producer_id, rtp_capabilities, paused, self.closed.clone())?;
        Ok(consumer)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close();
        }
        self.engine.release_transport();
        debug!(transport_id = %self.id, "Closed WebRTC transport");
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

struct LoopbackPlainTransport {
    id: TransportId,
    engine: Arc<EngineInner>,
    remote: Mutex<Option<SocketAddr>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl PlainTransport for LoopbackPlainTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn connect(&self, ip: IpAddr, port: u16) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed(self.id.clone()));
        }
        let mut remote = self.remote.lock();
        if remote.is_some() {
            return Err(EngineError::AlreadyConnected(self.id.clone()));
        }
        *remote = Some(SocketAddr::new(ip, port));
        Ok(())
    }

    fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed(self.id.clone()));
        }
        let consumer =
            self.engine
                .consume(producer_id, rtp_capabilities, paused, self.closed.clone())?;
        Ok(consumer)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        self.engine.release_transport();
        debug!(transport_id = %self.id, "Closed plain transport");
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: CancellationToken,
    engine: Weak<EngineInner>,
}

impl Producer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(engine) = self.engine.upgrade() {
            engine.producers.remove(&self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    producer_closed: CancellationToken,
    transport_closed: CancellationToken,
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::ConsumerClosed(self.id.clone()));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.producer_closed.is_cancelled()
            || self.transport_closed.is_cancelled()
    }
}

fn fingerprint(id: &TransportId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_str().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[allow(clippy::cast_possible_truncation)]
fn random_ssrc() -> u32 {
    Uuid::new_v4().as_u128() as u32
}
