//! SFU Manager - session protocol handling and room-wide orchestration
//!
//! This module provides:
//! - Peer admission and disconnect with full resource teardown
//! - One handler per signaling request
//! - `new-producer` fan-out and late-joiner catch-up
//! - HLS bridge start/stop tied to video producer lifetime
//! - Global statistics collection

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::engine::{
    DtlsParameters, EngineError, IceCandidate, IceParameters, MediaEngine, Producer,
    RtpCapabilities, RtpParameters, WebRtcTransport,
};
use crate::error::{ErrorKind, Result, SfuError};
use crate::hls::HlsBridge;
use crate::peer::{Peer, ReleasedResources, SessionState};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::SfuRoom;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId, TransportRole};

/// Text of every `error` reply; details stay in the server log
pub const REQUEST_FAILED: &str = "Request failed";

/// Global SFU manager statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    /// Connected peers
    pub peers: usize,
    pub transports: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub consumers: usize,
    /// Live HLS relays
    pub active_bridges: usize,
}

/// Reply payload of a successful create-transport
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub direction: TransportRole,
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<TransportInfo> for ServerMessage {
    fn from(info: TransportInfo) -> Self {
        Self::TransportCreated {
            direction: info.direction,
            id: info.id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
        }
    }
}

/// Reply payload of a successful consume
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl From<ConsumerInfo> for ServerMessage {
    fn from(info: ConsumerInfo) -> Self {
        Self::ConsumerCreated {
            id: info.id,
            producer_id: info.producer_id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
        }
    }
}

/// SFU Manager - owns the room and drives the media engine
pub struct SfuManager {
    config: SfuConfig,
    engine: Arc<dyn MediaEngine>,
    room: SfuRoom,
    bridge: Option<Arc<HlsBridge>>,
}

impl SfuManager {
    /// Create a new SFU manager. Without a bridge, video is only relayed.
    pub fn new(
        config: SfuConfig,
        engine: Arc<dyn MediaEngine>,
        bridge: Option<Arc<HlsBridge>>,
    ) -> Arc<Self> {
        info!(
            catch_up_delay_ms = config.catch_up_delay_ms,
            peer_channel_capacity = config.peer_channel_capacity,
            hls = bridge.is_some(),
            "SFU Manager initialized"
        );

        Arc::new(Self {
            config,
            engine,
            room: SfuRoom::new(),
            bridge,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub const fn room(&self) -> &SfuRoom {
        &self.room
    }

    #[must_use]
    pub fn bridge(&self) -> Option<&Arc<HlsBridge>> {
        self.bridge.as_ref()
    }

    /// False when the engine only negotiates and no media reaches consumers
    #[must_use]
    pub fn forwards_media(&self) -> bool {
        self.engine.forwards_media()
    }

    /// Admit a new peer. The receiver carries everything the server sends it.
    pub fn connect(self: &Arc<Self>) -> (Arc<Peer>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.config.peer_channel_capacity.max(1));
        let peer = Arc::new(Peer::new(PeerId::generate(), tx));
        self.room.add_peer(Arc::clone(&peer));

        info!(
            peer_id = %peer.id,
            total_peers = self.room.peer_count(),
            "Peer connected"
        );

        let weak = Arc::downgrade(self);
        let peer_id = peer.id.clone();
        let delay = self.config.catch_up_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.notify_existing_producers(&peer_id);
            }
        });

        (peer, rx)
    }

    /// Tell `peer_id` about every live producer of the other peers
    pub fn notify_existing_producers(&self, peer_id: &PeerId) -> usize {
        let Some(peer) = self.room.get(peer_id).filter(|p| !p.is_closed()) else {
            return 0;
        };

        let mut sent = 0;
        for other in self.room.others(peer_id) {
            for (producer_id, kind) in other.producer_summaries() {
                if peer.send(ServerMessage::NewProducer { producer_id, kind }) {
                    sent += 1;
                }
            }
        }

        debug!(peer_id = %peer_id, producers = sent, "Sent existing producers");
        sent
    }

    fn peer(&self, peer_id: &PeerId) -> Result<Arc<Peer>> {
        self.room
            .get(peer_id)
            .filter(|p| !p.is_closed())
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    pub fn router_capabilities(&self, peer_id: &PeerId) -> Result<RtpCapabilities> {
        let peer = self.peer(peer_id)?;
        peer.advance(SessionState::CapabilitiesSent);
        Ok(self.engine.rtp_capabilities())
    }

    /// Allocate a WebRTC transport for `role`, replacing any earlier one
    pub async fn create_transport(
        self: &Arc<Self>,
        peer_id: &PeerId,
        role: TransportRole,
    ) -> Result<TransportInfo> {
        let peer = self.peer(peer_id)?;
        let transport = self.engine.create_webrtc_transport().await?;

        let replaced = match peer.insert_transport(role, Arc::clone(&transport)) {
            Ok(replaced) => replaced,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        if let Some(released) = replaced {
            debug!(peer_id = %peer_id, role = %role, "Replacing transport");
            self.release(released);
        }

        self.watch_transport(peer_id, &transport);
        peer.advance(SessionState::TransportsPending);

        info!(
            peer_id = %peer_id,
            transport_id = %transport.id(),
            direction = %role,
            "Transport created"
        );

        Ok(TransportInfo {
            direction: role,
            id: transport.id().clone(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        })
    }

    /// Release everything bound to a transport once the engine reports it closed
    fn watch_transport(self: &Arc<Self>, peer_id: &PeerId, transport: &Arc<dyn WebRtcTransport>) {
        let token = transport.closed_token();
        let weak: Weak<Self> = Arc::downgrade(self);
        let peer_id = peer_id.clone();
        let transport_id = transport.id().clone();

        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(manager) = weak.upgrade() {
                manager.on_transport_closed(&peer_id, &transport_id);
            }
        });
    }

    fn on_transport_closed(&self, peer_id: &PeerId, transport_id: &TransportId) {
        let Some(peer) = self.room.get(peer_id) else {
            return;
        };
        if let Some(released) = peer.detach_transport(transport_id) {
            debug!(
                peer_id = %peer_id,
                transport_id = %transport_id,
                producers = released.producers.len(),
                consumers = released.consumers.len(),
                "Transport closed"
            );
            self.release(released);
        }
    }

    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let peer = self.peer(peer_id)?;
        let transport = peer
            .find_transport(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        transport.connect(dtls_parameters).await?;

        if peer.transports_connected() {
            peer.advance(SessionState::TransportsReady);
        }
        debug!(peer_id = %peer_id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Create a producer on the caller's send transport and announce it
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let peer = self.peer(peer_id)?;
        let transport = peer
            .transport(TransportRole::Send, transport_id)
            .ok_or_else(|| SfuError::SendTransportNotFound(transport_id.clone()))?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        if let Err(e) = peer.insert_producer(Arc::clone(&producer), transport_id.clone()) {
            producer.close();
            return Err(e);
        }
        let producer_id = producer.id().clone();

        if kind.is_video() {
            self.start_bridge(&producer).await;

            // The owner may have left while the relay was being built
            if peer.is_closed() {
                producer.close();
                return Err(SfuError::PeerNotFound(peer_id.clone()));
            }
            if producer.is_closed() {
                return Err(SfuError::ProducerNotFound(producer_id));
            }
        }

        let notified = self.room.broadcast_except(
            peer_id,
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                kind,
            },
        );
        peer.advance(SessionState::Producing);

        info!(
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            notified,
            "Producer created"
        );
        Ok(producer_id)
    }

    async fn start_bridge(&self, producer: &Arc<dyn Producer>) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        match bridge.start(producer).await {
            Ok(Some(info)) => {
                debug!(producer_id = %info.producer_id, port = info.port, "Producer bridged to HLS");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(producer_id = %producer.id(), error = %e, "Failed to start HLS bridge");
            }
        }
    }

    /// Create a paused consumer of any producer in the room
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
    ) -> Result<ConsumerInfo> {
        let peer = self.peer(peer_id)?;
        let transport = peer
            .transport(TransportRole::Recv, transport_id)
            .ok_or_else(|| SfuError::ReceiveTransportNotFound(transport_id.clone()))?;

        if self.room.find_producer(producer_id).is_none() {
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }

        let consumer = transport
            .consume(producer_id, &self.engine.rtp_capabilities(), true)
            .await
            .map_err(|e| match e {
                EngineError::UnknownProducer(id) => SfuError::ProducerNotFound(id),
                other => other.into(),
            })?;

        if let Err(e) = peer.insert_consumer(Arc::clone(&consumer), transport_id.clone()) {
            consumer.close();
            return Err(e);
        }
        // The producer may have gone away while the engine was busy
        if consumer.is_closed() {
            peer.remove_consumer(consumer.id());
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }

        peer.advance(SessionState::Consuming);
        debug!(
            peer_id = %peer_id,
            consumer_id = %consumer.id(),
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok(ConsumerInfo {
            id: consumer.id().clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        let peer = self.peer(peer_id)?;
        let consumer = peer
            .consumer(consumer_id)
            .filter(|c| !c.is_closed())
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;

        consumer.resume().await.map_err(|e| match e {
            EngineError::ConsumerClosed(id) => SfuError::ConsumerNotFound(id),
            other => other.into(),
        })?;

        debug!(peer_id = %peer_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Run one request and build its reply
    pub async fn handle_message(
        self: &Arc<Self>,
        peer_id: &PeerId,
        message: ClientMessage,
    ) -> Result<ServerMessage> {
        let reply = match message {
            ClientMessage::GetRouterCapabilities => ServerMessage::RouterCapabilities {
                rtp_capabilities: self.router_capabilities(peer_id)?,
            },
            ClientMessage::CreateTransport { direction } => {
                self.create_transport(peer_id, direction).await?.into()
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(peer_id, &transport_id, dtls_parameters)
                    .await?;
                ServerMessage::TransportConnected { transport_id }
            }
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => ServerMessage::ProducerCreated {
                id: self
                    .produce(peer_id, &transport_id, kind, rtp_parameters)
                    .await?,
            },
            ClientMessage::Consume {
                transport_id,
                producer_id,
            } => self.consume(peer_id, &transport_id, &producer_id).await?.into(),
            ClientMessage::ResumeConsumer { consumer_id } => {
                self.resume_consumer(peer_id, &consumer_id).await?;
                ServerMessage::ConsumerResumed { consumer_id }
            }
        };
        Ok(reply)
    }

    /// Handle a request and queue the reply, or an `error` message, for the caller
    pub async fn dispatch(self: &Arc<Self>, peer_id: &PeerId, message: ClientMessage) {
        let request = message.type_name();
        let reply = match self.handle_message(peer_id, message).await {
            Ok(reply) => reply,
            Err(e) => {
                self.log_request_error(peer_id, request, &e);
                ServerMessage::error(REQUEST_FAILED)
            }
        };

        if let Some(peer) = self.room.get(peer_id) {
            peer.send(reply);
        }
    }

    /// Parse and dispatch one text frame
    pub async fn dispatch_text(self: &Arc<Self>, peer_id: &PeerId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.dispatch(peer_id, message).await,
            Err(e) => {
                self.log_request_error(peer_id, "unknown", &e);
                if let Some(peer) = self.room.get(peer_id) {
                    peer.send(ServerMessage::error(REQUEST_FAILED));
                }
            }
        }
    }

    fn log_request_error(&self, peer_id: &PeerId, request: &str, error: &SfuError) {
        match error.kind() {
            ErrorKind::NotFound => {
                debug!(peer_id = %peer_id, request, error = %error, "Request failed");
            }
            ErrorKind::Protocol => {
                warn!(peer_id = %peer_id, request, error = %error, "Rejected malformed message");
            }
            _ => {
                warn!(peer_id = %peer_id, request, error = %error, "Request failed");
            }
        }
    }

    /// Remove a peer and everything it owns. Safe to call more than once.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        let Some(peer) = self.room.remove_peer(peer_id) else {
            return false;
        };
        let Some(released) = peer.close() else {
            return false;
        };

        let stats = peer.get_stats();
        info!(
            peer_id = %peer_id,
            producers = released.producers.len(),
            consumers = released.consumers.len(),
            messages_sent = stats.messages_sent,
            messages_dropped = stats.messages_dropped,
            remaining_peers = self.room.peer_count(),
            "Peer disconnected"
        );

        self.release(released);
        true
    }

    /// Close detached engine objects. Producers take their bridge entry and
    /// every consumer of them in other peers along.
    fn release(&self, released: ReleasedResources) {
        for consumer in released.consumers {
            consumer.close();
        }
        for producer in released.producers {
            self.release_producer(&producer);
        }
        for transport in released.transports {
            transport.close();
        }
    }

    fn release_producer(&self, producer: &Arc<dyn Producer>) {
        if let Some(bridge) = &self.bridge {
            bridge.teardown(producer.id());
        }
        producer.close();

        for peer in self.room.peers() {
            for consumer in peer.remove_consumers_of(producer.id()) {
                consumer.close();
            }
        }
    }

    /// Disconnect every peer and stop all bridges
    pub fn close_all(&self) -> usize {
        let closed = self
            .room
            .peer_ids()
            .iter()
            .filter(|id| self.disconnect(id))
            .count();
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        info!(peers = closed, "SFU Manager closed");
        closed
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let room = self.room.get_stats();
        ManagerStats {
            peers: room.peer_count,
            transports: room.transports,
            audio_producers: room.audio_producers,
            video_producers: room.video_producers,
            consumers: room.consumers,
            active_bridges: self.bridge.as_ref().map_or(0, |b| b.entry_count()),
        }
    }
}
