//! SFU Peer management
//!
//! This module handles:
//! - Peer session state and lifecycle
//! - The peer's transport, producer and consumer registries
//! - Outbound control messages with a bounded queue
//! - Peer statistics tracking
//!
//! All registry mutations go through one mutex per peer. The lock is never
//! held across an `.await`; once a peer is closed every insert is refused so
//! a handler that was suspended in the engine cannot resurrect its entries.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{Consumer, Producer, WebRtcTransport};
use crate::error::{Result, SfuError};
use crate::protocol::ServerMessage;
use crate::transport::TransportRegistry;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId, TransportRole};

/// Where a peer is in the signaling handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    CapabilitiesSent,
    TransportsPending,
    TransportsReady,
    Producing,
    Consuming,
    Closed,
}

impl SessionState {
    const fn rank(self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::CapabilitiesSent => 1,
            Self::TransportsPending => 2,
            Self::TransportsReady => 3,
            Self::Producing | Self::Consuming => 4,
            Self::Closed => 5,
        }
    }
}

struct ProducerEntry {
    producer: Arc<dyn Producer>,
    transport_id: TransportId,
}

struct ConsumerEntry {
    consumer: Arc<dyn Consumer>,
    transport_id: TransportId,
}

struct PeerInner {
    state: SessionState,
    transports: TransportRegistry,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

/// Engine objects detached from a peer; the caller closes them
#[derive(Default)]
pub struct ReleasedResources {
    pub transports: Vec<Arc<dyn WebRtcTransport>>,
    pub producers: Vec<Arc<dyn Producer>>,
    pub consumers: Vec<Arc<dyn Consumer>>,
}

/// SFU Peer - one connected participant
pub struct Peer {
    /// Peer ID
    pub id: PeerId,

    /// Outbound control messages, drained by the connection's writer task
    sender: mpsc::Sender<ServerMessage>,

    inner: Mutex<PeerInner>,

    stats: RwLock<PeerStats>,
}

impl Peer {
    #[must_use]
    pub fn new(id: PeerId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            sender,
            inner: Mutex::new(PeerInner {
                state: SessionState::Connected,
                transports: TransportRegistry::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            }),
            stats: RwLock::new(PeerStats::default()),
        }
    }

    /// Queue a message for this peer without waiting.
    /// Returns false if the queue is full (slow client) or closed.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.stats.write().messages_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.stats.write().messages_dropped += 1;
                warn!(
                    peer_id = %self.id,
                    message = message.type_name(),
                    "Outbound queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.write().messages_dropped += 1;
                debug!(peer_id = %self.id, "Outbound queue closed");
                false
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Move forward in the handshake; never moves back and never leaves `Closed`
    pub fn advance(&self, next: SessionState) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.state;
        if current == SessionState::Closed
            || current == next
            || next.rank() < current.rank()
        {
            return false;
        }
        inner.state = next;
        drop(inner);

        debug!(peer_id = %self.id, from = ?current, to = ?next, "Session state changed");
        true
    }

    fn live(&self) -> Result<parking_lot::MutexGuard<'_, PeerInner>> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(SfuError::PeerNotFound(self.id.clone()));
        }
        Ok(inner)
    }

    /// Store a transport. If the role was taken, the old transport is
    /// detached together with everything created on it.
    pub fn insert_transport(
        &self,
        role: TransportRole,
        transport: Arc<dyn WebRtcTransport>,
    ) -> Result<Option<ReleasedResources>> {
        let mut inner = self.live()?;
        Ok(inner
            .transports
            .insert(role, transport)
            .map(|old| take_bound(&mut inner, old)))
    }

    #[must_use]
    pub fn find_transport(&self, id: &TransportId) -> Option<Arc<dyn WebRtcTransport>> {
        self.inner.lock().transports.find(id).map(|(_, t)| t)
    }

    #[must_use]
    pub fn transport(&self, role: TransportRole, id: &TransportId) -> Option<Arc<dyn WebRtcTransport>> {
        self.inner.lock().transports.matching(role, id)
    }

    #[must_use]
    pub fn transports_connected(&self) -> bool {
        self.inner.lock().transports.all_connected()
    }

    /// Remove a transport together with every producer and consumer created on it
    pub fn detach_transport(&self, id: &TransportId) -> Option<ReleasedResources> {
        let mut inner = self.inner.lock();
        let transport = inner.transports.remove(id)?;
        Some(take_bound(&mut inner, transport))
    }

    pub fn insert_producer(&self, producer: Arc<dyn Producer>, transport_id: TransportId) -> Result<()> {
        let mut inner = self.live()?;
        inner.producers.insert(
            producer.id().clone(),
            ProducerEntry {
                producer,
                transport_id,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn producer(&self, id: &ProducerId) -> Option<Arc<dyn Producer>> {
        self.inner
            .lock()
            .producers
            .get(id)
            .map(|e| Arc::clone(&e.producer))
    }

    /// Id and kind of every live producer, for new-producer notifications
    #[must_use]
    pub fn producer_summaries(&self) -> Vec<(ProducerId, MediaKind)> {
        self.inner
            .lock()
            .producers
            .values()
            .filter(|e| !e.producer.is_closed())
            .map(|e| (e.producer.id().clone(), e.producer.kind()))
            .collect()
    }

    pub fn insert_consumer(&self, consumer: Arc<dyn Consumer>, transport_id: TransportId) -> Result<()> {
        let mut inner = self.live()?;
        inner.consumers.insert(
            consumer.id().clone(),
            ConsumerEntry {
                consumer,
                transport_id,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.inner
            .lock()
            .consumers
            .get(id)
            .map(|e| Arc::clone(&e.consumer))
    }

    pub fn remove_consumer(&self, id: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.inner.lock().consumers.remove(id).map(|e| e.consumer)
    }

    /// Detach every consumer bound to `producer_id`
    pub fn remove_consumers_of(&self, producer_id: &ProducerId) -> Vec<Arc<dyn Consumer>> {
        let mut consumers = Vec::new();
        self.inner.lock().consumers.retain(|_, e| {
            if e.consumer.producer_id() == producer_id {
                consumers.push(Arc::clone(&e.consumer));
                false
            } else {
                true
            }
        });
        consumers
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.inner.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.inner.lock().transports.len()
    }

    /// Mark the peer closed and hand back everything it owned.
    /// Returns `None` if it was already closed.
    pub fn close(&self) -> Option<ReleasedResources> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return None;
        }
        inner.state = SessionState::Closed;

        Some(ReleasedResources {
            transports: inner.transports.drain(),
            producers: inner.producers.drain().map(|(_, e)| e.producer).collect(),
            consumers: inner.consumers.drain().map(|(_, e)| e.consumer).collect(),
        })
    }

    /// Get peer statistics
    #[must_use]
    pub fn get_stats(&self) -> PeerStats {
        let mut stats = self.stats.read().clone();
        let inner = self.inner.lock();
        stats.producers = inner.producers.len();
        stats.consumers = inner.consumers.len();
        stats
    }
}

/// Pull the producers and consumers bound to `transport` out of the registries
fn take_bound(inner: &mut PeerInner, transport: Arc<dyn WebRtcTransport>) -> ReleasedResources {
    let id = transport.id().clone();
    let producer_ids: Vec<_> = inner
        .producers
        .iter()
        .filter(|(_, e)| e.transport_id == id)
        .map(|(pid, _)| pid.clone())
        .collect();
    let consumer_ids: Vec<_> = inner
        .consumers
        .iter()
        .filter(|(_, e)| e.transport_id == id)
        .map(|(cid, _)| cid.clone())
        .collect();

    ReleasedResources {
        producers: producer_ids
            .iter()
            .filter_map(|pid| inner.producers.remove(pid))
            .map(|e| e.producer)
            .collect(),
        consumers: consumer_ids
            .iter()
            .filter_map(|cid| inner.consumers.remove(cid))
            .map(|e| e.consumer)
            .collect(),
        transports: vec![transport],
    }
}

/// Peer statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerStats {
    /// Control messages queued for this peer
    pub messages_sent: u64,

    /// Control messages dropped because the queue was full or closed
    pub messages_dropped: u64,

    pub producers: usize,

    pub consumers: usize,
}
