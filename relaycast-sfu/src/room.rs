//! SFU Room management

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::Producer;
use crate::peer::Peer;
use crate::protocol::ServerMessage;
use crate::types::{MediaKind, PeerId, ProducerId};

/// The set of currently connected peers
#[derive(Default)]
pub struct SfuRoom {
    peers: DashMap<PeerId, Arc<Peer>>,
}

impl SfuRoom {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.id.clone(), peer);
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(peer_id).map(|(_, peer)| peer)
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|p| Arc::clone(p.value()))
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of all peers; no map shard stays locked after this returns
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| Arc::clone(p.value())).collect()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.key().clone()).collect()
    }

    /// Every peer except `peer_id`
    #[must_use]
    pub fn others(&self, peer_id: &PeerId) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|p| p.key() != peer_id)
            .map(|p| Arc::clone(p.value()))
            .collect()
    }

    /// Find a live producer anywhere in the room, with its owner
    #[must_use]
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<(Arc<Peer>, Arc<dyn Producer>)> {
        self.peers().into_iter().find_map(|peer| {
            peer.producer(producer_id)
                .filter(|p| !p.is_closed())
                .map(|producer| (peer, producer))
        })
    }

    /// Queue `message` for every peer except `except`; returns how many accepted it
    pub fn broadcast_except(&self, except: &PeerId, message: &ServerMessage) -> usize {
        self.others(except)
            .into_iter()
            .filter(|peer| !peer.is_closed())
            .filter(|peer| peer.send(message.clone()))
            .count()
    }

    #[must_use]
    pub fn get_stats(&self) -> RoomStats {
        let mut stats = RoomStats::default();
        for peer in self.peers() {
            stats.peer_count += 1;
            stats.transports += peer.transport_count();
            stats.consumers += peer.consumer_count();
            for (_, kind) in peer.producer_summaries() {
                match kind {
                    MediaKind::Audio => stats.audio_producers += 1,
                    MediaKind::Video => stats.video_producers += 1,
                }
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub peer_count: usize,
    pub transports: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub consumers: usize,
}
