//! Per-peer transport registry, one slot per role

use std::sync::Arc;

use crate::engine::WebRtcTransport;
use crate::types::{TransportId, TransportRole};

#[derive(Default)]
pub struct TransportRegistry {
    send: Option<Arc<dyn WebRtcTransport>>,
    recv: Option<Arc<dyn WebRtcTransport>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, role: TransportRole) -> &Option<Arc<dyn WebRtcTransport>> {
        match role {
            TransportRole::Send => &self.send,
            TransportRole::Recv => &self.recv,
        }
    }

    /// Store a transport under `role`, returning the one it replaces
    pub fn insert(
        &mut self,
        role: TransportRole,
        transport: Arc<dyn WebRtcTransport>,
    ) -> Option<Arc<dyn WebRtcTransport>> {
        let slot = match role {
            TransportRole::Send => &mut self.send,
            TransportRole::Recv => &mut self.recv,
        };
        slot.replace(transport)
    }

    /// Transport stored under `role`, only if its id matches
    #[must_use]
    pub fn matching(&self, role: TransportRole, id: &TransportId) -> Option<Arc<dyn WebRtcTransport>> {
        self.slot(role).as_ref().filter(|t| t.id() == id).cloned()
    }

    /// Look `id` up across both roles
    #[must_use]
    pub fn find(&self, id: &TransportId) -> Option<(TransportRole, Arc<dyn WebRtcTransport>)> {
        [TransportRole::Send, TransportRole::Recv]
            .into_iter()
            .find_map(|role| self.matching(role, id).map(|t| (role, t)))
    }

    /// Remove the transport with `id`, whichever role holds it
    pub fn remove(&mut self, id: &TransportId) -> Option<Arc<dyn WebRtcTransport>> {
        let (role, _) = self.find(id)?;
        match role {
            TransportRole::Send => self.send.take(),
            TransportRole::Recv => self.recv.take(),
        }
    }

    /// Both roles present and connected
    #[must_use]
    pub fn all_connected(&self) -> bool {
        [&self.send, &self.recv]
            .iter()
            .all(|slot| slot.as_ref().is_some_and(|t| t.is_connected()))
    }

    pub fn drain(&mut self) -> Vec<Arc<dyn WebRtcTransport>> {
        self.send.take().into_iter().chain(self.recv.take()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.send.is_some()) + usize::from(self.recv.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
