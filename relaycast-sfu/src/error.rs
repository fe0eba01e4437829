use thiserror::Error;

use crate::engine::EngineError;
use crate::types::{ConsumerId, PeerId, ProducerId, TransportId};

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Send transport not found: {0}")]
    SendTransportNotFound(TransportId),

    #[error("Receive transport not found: {0}")]
    ReceiveTransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Media engine allocation failed: {0}")]
    AllocationFailed(#[from] EngineError),

    #[error("External tool unavailable: {tool}: {reason}")]
    ExternalToolUnavailable { tool: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HLS bridge error: {0}")]
    Bridge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used for logging and client replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AllocationFailed,
    ExternalToolUnavailable,
    Protocol,
    Internal,
}

impl SfuError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PeerNotFound(_)
            | Self::TransportNotFound(_)
            | Self::SendTransportNotFound(_)
            | Self::ReceiveTransportNotFound(_)
            | Self::ProducerNotFound(_)
            | Self::ConsumerNotFound(_) => ErrorKind::NotFound,
            Self::AllocationFailed(_) => ErrorKind::AllocationFailed,
            Self::ExternalToolUnavailable { .. } => ErrorKind::ExternalToolUnavailable,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Bridge(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
