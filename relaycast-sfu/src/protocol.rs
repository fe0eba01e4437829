//! Signaling messages exchanged over the control channel
//!
//! Both directions are JSON objects whose `type` field selects the variant.
//! Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::engine::{DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters};
use crate::error::SfuError;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId, TransportRole};

/// Client -> server requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    GetRouterCapabilities,
    CreateTransport {
        direction: TransportRole,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
}

impl ClientMessage {
    /// Parse one text frame; unknown types and malformed bodies are protocol errors
    pub fn parse(text: &str) -> Result<Self, SfuError> {
        serde_json::from_str(text).map_err(|e| SfuError::Protocol(e.to_string()))
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::GetRouterCapabilities => "get-router-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
        }
    }
}

/// Server -> client replies and notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RouterCapabilities { rtp_capabilities: RtpCapabilities },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        direction: TransportRole,
        id: TransportId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: TransportId },
    ProducerCreated { id: ProducerId },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::RouterCapabilities { .. } => "router-capabilities",
            Self::TransportCreated { .. } => "transport-created",
            Self::TransportConnected { .. } => "transport-connected",
            Self::ProducerCreated { .. } => "producer-created",
            Self::NewProducer { .. } => "new-producer",
            Self::ConsumerCreated { .. } => "consumer-created",
            Self::ConsumerResumed { .. } => "consumer-resumed",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
