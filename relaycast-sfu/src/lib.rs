//! Relaycast SFU (Selective Forwarding Unit)
//!
//! Session orchestration for a single-room WebRTC SFU. Participants exchange
//! JSON signaling messages over a control channel; the SFU allocates engine
//! transports for them, registers their producers, announces those producers
//! to everyone else and creates consumers on request. Every video producer is
//! additionally bridged into an HLS transcoding pipeline whose lifetime is
//! tied to the producer.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: Handles every signaling request and owns the room
//! - **`SfuRoom`**: The set of connected peers
//! - **`Peer`**: One participant with its transport, producer and consumer registries
//! - **`HlsBridge`**: Relay transports and transcoder processes for video producers
//! - **`MediaEngine`**: The boundary to whatever actually moves the media
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaycast_sfu::{LoopbackEngine, SfuConfig, SfuManager};
//!
//! let manager = SfuManager::new(SfuConfig::default(), Arc::new(LoopbackEngine::default()), None);
//! let (peer, mut outbound) = manager.connect();
//! manager.dispatch_text(&peer.id, r#"{"type":"get-router-capabilities"}"#).await;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hls;
pub mod manager;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod transport;
pub mod types;

pub use config::SfuConfig;
pub use engine::{LoopbackConfig, LoopbackEngine, MediaEngine};
pub use error::{ErrorKind, Result, SfuError};
pub use hls::{BridgeConfig, BridgeInfo, EncodingPreset, FfmpegLauncher, HlsBridge};
pub use manager::{ConsumerInfo, ManagerStats, SfuManager, TransportInfo};
pub use peer::{Peer, PeerStats, SessionState};
pub use protocol::{ClientMessage, ServerMessage};
pub use room::{RoomStats, SfuRoom};
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId, TransportRole};
