// Relaycast API Library
//
// HTTP surface of the relay: WebSocket signaling, HLS output and health

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState, Features};
