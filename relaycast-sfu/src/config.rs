//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Delay before a new peer is told about producers that already exist (ms)
    pub catch_up_delay_ms: u64,
    /// Capacity of each peer's outbound message queue
    pub peer_channel_capacity: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            catch_up_delay_ms: 1000,
            peer_channel_capacity: 256,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn catch_up_delay(&self) -> Duration {
        Duration::from_millis(self.catch_up_delay_ms)
    }
}
