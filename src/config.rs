use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default packet buffer capacity. Leaves headroom for IP + UDP headers
/// within a 1500 byte MTU.
pub const DEFAULT_PACKET_SIZE: usize = 1472;

/// Default number of packet buffers per pool block.
pub const DEFAULT_BLOCK_CAPACITY: usize = 64;

/// Tunables for a node and its connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Capacity of every pool buffer; equal to the on-wire packet size.
    pub packet_size: usize,
    /// Buffers per pool block.
    pub block_capacity: usize,
    /// Milliseconds an initiator waits for CHANNEL_ACKNOWLEDGE.
    pub new_timeout_ms: u64,
    /// Milliseconds an established channel may stay idle.
    pub channel_timeout_ms: u64,
    /// Checksum failures tolerated per sender peer before a filter is requested.
    pub peer_failure_limit: u32,
    /// Checksum failures tolerated per transport address before a filter is requested.
    pub transport_failure_limit: u32,
    /// Capability bits the local node announces when finalizing a channel.
    pub capabilities: u16,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            packet_size: DEFAULT_PACKET_SIZE,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            new_timeout_ms: 200,
            channel_timeout_ms: 60_000,
            peer_failure_limit: 3,
            transport_failure_limit: 3,
            capabilities: 0,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("Error loading node configuration file")
    }

    #[inline]
    pub fn new_timeout(&self) -> Duration {
        Duration::from_millis(self.new_timeout_ms)
    }

    #[inline]
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }
}
