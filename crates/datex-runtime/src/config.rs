//! Runtime configuration and counters

use std::time::Duration;

use datex_pointer::RegistryConfig;
use datex_wire::{DEFAULT_TTL, MAX_BLOCK_SIZE};

/// Runtime configuration
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Outbound requests are rejected after this long without an answer
    pub request_timeout: Duration,
    pub default_ttl: u8,
    pub default_priority: u8,
    /// Maximum serialized block size, header included
    pub max_block_size: usize,
    /// Relay flood blocks to other endpoints
    pub flood_relay: bool,
    /// Append a trace hop to errors passing through this endpoint
    pub trace_errors: bool,
    /// Blocks kept while no send hook is installed
    pub outbound_buffer_limit: usize,
    /// Out-of-order blocks kept per scope
    pub max_parked_blocks: usize,
    /// Sign every outbound block
    pub sign_blocks: bool,
    /// Interval of the spawned tick loop
    pub tick_interval: Duration,
    pub registry: RegistryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let request_timeout = Duration::from_secs(5);
        RuntimeConfig {
            request_timeout,
            default_ttl: DEFAULT_TTL,
            default_priority: 0,
            max_block_size: MAX_BLOCK_SIZE,
            flood_relay: true,
            trace_errors: false,
            outbound_buffer_limit: 1000,
            max_parked_blocks: 256,
            sign_blocks: false,
            tick_interval: Duration::from_millis(100),
            registry: RegistryConfig {
                gc_timeout: request_timeout,
                ..RegistryConfig::default()
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub ticks: u64,
    pub blocks_in: u64,
    pub blocks_out: u64,
    pub blocks_relayed: u64,
    pub blocks_dropped: u64,
    pub scopes_completed: u64,
    pub scopes_failed: u64,
    pub requests_sent: u64,
    pub requests_timed_out: u64,
    pub pointers_collected: u64,
    pub last_tick_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_timeout_follows_request_timeout() {
        let config = RuntimeConfig::default();
        assert_eq!(config.registry.gc_timeout, config.request_timeout);
        assert_eq!(config.default_ttl, 64);
        assert_eq!(config.max_block_size, 65535);
    }
}
