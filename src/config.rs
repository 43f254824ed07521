//! Centralized configuration for spindrift.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all spindrift components.
///
/// Groups related settings into logical sections with sensible defaults
/// for streaming workloads.
#[derive(Debug, Clone, Default)]
pub struct SpindriftConfig {
    /// Read-plane settings
    pub input: InputConfig,
    /// Per-torrent session settings
    pub session: SessionConfig,
    /// Settings forwarded to the underlying engine
    pub engine: EngineConfig,
}

/// Buffered input configuration.
#[derive(Debug, Clone)]
pub struct InputConfig {
    /// Cap on how many bytes a single buffer fill may read ahead of the
    /// cursor; the same cap applies to the backward direction.
    pub buffer_size: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            buffer_size: 65536, // 64 KiB
        }
    }
}

/// Per-torrent session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline passed to the engine when a read stalls on a piece.
    /// Zero means "most urgent".
    pub piece_deadline: Duration,
    /// Capacity of the stats broadcast channel; slow subscribers lose the
    /// oldest updates once this many are queued.
    pub stats_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            piece_deadline: Duration::ZERO,
            stats_capacity: 64,
        }
    }
}

/// Engine tuning forwarded verbatim through `apply_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// Download bandwidth limit in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Upload bandwidth limit in bytes per second (None = unlimited)
    pub upload_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peer_connections: 50,
            download_limit: None,
            upload_limit: None,
        }
    }
}
