use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Default loopback port for the HTTP surface.
pub const DEFAULT_PORT: u16 = 8888;

/// Environment variable that overrides the listening port.
pub const PORT_ENV: &str = "SWARM_STREAM_PORT";

/// Forward window prioritized ahead of each reader's cursor (8 MB).
pub const READAHEAD_BYTES: u64 = 8 * 1024 * 1024;

/// Share of the file, from the playback position, fetched ahead of sequential order.
pub const HEAD_WINDOW_PERCENT: u64 = 5;

/// Share of the file, at its end, fetched ahead of sequential order.
pub const TAIL_WINDOW_PERCENT: u64 = 1;

/// Progress required before a primed session is reported as ready.
pub const READY_PROGRESS_PERCENT: f64 = 3.0;

/// Interval between two stats samples.
pub const STATS_INTERVAL_MS: u64 = 1000;

/// Minimum byte distance from the last served offset to treat a read as a seek (4 MB).
pub const SEEK_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;

/// Upper bound for a single body chunk written to the player (256 KB).
pub const STREAM_CHUNK_BYTES: u64 = 256 * 1024;

/// A blocked read gives up after this long without the piece arriving.
pub const READ_STALL_TIMEOUT_MS: u64 = 120_000;

/// In-flight responses get this long to finish once shutdown starts.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Extensions (lowercase, without dot) considered playable.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "webm", "m4v", "ts"];

/// Top-level configuration for the streaming service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Loopback port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Readahead window per reader, in bytes.
    pub readahead_bytes: u64,
    pub head_window_percent: u64,
    pub tail_window_percent: u64,
    /// Progress (0-100) at which a primed session flips to ready.
    pub ready_progress_percent: f64,
    pub stats_interval_ms: u64,
    pub seek_threshold_bytes: u64,
    pub stream_chunk_bytes: u64,
    pub read_stall_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            readahead_bytes: READAHEAD_BYTES,
            head_window_percent: HEAD_WINDOW_PERCENT,
            tail_window_percent: TAIL_WINDOW_PERCENT,
            ready_progress_percent: READY_PROGRESS_PERCENT,
            stats_interval_ms: STATS_INTERVAL_MS,
            seek_threshold_bytes: SEEK_THRESHOLD_BYTES,
            stream_chunk_bytes: STREAM_CHUNK_BYTES,
            read_stall_timeout_ms: READ_STALL_TIMEOUT_MS,
            shutdown_grace_secs: SHUTDOWN_GRACE_SECS,
        }
    }
}

impl StreamConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(PORT_ENV) {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(e) => warn!("ignoring {}={:?}: {}", PORT_ENV, raw, e),
            }
        }
        self
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    pub fn read_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.read_stall_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
