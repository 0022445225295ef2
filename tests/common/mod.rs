// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use swarm_stream::transfer::memory::MemorySwarm;
use swarm_stream::StreamConfig;

pub const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=demo";
pub const PIECE_LEN: u64 = 1024;
pub const NFO_LEN: usize = 100;
pub const MOVIE_LEN: usize = 64 * 1024;

/// Generate deterministic test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Small sidecar file followed by the movie, so the movie starts mid-piece.
pub fn demo_swarm() -> MemorySwarm {
    MemorySwarm::new("demo", PIECE_LEN)
        .with_file("demo/info.nfo", vec![b'x'; NFO_LEN])
        .with_file("demo/movie.mp4", content(MOVIE_LEN))
}

/// Ephemeral port, fast sampling, short timeouts.
pub fn test_config() -> StreamConfig {
    StreamConfig {
        port: 0,
        stats_interval_ms: 10,
        read_stall_timeout_ms: 5_000,
        shutdown_grace_secs: 1,
        ..StreamConfig::default()
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async flavour of [`wait_until`] for checks that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
