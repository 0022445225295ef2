// Periodic progress sampling: turns engine counters into session status updates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::session::SessionManager;
use crate::transfer::Transfer;

const MB: f64 = 1024.0 * 1024.0;

/// One reading of the engine counters, relative to the selected file.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    pub downloaded_bytes: u64,
    /// 0-100, clamped.
    pub progress: f64,
    pub download_mb: f64,
    pub speed_kbs: f64,
    pub peers: u32,
    /// Unrecoverable engine failure, if one was reported.
    pub failure: Option<String>,
}

/// Percent of `length` covered by `downloaded`, never above 100.
pub fn progress_percent(downloaded: u64, length: u64) -> f64 {
    if length == 0 {
        return 100.0;
    }
    (downloaded as f64 / length as f64 * 100.0).min(100.0)
}

struct LastSample {
    at: Instant,
    downloaded_bytes: u64,
}

/// Samples one transfer for one session.
pub struct StatsCollector {
    transfer: Arc<dyn Transfer>,
    file_length: u64,
    last: Option<LastSample>,
}

impl StatsCollector {
    pub fn new(transfer: Arc<dyn Transfer>, file_length: u64) -> Self {
        Self {
            transfer,
            file_length,
            last: None,
        }
    }

    /// Read the engine counters. Speed is the byte delta since the previous sample over the
    /// elapsed time; the first sample reports zero speed.
    pub fn sample(&mut self) -> StatsSample {
        let now = Instant::now();
        let stats = self.transfer.stats();
        let downloaded = stats.bytes_downloaded_useful;

        let speed_kbs = match &self.last {
            Some(last) => {
                let elapsed = now.duration_since(last.at).as_secs_f64();
                if elapsed > 0.0 {
                    downloaded.saturating_sub(last.downloaded_bytes) as f64 / 1024.0 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some(LastSample {
            at: now,
            downloaded_bytes: downloaded,
        });

        StatsSample {
            downloaded_bytes: downloaded,
            progress: progress_percent(downloaded, self.file_length),
            download_mb: downloaded as f64 / MB,
            speed_kbs,
            peers: stats.active_peers,
            failure: self.transfer.failure(),
        }
    }

    /// Sample every `interval` until the session `generation` is superseded or `cancel` fires.
    /// The first sample is taken immediately.
    pub(crate) fn spawn(
        mut self,
        manager: SessionManager,
        generation: u64,
        cancel: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let sample = self.sample();
                debug!(
                    "session {}: {:.1}% | {:.1} MB | {:.0} KB/s | {} peers",
                    generation, sample.progress, sample.download_mb, sample.speed_kbs, sample.peers
                );
                if !manager.record_sample(generation, &sample) {
                    break;
                }
            }
            debug!("stats collector for session {} stopped", generation);
        })
    }
}
