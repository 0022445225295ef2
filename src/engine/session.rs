// Session lifecycle state machine: owns the single active transfer, its selected file and the
// background tasks bound to it.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::file::FileDescriptor;
use super::reader::FileReader;
use super::scheduler::PieceScheduler;
use super::selector::select_file;
use super::stats::{StatsCollector, StatsSample};
use super::status::{SessionState, StatusSnapshot};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::transfer::{EngineError, Transfer, TransferEngine};

#[derive(Clone)]
struct ActiveFile {
    file: FileDescriptor,
    piece_length: u64,
    scheduler: Arc<PieceScheduler>,
}

struct Session {
    /// Bumped on every start/stop; background tasks carry the value they were spawned for.
    generation: u64,
    status: StatusSnapshot,
    transfer: Option<Arc<dyn Transfer>>,
    active: Option<ActiveFile>,
    primed: bool,
    cancel: CancellationToken,
}

struct Inner {
    engine: Arc<dyn TransferEngine>,
    config: StreamConfig,
    stream_url: String,
    session: RwLock<Session>,
}

/// Handle to the single session. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

fn transition(status: &mut StatusSnapshot, next: SessionState) -> bool {
    if !status.state.can_transition(next) {
        warn!(
            "refusing session transition {:?} -> {:?}",
            status.state, next
        );
        return false;
    }
    status.state = next;
    true
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        config: StreamConfig,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                stream_url: stream_url.into(),
                session: RwLock::new(Session {
                    generation: 0,
                    status: StatusSnapshot::default(),
                    transfer: None,
                    active: None,
                    primed: false,
                    cancel: CancellationToken::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn stream_url(&self) -> &str {
        &self.inner.stream_url
    }

    /// Replace whatever session exists with a new one for `descriptor`.
    ///
    /// Returns as soon as the previous session is torn down and the new one is `loading`.
    /// Resolution, file selection and priming run in the background; their failures only show
    /// up in [`snapshot`](Self::snapshot).
    pub fn start(&self, descriptor: &str) -> Result<(), StreamError> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(StreamError::BadRequest("descriptor required".to_string()));
        }

        let (generation, cancel) = self.teardown(SessionState::Loading);
        info!("session {} loading {}", generation, descriptor);

        let manager = self.clone();
        let descriptor = descriptor.to_string();
        tokio::spawn(async move {
            manager.bootstrap(generation, descriptor, cancel).await;
        });
        Ok(())
    }

    /// Detach the active transfer and go back to idle. No-op when already idle.
    pub fn stop(&self) {
        self.teardown(SessionState::Idle);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.session.read().status.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.read().status.state
    }

    pub fn generation(&self) -> u64 {
        self.inner.session.read().generation
    }

    pub fn active_file(&self) -> Option<FileDescriptor> {
        self.inner
            .session
            .read()
            .active
            .as_ref()
            .map(|a| a.file.clone())
    }

    /// Open a reader over the selected file. Its reads abort when the session ends.
    pub fn open_reader(&self) -> Result<FileReader, StreamError> {
        let (transfer, active, generation, cancel) = {
            let session = self.inner.session.read();
            match (&session.transfer, &session.active) {
                (Some(transfer), Some(active)) => (
                    transfer.clone(),
                    active.clone(),
                    session.generation,
                    session.cancel.child_token(),
                ),
                _ => return Err(StreamError::NoActiveSession),
            }
        };

        let mut reader = FileReader::open(
            transfer,
            active.scheduler,
            active.file,
            active.piece_length,
            generation,
            cancel,
            &self.inner.config,
        );
        reader.set_responsive();
        Ok(reader)
    }

    /// Invalidate the current session and reset status to `next`. The previous transfer is
    /// detached and its tasks cancelled before this returns.
    fn teardown(&self, next: SessionState) -> (u64, CancellationToken) {
        let (previous, generation, cancel) = {
            let mut session = self.inner.session.write();
            session.cancel.cancel();
            session.generation += 1;
            session.cancel = CancellationToken::new();
            session.active = None;
            session.primed = false;
            session.status = StatusSnapshot::with_state(next);
            (
                session.transfer.take(),
                session.generation,
                session.cancel.clone(),
            )
        };

        if let Some(transfer) = previous {
            transfer.detach();
            info!("session {} torn down, transfer detached", generation - 1);
        }
        (generation, cancel)
    }

    async fn bootstrap(self, generation: u64, descriptor: String, cancel: CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("session {} bootstrap cancelled", generation);
                return;
            }
            result = self.load(generation, &descriptor, &cancel) => result,
        };
        if let Err(e) = result {
            self.fail(generation, e);
        }
    }

    async fn load(
        &self,
        generation: u64,
        descriptor: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let transfer = self
            .inner
            .engine
            .add(descriptor)
            .map_err(|e| StreamError::Resolution(e.to_string()))?;
        if !self.attach(generation, &transfer) {
            transfer.detach();
            return Ok(());
        }

        info!("session {} waiting for metadata", generation);
        let info = transfer
            .resolve()
            .await
            .map_err(|e| StreamError::Resolution(e.to_string()))?;
        if info.piece_length == 0 {
            return Err(StreamError::Resolution(
                "metadata reports zero piece length".to_string(),
            ));
        }
        info!(
            "session {} got metadata for {}: {} files, {} pieces of {} bytes",
            generation,
            info.name,
            info.files().len(),
            info.num_pieces(),
            info.piece_length
        );

        let file = select_file(info.files())?;
        info!(
            "session {} selected {} ({} bytes at offset {})",
            generation, file.path, file.length, file.offset
        );

        let scheduler = Arc::new(PieceScheduler::new(
            transfer.clone(),
            &file,
            info.piece_length,
            &self.inner.config,
        ));
        let active = ActiveFile {
            file: file.clone(),
            piece_length: info.piece_length,
            scheduler: scheduler.clone(),
        };
        if !self.activate(generation, active) {
            return Ok(());
        }

        scheduler.prime();
        if !self.mark_primed(generation) {
            return Ok(());
        }

        StatsCollector::new(transfer, file.length).spawn(
            self.clone(),
            generation,
            cancel.clone(),
            self.inner.config.stats_interval(),
        );
        Ok(())
    }

    fn attach(&self, generation: u64, transfer: &Arc<dyn Transfer>) -> bool {
        let mut session = self.inner.session.write();
        if session.generation != generation {
            debug!("session {} superseded before attach", generation);
            return false;
        }
        session.transfer = Some(transfer.clone());
        true
    }

    fn activate(&self, generation: u64, active: ActiveFile) -> bool {
        let mut session = self.inner.session.write();
        if session.generation != generation {
            return false;
        }
        session.active = Some(active);
        true
    }

    fn mark_primed(&self, generation: u64) -> bool {
        let mut session = self.inner.session.write();
        if session.generation != generation {
            return false;
        }
        session.primed = true;
        true
    }

    /// Record a bootstrap or engine failure. The failed transfer is detached and the error
    /// stays until the next `start()` or `stop()`.
    fn fail(&self, generation: u64, err: StreamError) {
        let transfer = {
            let mut session = self.inner.session.write();
            if session.generation != generation {
                debug!("ignoring failure of superseded session {}: {}", generation, err);
                return;
            }
            session.cancel.cancel();
            session.active = None;
            session.primed = false;
            session.status = StatusSnapshot::failed(err.to_string());
            session.transfer.take()
        };

        error!("session {} failed: {}", generation, err);
        if let Some(transfer) = transfer {
            transfer.detach();
        }
    }

    /// Apply a stats sample taken for `generation`. Returns false once that session is gone,
    /// which tells the collector to stop.
    pub(crate) fn record_sample(&self, generation: u64, sample: &StatsSample) -> bool {
        if let Some(reason) = &sample.failure {
            self.fail(
                generation,
                StreamError::Engine(EngineError::Failed(reason.clone())),
            );
            return false;
        }

        let mut guard = self.inner.session.write();
        let session = &mut *guard;
        if session.generation != generation {
            return false;
        }
        let status = &mut session.status;
        if matches!(status.state, SessionState::Idle | SessionState::Error) {
            return false;
        }

        status.progress = status.progress.max(sample.progress);
        status.download_mb = sample.download_mb;
        status.speed_kbs = sample.speed_kbs;
        status.peers = sample.peers;

        if session.primed
            && status.state == SessionState::Loading
            && status.progress >= self.inner.config.ready_progress_percent
            && transition(status, SessionState::Ready)
        {
            status.stream_url = Some(self.inner.stream_url.clone());
            info!(
                "session {} ready at {} ({:.1}%)",
                generation, self.inner.stream_url, status.progress
            );
        }
        true
    }
}
