// In-process transfer engine: serves registered swarms from memory with a bitvec completion map.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{
    EngineError, FileEntry, PiecePriority, Transfer, TransferEngine, TransferInfo, TransferStats,
};

/// Content and layout of a swarm known to a [`MemoryEngine`].
#[derive(Debug, Clone)]
pub struct MemorySwarm {
    name: String,
    piece_length: u64,
    files: Vec<(String, Bytes)>,
    hold_metadata: bool,
}

impl MemorySwarm {
    pub fn new(name: impl Into<String>, piece_length: u64) -> Self {
        Self {
            name: name.into(),
            piece_length,
            files: Vec::new(),
            hold_metadata: false,
        }
    }

    /// Append a file; files are laid out back to back in insertion order.
    pub fn with_file(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push((path.into(), data.into()));
        self
    }

    /// Keep `resolve()` pending until [`MemoryTransfer::release_metadata`] is called.
    pub fn hold_metadata(mut self) -> Self {
        self.hold_metadata = true;
        self
    }
}

/// Engine that resolves descriptors against swarms registered up front.
#[derive(Default)]
pub struct MemoryEngine {
    swarms: RwLock<HashMap<String, MemorySwarm>>,
    transfers: Mutex<HashMap<String, Arc<MemoryTransfer>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: impl Into<String>, swarm: MemorySwarm) {
        self.swarms.write().insert(descriptor.into(), swarm);
    }

    /// The most recent transfer created for `descriptor`.
    pub fn transfer(&self, descriptor: &str) -> Option<Arc<MemoryTransfer>> {
        self.transfers.lock().get(descriptor).cloned()
    }
}

impl TransferEngine for MemoryEngine {
    fn add(&self, descriptor: &str) -> Result<Arc<dyn Transfer>, EngineError> {
        let swarm = self
            .swarms
            .read()
            .get(descriptor)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDescriptor(descriptor.to_string()))?;
        if swarm.piece_length == 0 {
            return Err(EngineError::InvalidDescriptor(format!(
                "{} has zero piece length",
                descriptor
            )));
        }

        let transfer = Arc::new(MemoryTransfer::new(swarm));
        self.transfers
            .lock()
            .insert(descriptor.to_string(), transfer.clone());
        debug!("memory engine added {}", descriptor);
        Ok(transfer)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum MetadataState {
    Pending,
    Ready,
    Failed(String),
}

pub struct MemoryTransfer {
    info: TransferInfo,
    data: Bytes,
    completed: RwLock<BitVec>,
    priorities: Mutex<Vec<PiecePriority>>,
    completions: watch::Sender<u64>,
    metadata: watch::Sender<MetadataState>,
    downloaded: AtomicU64,
    peers: AtomicU32,
    failure: Mutex<Option<String>>,
    detached: CancellationToken,
}

impl MemoryTransfer {
    fn new(swarm: MemorySwarm) -> Self {
        let mut files = Vec::with_capacity(swarm.files.len());
        let mut data = BytesMut::new();
        for (path, content) in &swarm.files {
            files.push(FileEntry {
                path: path.clone(),
                length: content.len() as u64,
                offset: data.len() as u64,
            });
            data.extend_from_slice(content);
        }

        let info = TransferInfo {
            name: swarm.name,
            piece_length: swarm.piece_length,
            total_length: data.len() as u64,
            files,
        };
        let num_pieces = info.num_pieces() as usize;
        let initial = if swarm.hold_metadata {
            MetadataState::Pending
        } else {
            MetadataState::Ready
        };

        Self {
            info,
            data: data.freeze(),
            completed: RwLock::new(bitvec![0; num_pieces]),
            priorities: Mutex::new(vec![PiecePriority::None; num_pieces]),
            completions: watch::Sender::new(0),
            metadata: watch::Sender::new(initial),
            downloaded: AtomicU64::new(0),
            peers: AtomicU32::new(0),
            failure: Mutex::new(None),
            detached: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn num_pieces(&self) -> u32 {
        self.info.num_pieces()
    }

    /// Byte length of a piece. The last piece may be shorter.
    pub fn piece_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.info.piece_length;
        self.info
            .total_length
            .saturating_sub(start)
            .min(self.info.piece_length)
    }

    pub fn release_metadata(&self) {
        self.metadata.send_replace(MetadataState::Ready);
    }

    pub fn fail_metadata(&self, reason: impl Into<String>) {
        self.metadata.send_replace(MetadataState::Failed(reason.into()));
    }

    /// Mark the transfer as unrecoverable.
    pub fn fail(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    pub fn set_peers(&self, peers: u32) {
        self.peers.store(peers, Ordering::Relaxed);
    }

    pub fn priority(&self, index: u32) -> PiecePriority {
        self.priorities
            .lock()
            .get(index as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Mark a piece as downloaded and wake readers. Returns false if it already was.
    pub fn complete_piece(&self, index: u32) -> bool {
        if index >= self.num_pieces() {
            return false;
        }
        {
            let mut completed = self.completed.write();
            if completed[index as usize] {
                return false;
            }
            completed.set(index as usize, true);
        }
        self.downloaded
            .fetch_add(self.piece_len(index), Ordering::Relaxed);
        self.completions.send_modify(|count| *count += 1);
        true
    }

    /// Complete every piece overlapping the absolute byte range.
    pub fn complete_bytes(&self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let first = (range.start / self.info.piece_length) as u32;
        let last = ((range.end - 1) / self.info.piece_length) as u32;
        for index in first..=last.min(self.num_pieces().saturating_sub(1)) {
            self.complete_piece(index);
        }
    }

    pub fn complete_all(&self) {
        for index in 0..self.num_pieces() {
            self.complete_piece(index);
        }
    }

    /// Download the most urgent wanted piece: highest priority first, lowest index on ties.
    pub fn fetch_next(&self) -> Option<u32> {
        if self.is_detached() {
            return None;
        }
        let next = {
            let priorities = self.priorities.lock();
            let completed = self.completed.read();
            let mut best: Option<(u32, PiecePriority)> = None;
            for (index, priority) in priorities.iter().enumerate() {
                if *priority == PiecePriority::None || completed[index] {
                    continue;
                }
                if best.map_or(true, |(_, p)| *priority > p) {
                    best = Some((index as u32, *priority));
                }
            }
            best.map(|(index, _)| index)
        };
        if let Some(index) = next {
            self.complete_piece(index);
        }
        next
    }

    pub fn completed_count(&self) -> usize {
        self.completed.read().count_ones()
    }
}

#[async_trait]
impl Transfer for MemoryTransfer {
    async fn resolve(&self) -> Result<TransferInfo, EngineError> {
        let mut rx = self.metadata.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                MetadataState::Ready => return Ok(self.info.clone()),
                MetadataState::Failed(reason) => {
                    return Err(EngineError::MetadataUnavailable(reason))
                }
                MetadataState::Pending => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Detached);
                    }
                }
                _ = self.detached.cancelled() => return Err(EngineError::Detached),
            }
        }
    }

    fn set_piece_priority(&self, index: u32, priority: PiecePriority) {
        if self.is_detached() {
            return;
        }
        if let Some(slot) = self.priorities.lock().get_mut(index as usize) {
            *slot = priority;
        }
    }

    fn piece_complete(&self, index: u32) -> bool {
        let completed = self.completed.read();
        (index as usize) < completed.len() && completed[index as usize]
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, EngineError> {
        let end = offset + len as u64;
        if end > self.info.total_length {
            return Err(EngineError::OutOfBounds {
                offset,
                end,
                total: self.info.total_length,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        let first = (offset / self.info.piece_length) as u32;
        let last = ((end - 1) / self.info.piece_length) as u32;
        for index in first..=last {
            if !self.piece_complete(index) {
                return Err(EngineError::PieceNotReady(index));
            }
        }
        Ok(self.data.slice(offset as usize..end as usize))
    }

    fn completions(&self) -> watch::Receiver<u64> {
        self.completions.subscribe()
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            bytes_downloaded_useful: self.downloaded.load(Ordering::Relaxed),
            active_peers: self.peers.load(Ordering::Relaxed),
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn detach(&self) {
        if !self.detached.is_cancelled() {
            debug!("memory transfer {} detached", self.info.name);
        }
        self.detached.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swarm() -> MemorySwarm {
        MemorySwarm::new("demo", 4)
            .with_file("readme.txt", vec![1u8; 6])
            .with_file("movie.mkv", vec![2u8; 10])
    }

    #[test]
    fn test_layout_and_piece_len() {
        let engine = MemoryEngine::new();
        engine.register("magnet:?xt=demo", swarm());
        engine.add("magnet:?xt=demo").unwrap();
        let transfer = engine.transfer("magnet:?xt=demo").unwrap();

        let files = transfer.info().files();
        assert_eq!(files[1].offset, 6);
        assert_eq!(transfer.num_pieces(), 4);
        assert_eq!(transfer.piece_len(3), 4);
        assert_eq!(transfer.piece_len(0), 4);
    }

    #[test]
    fn test_unknown_descriptor() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.add("magnet:?xt=missing"),
            Err(EngineError::UnknownDescriptor(_))
        ));
    }

    #[test]
    fn test_read_requires_completed_pieces() {
        let engine = MemoryEngine::new();
        engine.register("d", swarm());
        engine.add("d").unwrap();
        let transfer = engine.transfer("d").unwrap();

        assert!(matches!(
            transfer.read_at(0, 4),
            Err(EngineError::PieceNotReady(0))
        ));
        transfer.complete_bytes(0..8);
        assert_eq!(transfer.read_at(2, 6).unwrap().len(), 6);
        assert!(matches!(
            transfer.read_at(6, 4),
            Err(EngineError::PieceNotReady(2))
        ));
        assert_eq!(transfer.stats().bytes_downloaded_useful, 8);
    }

    #[test]
    fn test_fetch_next_follows_priority() {
        let engine = MemoryEngine::new();
        engine.register("d", swarm());
        engine.add("d").unwrap();
        let transfer = engine.transfer("d").unwrap();

        assert_eq!(transfer.fetch_next(), None);
        assert_eq!(transfer.completed_count(), 0);
        transfer.set_piece_priority(1, PiecePriority::Normal);
        transfer.set_piece_priority(2, PiecePriority::Normal);
        transfer.set_piece_priority(3, PiecePriority::Immediate);

        assert_eq!(transfer.fetch_next(), Some(3));
        assert_eq!(transfer.fetch_next(), Some(1));
        assert_eq!(transfer.fetch_next(), Some(2));
        assert_eq!(transfer.fetch_next(), None);
        assert_eq!(transfer.completed_count(), 3);
    }

    #[tokio::test]
    async fn test_resolve_waits_for_metadata() {
        let engine = MemoryEngine::new();
        engine.register("d", swarm().hold_metadata());
        let handle = engine.add("d").unwrap();
        let transfer = engine.transfer("d").unwrap();

        let pending = tokio::spawn(async move { handle.resolve().await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        transfer.release_metadata();
        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.files().len(), 2);
    }

    #[tokio::test]
    async fn test_detach_aborts_resolve() {
        let engine = MemoryEngine::new();
        engine.register("d", swarm().hold_metadata());
        let handle = engine.add("d").unwrap();

        let waiter = handle.clone();
        let pending = tokio::spawn(async move { waiter.resolve().await });
        handle.detach();
        assert!(matches!(
            pending.await.unwrap(),
            Err(EngineError::Detached)
        ));
    }
}
