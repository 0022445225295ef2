use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;

/// Fetch priority of a single piece. Ordered from "don't fetch" to "fetch right now".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PiecePriority {
    #[default]
    None,
    /// Fetched in sequential order behind anything boosted.
    Normal,
    /// Inside a reader's readahead window.
    Readahead,
    /// Directly after the piece a reader is blocked on.
    Next,
    /// Fetched ahead of sequential order.
    Immediate,
}

/// One file inside a transfer's piece space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub length: u64,
    /// Byte offset of the file's first byte within the transfer.
    pub offset: u64,
}

/// Metadata resolved for a transfer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
}

impl TransferInfo {
    /// Files in metadata order.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn num_pieces(&self) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(self.piece_length) as u32
    }
}

/// Point-in-time progress counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Cumulative payload bytes that passed verification.
    pub bytes_downloaded_useful: u64,
    pub active_peers: u32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unknown descriptor: {0}")]
    UnknownDescriptor(String),

    #[error("transfer detached")]
    Detached,

    #[error("metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// The engine gave up on the transfer.
    #[error("transfer failed: {0}")]
    Failed(String),

    #[error("piece {0} not downloaded yet")]
    PieceNotReady(u32),

    #[error("range [{offset}, {end}) outside transfer of {total} bytes")]
    OutOfBounds { offset: u64, end: u64, total: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The bulk-transfer engine: turns a descriptor into a transfer handle.
pub trait TransferEngine: Send + Sync {
    /// Register the descriptor and return its handle without waiting for metadata.
    fn add(&self, descriptor: &str) -> Result<Arc<dyn Transfer>, EngineError>;
}

/// Capabilities the streaming core needs from one active transfer.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Wait until the transfer's metadata is known.
    async fn resolve(&self) -> Result<TransferInfo, EngineError>;

    fn set_piece_priority(&self, index: u32, priority: PiecePriority);

    fn piece_complete(&self, index: u32) -> bool;

    /// Read `len` bytes at an absolute transfer offset. Only valid over completed pieces.
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, EngineError>;

    /// Counter bumped every time a piece completes.
    fn completions(&self) -> watch::Receiver<u64>;

    fn stats(&self) -> TransferStats;

    /// Set once the engine gives up on the transfer.
    fn failure(&self) -> Option<String> {
        None
    }

    /// Release every resource tied to this transfer.
    fn detach(&self);
}
