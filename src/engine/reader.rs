// Streaming reader: blocking, order-preserving byte access over a partially downloaded file.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::file::FileDescriptor;
use super::scheduler::PieceScheduler;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::transfer::{EngineError, PiecePriority, Transfer};

/// Reads one file of a transfer, waiting for pieces as needed and keeping a readahead window
/// boosted ahead of its cursor. On drop each boosted piece falls back to its scheduled tier,
/// or to the strongest boost another open reader still holds on it.
pub struct FileReader {
    transfer: Arc<dyn Transfer>,
    scheduler: Arc<PieceScheduler>,
    file: FileDescriptor,
    generation: u64,
    piece_length: u64,
    position: u64,
    readahead: u64,
    responsive: bool,
    boosted: Vec<(u32, PiecePriority)>,
    /// End of this reader's previous read, for seek detection.
    last_end: Option<u64>,
    completions: watch::Receiver<u64>,
    cancel: CancellationToken,
    stall_timeout: Duration,
}

impl FileReader {
    pub fn open(
        transfer: Arc<dyn Transfer>,
        scheduler: Arc<PieceScheduler>,
        file: FileDescriptor,
        piece_length: u64,
        generation: u64,
        cancel: CancellationToken,
        config: &StreamConfig,
    ) -> Self {
        let completions = transfer.completions();
        Self {
            transfer,
            scheduler,
            file,
            generation,
            piece_length: piece_length.max(1),
            position: 0,
            readahead: config.readahead_bytes,
            responsive: false,
            boosted: Vec::new(),
            last_end: None,
            completions,
            cancel,
            stall_timeout: config.read_stall_timeout(),
        }
    }

    pub fn set_readahead(&mut self, bytes: u64) {
        self.readahead = bytes;
    }

    /// Grade the readahead window so pieces nearest the cursor complete first.
    pub fn set_responsive(&mut self) {
        self.responsive = true;
        self.release();
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.file.length
    }

    pub fn is_empty(&self) -> bool {
        self.file.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Entity tag: stable for one file of one session.
    pub fn etag(&self) -> String {
        format!(
            "\"{:x}-{:x}-{:x}\"",
            self.generation, self.file.index, self.file.length
        )
    }

    /// Move the cursor. Any jump drops the current readahead window.
    pub fn seek(&mut self, position: u64) -> Result<u64, StreamError> {
        if position > self.file.length {
            return Err(StreamError::RangeNotSatisfiable {
                length: self.file.length,
            });
        }
        if position != self.position {
            self.release();
            self.position = position;
        }
        Ok(position)
    }

    /// Read up to `max` bytes at the cursor without crossing a piece boundary.
    /// Returns an empty buffer at end of file.
    pub async fn read(&mut self, max: usize) -> Result<Bytes, StreamError> {
        let remaining = self.file.length - self.position;
        if remaining == 0 || max == 0 {
            return Ok(Bytes::new());
        }

        let absolute = self.file.offset + self.position;
        let piece = (absolute / self.piece_length) as u32;
        let piece_end = (piece as u64 + 1) * self.piece_length;
        let len = (piece_end - absolute).min(remaining).min(max as u64);

        self.scheduler
            .observe(self.last_end, self.position, self.position + len);
        self.last_end = Some(self.position + len);
        self.boost(absolute);
        self.wait_for_piece(piece).await?;

        let data = self.transfer.read_at(absolute, len as usize)?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Read exactly `length` bytes at `offset`, or up to end of file.
    pub async fn read_at(&mut self, offset: u64, length: usize) -> Result<Bytes, StreamError> {
        if offset >= self.file.length && length > 0 {
            return Err(StreamError::RangeNotSatisfiable {
                length: self.file.length,
            });
        }
        self.seek(offset)?;

        let want = (self.file.length - offset).min(length as u64) as usize;
        let first = self.read(want).await?;
        if first.len() == want {
            return Ok(first);
        }

        let mut buf = BytesMut::with_capacity(want);
        buf.extend_from_slice(&first);
        while buf.len() < want {
            let chunk = self.read(want - buf.len()).await?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Raise the pieces in `[absolute, absolute + readahead)` above their scheduled tier.
    fn boost(&mut self, absolute: u64) {
        let window_end = absolute
            .saturating_add(self.readahead.max(1))
            .min(self.file.end());
        let first = (absolute / self.piece_length) as u32;
        let last = ((window_end - 1) / self.piece_length) as u32;
        let wanted: Vec<(u32, PiecePriority)> = (first..=last)
            .map(|index| {
                let tier = match index - first {
                    0 => PiecePriority::Immediate,
                    1 if self.responsive => PiecePriority::Next,
                    _ => PiecePriority::Readahead,
                };
                (index, tier)
            })
            .collect();
        if wanted == self.boosted {
            return;
        }

        let previous = std::mem::replace(&mut self.boosted, wanted);
        self.scheduler.reboost(&previous, &self.boosted);
    }

    /// Hand every boosted piece back to the scheduler.
    fn release(&mut self) {
        if !self.boosted.is_empty() {
            let previous = std::mem::take(&mut self.boosted);
            self.scheduler.reboost(&previous, &[]);
        }
    }

    async fn wait_for_piece(&mut self, piece: u32) -> Result<(), StreamError> {
        let deadline = Instant::now() + self.stall_timeout;
        loop {
            let _ = self.completions.borrow_and_update();
            if self.transfer.piece_complete(piece) {
                return Ok(());
            }
            if let Some(reason) = self.transfer.failure() {
                return Err(EngineError::Failed(reason).into());
            }

            debug!("read blocked on piece {}", piece);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                changed = self.completions.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Detached.into());
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("no progress on piece {} after {:?}", piece, self.stall_timeout);
                    return Err(StreamError::ReadTimeout { piece });
                }
            }
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.release();
    }
}
