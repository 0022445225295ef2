// Piece priority scheduler: head/tail windows for fast start and fast seek.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::file::FileDescriptor;
use crate::config::StreamConfig;
use crate::transfer::{PiecePriority, Transfer};

/// `pct` percent of `length`, rounded up.
fn percent_of(length: u64, pct: u64) -> u64 {
    ((length as u128 * pct as u128).div_ceil(100)) as u64
}

/// Head and tail byte ranges of a file, in absolute transfer offsets, and the tier they imply
/// for every piece overlapping the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityWindow {
    file: Range<u64>,
    head: Range<u64>,
    tail: Range<u64>,
    head_len: u64,
    piece_length: u64,
}

impl PriorityWindow {
    /// Window for playback starting at the beginning of `file`.
    pub fn new(
        file: &FileDescriptor,
        piece_length: u64,
        head_percent: u64,
        tail_percent: u64,
    ) -> Self {
        let piece_length = piece_length.max(1);
        let head_len = percent_of(file.length, head_percent);
        let tail_len = percent_of(file.length, tail_percent).min(file.length);
        let mut window = Self {
            file: file.offset..file.end(),
            head: file.offset..file.offset,
            tail: file.end() - tail_len..file.end(),
            head_len,
            piece_length,
        };
        window.head = window.head_range(0);
        window
    }

    fn head_range(&self, position: u64) -> Range<u64> {
        let start = (self.file.start + position).min(self.file.end);
        let end = start.saturating_add(self.head_len).min(self.file.end);
        start..end
    }

    /// Same window with the head moved to `position` (relative to the file start).
    pub fn with_head_at(&self, position: u64) -> Self {
        Self {
            head: self.head_range(position),
            ..self.clone()
        }
    }

    pub fn head(&self) -> Range<u64> {
        self.head.clone()
    }

    pub fn tail(&self) -> Range<u64> {
        self.tail.clone()
    }

    fn pieces_overlapping(&self, bytes: &Range<u64>) -> Range<u32> {
        if bytes.start >= bytes.end {
            return 0..0;
        }
        let first = bytes.start / self.piece_length;
        let last = (bytes.end - 1) / self.piece_length;
        first as u32..last as u32 + 1
    }

    /// Every piece holding at least one byte of the file.
    pub fn pieces(&self) -> Range<u32> {
        self.pieces_overlapping(&self.file)
    }

    pub fn head_pieces(&self) -> Range<u32> {
        self.pieces_overlapping(&self.head)
    }

    /// Tier for a piece, or `None` if it holds no byte of the file.
    pub fn tier(&self, index: u32) -> Option<PiecePriority> {
        let start = index as u64 * self.piece_length;
        let end = start + self.piece_length;
        if end <= self.file.start || start >= self.file.end {
            return None;
        }
        let overlaps = |r: &Range<u64>| r.start < r.end && start < r.end && end > r.start;
        if overlaps(&self.head) || overlaps(&self.tail) {
            Some(PiecePriority::Immediate)
        } else {
            Some(PiecePriority::Normal)
        }
    }
}

struct SchedulerState {
    window: PriorityWindow,
    /// Tiers currently requested by live readers, per piece. One entry per reader holding it.
    boosts: HashMap<u32, Vec<PiecePriority>>,
}

impl SchedulerState {
    /// Scheduled tier raised to the strongest live reader boost.
    fn effective(&self, index: u32) -> Option<PiecePriority> {
        let boost = self
            .boosts
            .get(&index)
            .and_then(|tiers| tiers.iter().max().copied());
        self.window.tier(index).max(boost)
    }
}

/// Applies a [`PriorityWindow`] to a transfer, moves its head when playback seeks, and merges
/// the readahead boosts of every reader open on the file.
pub struct PieceScheduler {
    transfer: Arc<dyn Transfer>,
    state: Mutex<SchedulerState>,
    /// End offset (relative to the file) of the last read served by any reader.
    cursor: AtomicU64,
    seek_threshold: u64,
}

impl PieceScheduler {
    pub fn new(
        transfer: Arc<dyn Transfer>,
        file: &FileDescriptor,
        piece_length: u64,
        config: &StreamConfig,
    ) -> Self {
        let window = PriorityWindow::new(
            file,
            piece_length,
            config.head_window_percent,
            config.tail_window_percent,
        );
        Self {
            transfer,
            state: Mutex::new(SchedulerState {
                window,
                boosts: HashMap::new(),
            }),
            cursor: AtomicU64::new(0),
            seek_threshold: config.seek_threshold_bytes,
        }
    }

    pub fn window(&self) -> PriorityWindow {
        self.state.lock().window.clone()
    }

    /// Scheduled tier of a piece, ignoring reader boosts.
    pub fn tier(&self, index: u32) -> Option<PiecePriority> {
        self.state.lock().window.tier(index)
    }

    /// Assign a tier to every piece of the file. Returns the number of immediate pieces.
    pub fn prime(&self) -> usize {
        let state = self.state.lock();
        let window = &state.window;
        let mut immediate = 0;
        for index in window.pieces() {
            if window.tier(index) == Some(PiecePriority::Immediate) {
                immediate += 1;
            }
            if let Some(tier) = state.effective(index) {
                self.transfer.set_piece_priority(index, tier);
            }
        }
        info!(
            "primed pieces {:?}: {} immediate, head={:?} tail={:?}",
            window.pieces(),
            immediate,
            window.head(),
            window.tail()
        );
        immediate
    }

    /// Move the head window to `position`; the tail stays at the end of the file.
    pub fn reprime(&self, position: u64) {
        let mut state = self.state.lock();
        let next = state.window.with_head_at(position);
        if next == state.window {
            return;
        }
        let old_head = state.window.head_pieces();
        let new_head = next.head_pieces();
        state.window = next;

        for index in old_head.chain(new_head) {
            if let Some(tier) = state.effective(index) {
                self.transfer.set_piece_priority(index, tier);
            }
        }
        debug!("head window moved to {:?}", state.window.head());
    }

    /// Swap one reader's boosts from `old` to `new`. New boosts are counted before old ones are
    /// dropped, so a piece held by both never dips below its scheduled tier.
    pub fn reboost(&self, old: &[(u32, PiecePriority)], new: &[(u32, PiecePriority)]) {
        let mut state = self.state.lock();
        for &(index, tier) in new {
            state.boosts.entry(index).or_default().push(tier);
        }
        for &(index, tier) in old {
            if let Some(tiers) = state.boosts.get_mut(&index) {
                if let Some(pos) = tiers.iter().position(|t| *t == tier) {
                    tiers.swap_remove(pos);
                }
                if tiers.is_empty() {
                    state.boosts.remove(&index);
                }
            }
        }

        let touched: BTreeSet<u32> = new.iter().chain(old).map(|(index, _)| *index).collect();
        for index in touched {
            if let Some(tier) = state.effective(index) {
                self.transfer.set_piece_priority(index, tier);
            }
        }
    }

    /// Record a read of `[start, end)` (file-relative). `previous` is where the same reader's
    /// last read ended; a reader's first read is measured from the last read of any reader.
    /// A start further than the seek threshold counts as a seek and re-primes the head there.
    /// Returns whether it was a seek.
    pub fn observe(&self, previous: Option<u64>, start: u64, end: u64) -> bool {
        let last_served = self.cursor.swap(end, Ordering::Relaxed);
        let last = previous.unwrap_or(last_served);
        if start.abs_diff(last) <= self.seek_threshold {
            return false;
        }
        debug!("seek detected: {} -> {}", last, start);
        self.reprime(start);
        true
    }
}
