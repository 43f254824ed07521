//! Piece model: absolute coordinates, download state, and the finished signal.
//!
//! A [`Piece`] describes one slice of the torrent's concatenated byte stream.
//! Identity (index, offset, size) is immutable; only the download state
//! changes, driven by the engine-callback side. Readers observe state through
//! atomic loads and park on a broadcast latch until the piece finishes.

pub mod list;

pub use list::PieceList;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering, fence};

use crate::sync::Latch;

/// Engine-reported download progress for one piece.
///
/// `Finished` means the piece's bytes are on disk and verified. Transitions
/// are monotone toward the terminal states, except that `Failed` may return
/// to `Downloading` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PieceState {
    /// No data for this piece yet
    NotAvailable = 0,
    /// Queued for download
    Ready = 1,
    /// At least one block is in flight
    Downloading = 2,
    /// Downloaded and hash-verified; bytes are readable from disk
    Finished = 3,
    /// Hash check failed; eligible for re-download
    Failed = 4,
    /// Being re-checked against its hash
    Checking = 5,
}

impl PieceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PieceState::Ready,
            2 => PieceState::Downloading,
            3 => PieceState::Finished,
            4 => PieceState::Failed,
            5 => PieceState::Checking,
            _ => PieceState::NotAvailable,
        }
    }
}

/// One piece of the torrent's global byte stream.
///
/// Offsets are absolute: `data_start_offset` is the position of the piece's
/// first byte within the concatenation of all pieces in index order.
#[derive(Debug)]
pub struct Piece {
    index: u32,
    data_start_offset: u64,
    size: u64,
    state: AtomicU8,
    finished: OnceLock<Latch>,
}

impl Piece {
    /// Creates a piece with the given absolute index, start offset and size.
    ///
    /// `size` must be greater than zero.
    pub fn new(index: u32, data_start_offset: u64, size: u64) -> Self {
        debug_assert!(size > 0, "piece size must be positive");
        Self {
            index,
            data_start_offset,
            size,
            state: AtomicU8::new(PieceState::NotAvailable as u8),
            finished: OnceLock::new(),
        }
    }

    /// Absolute index of this piece within the torrent.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Absolute offset of the piece's first byte.
    pub fn data_start_offset(&self) -> u64 {
        self.data_start_offset
    }

    /// Absolute offset of the piece's last byte (inclusive).
    pub fn data_last_offset(&self) -> u64 {
        self.data_start_offset + self.size - 1
    }

    /// Piece size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the absolute offset falls inside this piece.
    pub fn contains(&self, absolute_offset: u64) -> bool {
        self.data_start_offset <= absolute_offset && absolute_offset <= self.data_last_offset()
    }

    /// Current download state.
    pub fn state(&self) -> PieceState {
        PieceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the piece's bytes are on disk and verified.
    pub fn is_finished(&self) -> bool {
        self.state() == PieceState::Finished
    }

    /// Publishes a state transition.
    ///
    /// The first transition to `Finished` releases every task blocked in
    /// [`Piece::wait_finished`].
    pub fn set_state(&self, next: PieceState) {
        self.state.store(next as u8, Ordering::SeqCst);
        if next == PieceState::Finished {
            // Pairs with the fence in wait_finished: of the two racing
            // sides, at least one must see the other's write, so a waiter
            // can never park against a latch this store misses.
            fence(Ordering::SeqCst);
            if let Some(latch) = self.finished.get() {
                latch.trip();
            }
        }
    }

    /// Suspends until the piece is `Finished`.
    ///
    /// Completes immediately when the piece already finished; otherwise parks
    /// until the engine-callback side publishes the transition. The latch is
    /// allocated on the first wait, so pieces nobody reads stay cheap.
    pub async fn wait_finished(&self) {
        if self.is_finished() {
            return;
        }
        let latch = self.finished.get_or_init(Latch::new);
        fence(Ordering::SeqCst);
        if self.is_finished() {
            return;
        }
        latch.wait().await;
    }
}
