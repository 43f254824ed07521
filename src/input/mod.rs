//! Seekable byte sources over partially-available torrent data.
//!
//! [`BufferedInput`] provides the generic cursor/buffer/refill machinery;
//! [`TorrentInput`] specializes it with a piece-aware fill that blocks on
//! unfinished pieces and coalesces finished runs into a single disk read.

pub mod buffered;
pub mod torrent;

pub use buffered::{BufferWindow, BufferedInput, FillSource};
pub use torrent::{
    CancelHandle, NoopWaitListener, PieceWaitListener, TorrentFileView, TorrentInput,
};

/// Errors surfaced by the read plane.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// Seek target outside `[0, len]`.
    #[error("offset {offset} is outside the valid range [0, {len}]")]
    OutOfRange {
        /// Requested cursor position
        offset: u64,
        /// Total logical size of the input
        len: u64,
    },

    /// A constructor precondition or coordinate-mapping invariant was broken;
    /// represents a programming bug, not a runtime condition.
    #[error("input invariant violated: {reason}")]
    InvariantViolation {
        /// Which invariant failed
        reason: String,
    },

    /// The read was aborted while suspended on an unfinished piece.
    #[error("read cancelled while waiting for piece {piece_index}")]
    Cancelled {
        /// Absolute index of the piece the read was waiting on
        piece_index: u32,
    },

    /// The input was closed and can no longer serve reads.
    #[error("input is closed")]
    Closed,

    /// Underlying file seek/read failed; the caller may retry.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
