//! Piece-aware buffered input over a torrent save file.
//!
//! [`TorrentInput`] reads a single logical file out of the torrent's
//! concatenated piece stream. A read whose cursor lands on an unfinished
//! piece first hints the owner through [`PieceWaitListener`], then suspends
//! until the engine finishes the piece. Once the cursor piece is readable,
//! the fill measures how far the finished run extends in both directions and
//! pulls the whole run from disk in one seek + read.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::InputError;
use super::buffered::{BufferWindow, BufferedInput, FillSource};
use crate::piece::{Piece, PieceList, PieceState};
use crate::sync::Latch;

/// Hook invoked right before a read suspends on an unfinished piece.
///
/// The owning session implements this as a piece-deadline set on the engine
/// handle, biasing the swarm toward the playback cursor. The hook may
/// suspend briefly but must not block on the piece itself.
#[async_trait]
pub trait PieceWaitListener: Send + Sync {
    /// Reports that a read is about to wait for `piece_index`.
    async fn on_piece_wait(&self, piece_index: u32);
}

/// Listener that ignores wait notifications.
#[derive(Debug, Default)]
pub struct NoopWaitListener;

#[async_trait]
impl PieceWaitListener for NoopWaitListener {
    async fn on_piece_wait(&self, _piece_index: u32) {}
}

/// Aborts pending reads on the input it was taken from.
///
/// Cloneable; any clone can cancel. A read suspended on a piece resolves
/// with [`InputError::Cancelled`] without touching the buffer or cursor.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    latch: Arc<Latch>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            latch: Arc::new(Latch::new()),
        }
    }

    /// Cancels every pending and future piece wait on the owning input.
    pub fn cancel(&self) {
        self.latch.trip();
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.latch.is_tripped()
    }
}

/// Maps one logical file onto the torrent's absolute piece space.
///
/// `start_offset` is the absolute offset of the file's first byte within the
/// concatenated piece stream; a file-relative offset `p` targets absolute
/// offset `start_offset + p`. The piece list must cover the whole mapped
/// range; the first and last pieces may straddle the file boundary and carry
/// bytes belonging to neighbouring files.
#[derive(Debug, Clone)]
pub struct TorrentFileView {
    pieces: PieceList,
    start_offset: u64,
    len: u64,
}

impl TorrentFileView {
    /// Creates a view over `pieces` for a file of `len` bytes whose first
    /// byte sits at absolute offset `start_offset`.
    pub fn new(pieces: PieceList, start_offset: u64, len: u64) -> Self {
        Self {
            pieces,
            start_offset,
            len,
        }
    }

    /// The pieces backing this view.
    pub fn pieces(&self) -> &PieceList {
        &self.pieces
    }

    /// Absolute offset of the file's first byte.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Logical file size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute offset of the file's last byte. Meaningless for empty files.
    fn last_abs_offset(&self) -> u64 {
        self.start_offset + self.len - 1
    }

    /// Resolves the piece containing the file-relative offset.
    pub fn piece_for(&self, view_offset: u64) -> Option<&Piece> {
        self.pieces.find_by_offset(self.start_offset + view_offset)
    }

    /// Absolute index of the piece containing the file-relative offset.
    pub fn piece_index_for(&self, view_offset: u64) -> Option<u32> {
        self.piece_for(view_offset).map(Piece::index)
    }

    /// Counts how many bytes from `view_offset` onward (inclusive) lie in
    /// consecutively finished pieces, capped at `cap` and clamped to the end
    /// of the file.
    ///
    /// The first and last pieces typically straddle the file boundary;
    /// clamping keeps post-file bytes of the last piece out of the count.
    pub fn max_forward_extent(&self, view_offset: u64, cap: u64) -> u64 {
        debug_assert!(cap > 0, "forward extent needs a positive cap");
        if view_offset >= self.len {
            return 0;
        }
        let file_last = self.last_abs_offset();
        let Some(mut curr) = self.piece_for(view_offset) else {
            return 0;
        };
        let mut curr_offset = self.start_offset + view_offset;
        let mut total = 0u64;
        loop {
            if curr.state() != PieceState::Finished {
                return total;
            }
            let end_of_curr = curr.data_last_offset().min(file_last);
            total += end_of_curr - curr_offset + 1;
            if total >= cap {
                return cap;
            }
            if end_of_curr == file_last {
                return total;
            }
            let Some(next) = self.pieces.by_index(curr.index() + 1) else {
                return total;
            };
            curr_offset = end_of_curr + 1;
            curr = next;
        }
    }

    /// Counts how many bytes before `view_offset` (exclusive) lie in
    /// consecutively finished pieces, capped at `cap` and clamped to the
    /// start of the file.
    pub fn max_backward_extent(&self, view_offset: u64, cap: u64) -> u64 {
        debug_assert!(cap > 0, "backward extent needs a positive cap");
        if view_offset >= self.len {
            return 0;
        }
        let Some(mut curr) = self.piece_for(view_offset) else {
            return 0;
        };
        let mut curr_offset = self.start_offset + view_offset;
        let mut total = 0u64;
        loop {
            if curr.state() != PieceState::Finished {
                return total;
            }
            let start_of_curr = curr.data_start_offset().max(self.start_offset);
            total += curr_offset - start_of_curr;
            if total >= cap {
                return cap;
            }
            if start_of_curr == self.start_offset {
                return total;
            }
            let Some(prev) = curr
                .index()
                .checked_sub(1)
                .and_then(|index| self.pieces.by_index(index))
            else {
                return total;
            };
            curr_offset = start_of_curr;
            curr = prev;
        }
    }
}

/// Piece-aware [`FillSource`] backing a [`TorrentInput`].
struct PieceSource {
    file: Option<File>,
    view: TorrentFileView,
    buffer_size: u64,
    listener: Arc<dyn PieceWaitListener>,
    cancel: CancelHandle,
    disk_reads: u64,
}

#[async_trait]
impl FillSource for PieceSource {
    fn len(&self) -> u64 {
        self.view.len()
    }

    async fn fill(&mut self, position: u64, window: &mut BufferWindow) -> Result<(), InputError> {
        let piece = self.view.piece_for(position).ok_or_else(|| {
            InputError::InvariantViolation {
                reason: format!("offset {position} is not covered by any piece"),
            }
        })?;
        let piece_index = piece.index();

        if piece.state() != PieceState::Finished {
            tracing::trace!(piece = piece_index, position, "read waiting for piece");
            self.listener.on_piece_wait(piece_index).await;
            if self.cancel.is_cancelled() {
                return Err(InputError::Cancelled { piece_index });
            }
            tokio::select! {
                () = piece.wait_finished() => {}
                () = self.cancel.latch.wait() => {
                    return Err(InputError::Cancelled { piece_index });
                }
            }
        }

        let forward = self.view.max_forward_extent(position, self.buffer_size);
        let backward = self.view.max_backward_extent(position, self.buffer_size);
        let read_start = position.saturating_sub(backward);
        let read_end = (position + forward).min(self.view.len());
        debug_assert!(
            read_start <= position && position < read_end,
            "coalesced read must cover the cursor byte"
        );

        let file = self.file.as_mut().ok_or(InputError::Closed)?;
        file.seek(SeekFrom::Start(read_start)).await?;
        let mut data = vec![0u8; (read_end - read_start) as usize];
        if let Err(error) = file.read_exact(&mut data).await {
            window.clear();
            return Err(error.into());
        }
        self.disk_reads += 1;
        tracing::trace!(
            start = read_start,
            end = read_end,
            piece = piece_index,
            "buffer refilled from finished run"
        );
        window.set(read_start, data);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), InputError> {
        // Dropping the handle closes it; nothing to flush on a reader.
        self.file = None;
        Ok(())
    }
}

/// Seekable, buffered byte source over one file of a live torrent.
///
/// Reads block until the pieces under the cursor finish downloading; each
/// buffer refill turns the surrounding run of finished pieces into a single
/// disk read. One `TorrentInput` exclusively owns its file handle, and the
/// `&mut self` receivers keep reads single-threaded by construction.
pub struct TorrentInput {
    inner: BufferedInput<PieceSource>,
}

impl TorrentInput {
    /// Opens the save file at `save_path` and validates that `view` covers
    /// the whole file.
    ///
    /// # Errors
    ///
    /// - `InputError::InvariantViolation` - `buffer_size` is zero, the piece
    ///   list does not cover the mapped range, or a file boundary byte is
    ///   outside every piece
    /// - `InputError::Io` - The save file could not be opened
    pub async fn open(
        save_path: &Path,
        view: TorrentFileView,
        buffer_size: u64,
        listener: Arc<dyn PieceWaitListener>,
    ) -> Result<Self, InputError> {
        if buffer_size == 0 {
            return Err(InputError::InvariantViolation {
                reason: "buffer size must be positive".to_string(),
            });
        }
        validate_view(&view)?;

        let file = File::open(save_path).await?;
        tracing::debug!(
            path = %save_path.display(),
            len = view.len(),
            start_offset = view.start_offset(),
            "torrent input opened"
        );

        Ok(Self {
            inner: BufferedInput::new(PieceSource {
                file: Some(file),
                view,
                buffer_size,
                listener,
                cancel: CancelHandle::new(),
                disk_reads: 0,
            }),
        })
    }

    /// Current file-relative read cursor.
    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    /// Logical file size in bytes.
    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Repositions the cursor without discarding the buffer.
    ///
    /// # Errors
    ///
    /// - `InputError::OutOfRange` - `offset` is beyond the file size
    pub fn seek(&mut self, offset: u64) -> Result<(), InputError> {
        self.inner.seek(offset)
    }

    /// Reads up to `out.len()` bytes at the cursor, blocking on unfinished
    /// pieces as needed. Returns `Ok(0)` only at end of file.
    ///
    /// # Errors
    ///
    /// - `InputError::Cancelled` - [`CancelHandle::cancel`] aborted a wait
    /// - `InputError::Closed` - The input was closed
    /// - `InputError::InvariantViolation` - The cursor maps outside every
    ///   piece
    /// - `InputError::Io` - The underlying disk read failed
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, InputError> {
        self.inner.read(out).await
    }

    /// Closes the underlying file handle. Idempotent.
    ///
    /// # Errors
    ///
    /// - `InputError::Io` - Closing the file failed
    pub async fn close(&mut self) -> Result<(), InputError> {
        self.inner.close().await
    }

    /// Handle that aborts reads currently suspended on a piece.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.source().cancel.clone()
    }

    /// The file view this input reads through.
    pub fn view(&self) -> &TorrentFileView {
        &self.inner.source().view
    }

    /// Number of disk reads issued so far.
    pub fn disk_reads(&self) -> u64 {
        self.inner.source().disk_reads
    }

    /// The file-relative range currently resident, if any.
    pub fn buffered_range(&self) -> Option<(u64, u64)> {
        let window = self.inner.window();
        (!window.is_empty()).then(|| (window.start(), window.end()))
    }
}

/// Checks that the piece list actually covers the mapped file range.
fn validate_view(view: &TorrentFileView) -> Result<(), InputError> {
    let Some(first) = view.pieces().first() else {
        return Err(InputError::InvariantViolation {
            reason: "piece list is empty".to_string(),
        });
    };

    let lead = view
        .start_offset()
        .checked_sub(first.data_start_offset())
        .ok_or_else(|| InputError::InvariantViolation {
            reason: "file starts before the first piece".to_string(),
        })?;
    if view.pieces().total_len_bytes() < view.len() + lead {
        return Err(InputError::InvariantViolation {
            reason: "pieces do not cover the file".to_string(),
        });
    }
    if view.piece_for(0).is_none() {
        return Err(InputError::InvariantViolation {
            reason: "file start is outside every piece".to_string(),
        });
    }
    if view.len() > 0 && view.piece_for(view.len() - 1).is_none() {
        return Err(InputError::InvariantViolation {
            reason: "file end is outside every piece".to_string(),
        });
    }
    Ok(())
}
