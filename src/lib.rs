//! Spindrift - streaming reads over a BitTorrent engine
//!
//! This crate exposes the bytes of a partially-downloaded torrent as a
//! seekable byte source so that a media player can start playback before the
//! download completes. Reads block on exactly the pieces the cursor needs,
//! nudging the swarm toward the playback position through piece deadlines,
//! and coalesce adjacent finished pieces into a single disk read.
//!
//! The BitTorrent protocol itself (peers, trackers, hashing) lives behind the
//! engine contract in [`engine`]; spindrift only consumes finished pieces.

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]

pub mod config;
pub mod downloader;
pub mod engine;
pub mod input;
pub mod piece;
pub mod session;
mod sync;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SpindriftConfig;
pub use downloader::Downloader;
pub use engine::{EngineError, HandleId, TorrentHandle, TorrentManagerSession};
pub use input::{InputError, TorrentInput};
pub use piece::{Piece, PieceList, PieceState};
pub use session::{DownloadSession, SessionDispatcher};
pub use tracing_setup::{CliLogLevel, init_tracing};

/// Core errors that can bubble up from any spindrift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SpindriftError {
    /// Read-plane errors (seeking, buffering, waiting on pieces)
    #[error("Input error: {0}")]
    Input(#[from] input::InputError),

    /// Engine boundary errors (handle lifecycle, torrent registration)
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Standard I/O errors from filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpindriftError {
    /// Checks if the error represents a cancelled read rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SpindriftError::Input(input::InputError::Cancelled { .. })
        )
    }
}

/// Convenience Result type using SpindriftError as the error type
pub type Result<T> = std::result::Result<T, SpindriftError>;
