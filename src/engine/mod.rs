//! Engine boundary: the capability surface spindrift consumes from a
//! BitTorrent engine.
//!
//! The engine owns the wire protocol, trackers, hashing and the save file;
//! spindrift drives it exclusively through the traits in this module and
//! receives progress back as [`EngineAlert`]s pushed into an [`AlertSink`].
//! A production implementation wraps a real engine; [`sim`] provides a
//! deterministic in-process variant for development and tests. The manager
//! contract is parameterized over its handle and add-info types so the
//! session layer never downcasts.

pub mod sim;

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::piece::PieceList;

/// Opaque 64-bit identifier the engine assigns to each torrent.
///
/// Unique per engine instance for the lifetime of that torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Creates a HandleId from the engine's raw identifier.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File-level download selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePriority {
    /// Do not download the file
    Ignore,
    /// Download after normal-priority files
    Low,
    /// Default priority
    Normal,
    /// Download before normal-priority files
    High,
}

/// Engine-reported lifecycle state of one torrent.
///
/// Transitions follow the underlying engine and are treated as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentHandleState {
    /// Waiting for its turn in the checking queue
    QueuedForChecking,
    /// Verifying on-disk data against piece hashes
    CheckingFiles,
    /// Fetching metadata from the swarm (magnet startup)
    DownloadingMetadata,
    /// Transferring piece data
    Downloading,
    /// All selected files complete
    Finished,
    /// Complete and uploading to peers
    Seeding,
    /// Pre-allocating storage
    Allocating,
    /// Validating previously saved resume data
    CheckingResumeData,
}

/// Transfer statistics snapshot for one torrent.
///
/// Byte counts are totals since the torrent was added; rates are
/// bytes per second.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentStats {
    /// Total bytes wanted
    pub total: u64,
    /// Bytes downloaded and verified
    pub total_done: u64,
    /// Bytes uploaded across all sessions of this torrent
    pub all_time_upload: u64,
    /// Bytes downloaded across all sessions of this torrent
    pub all_time_download: u64,
    /// Current payload download rate
    pub download_payload_rate: u64,
    /// Current payload upload rate
    pub upload_payload_rate: u64,
    /// Completion ratio in `[0, 1]`
    pub progress: f32,
    /// Payload bytes downloaded this session
    pub total_payload_download: u64,
    /// Payload bytes uploaded this session
    pub total_payload_upload: u64,
}

/// Snapshot of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Torrent this peer belongs to
    pub handle: HandleId,
    /// Peer id from the wire handshake
    pub id: [u8; 20],
    /// Client name advertised by the peer
    pub client: String,
    /// Remote address
    pub addr: SocketAddr,
    /// Peer's completion ratio in `[0, 1]`
    pub progress: f32,
    /// Bytes received from this peer
    pub total_download: u64,
    /// Bytes sent to this peer
    pub total_upload: u64,
    /// Engine-specific flag bitset
    pub flags: u64,
}

/// One file inside the torrent.
#[derive(Debug, Clone)]
pub struct TorrentFileInfo {
    /// File name without directories
    pub name: String,
    /// Path relative to the save directory
    pub path: PathBuf,
    /// File size in bytes
    pub len: u64,
}

/// Torrent metadata, available once the engine has resolved it.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Display name of the torrent
    pub name: String,
    /// Number of pieces
    pub num_pieces: u32,
    /// Size of every piece except the last
    pub piece_length: u64,
    /// Size of the final piece
    pub last_piece_len: u64,
    /// Files in metadata order; offsets in the concatenated piece stream
    /// follow this order
    pub files: Vec<TorrentFileInfo>,
}

impl TorrentDescriptor {
    /// Total byte size of the concatenated piece stream.
    pub fn total_piece_bytes(&self) -> u64 {
        if self.num_pieces == 0 {
            0
        } else {
            u64::from(self.num_pieces - 1) * self.piece_length + self.last_piece_len
        }
    }

    /// Builds the torrent-global piece list for this layout.
    pub fn piece_list(&self) -> PieceList {
        PieceList::from_layout(self.num_pieces, self.piece_length, self.last_piece_len)
    }

    /// Absolute offset of the file's first byte within the concatenated
    /// piece stream, or `None` for an out-of-range index.
    pub fn file_start_offset(&self, file_index: usize) -> Option<u64> {
        if file_index >= self.files.len() {
            return None;
        }
        Some(self.files[..file_index].iter().map(|f| f.len).sum())
    }
}

/// Errors from the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine session is closed; the handle is no longer usable.
    #[error("engine session is closed")]
    EngineClosed,

    /// The engine refused to start the torrent.
    #[error("engine rejected the torrent: {reason}")]
    StartRejected {
        /// Engine-reported rejection reason
        reason: String,
    },

    /// `start_download` was called twice for the same handle.
    #[error("torrent {handle} was already started")]
    AlreadyStarted {
        /// Handle that was started twice
        handle: HandleId,
    },

    /// The handle does not belong to this engine session.
    #[error("torrent {handle} is unknown to the engine")]
    UnknownHandle {
        /// The unknown handle
        handle: HandleId,
    },

    /// Metadata has not been resolved yet.
    #[error("torrent metadata is not available yet")]
    MetadataNotReady,

    /// I/O failure inside the engine boundary.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// How a torrent is identified when it is added.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// `magnet:?xt=urn:btih:…` URI passed to the engine verbatim
    Magnet(String),
    /// Absolute path of a `.torrent` metadata file
    TorrentFile(PathBuf),
}

/// Opaque resume-data blob produced by the engine.
///
/// Bytes-in/bytes-out: what was written must be readable back through
/// `TorrentAddInfo::set_resume_data_path`; there is no format contract.
#[async_trait]
pub trait TorrentResumeData: Send + Sync + fmt::Debug {
    /// Persists the blob at `path`, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the write fails.
    async fn save_to_path(&self, path: &Path) -> std::io::Result<()>;
}

/// Callback payload pushed by the engine.
///
/// Each alert is tagged with the handle it concerns; delivery order per
/// handle matches the order the engine produced them.
#[derive(Debug)]
pub enum EngineAlert {
    /// Response to `post_status_updates`
    Stats {
        /// Originating torrent
        handle: HandleId,
        /// Statistics snapshot
        stats: TorrentStats,
    },
    /// Response to `post_save_resume`
    ResumeData {
        /// Originating torrent
        handle: HandleId,
        /// Blob to persist
        data: Box<dyn TorrentResumeData>,
    },
    /// The torrent's lifecycle state changed
    State {
        /// Originating torrent
        handle: HandleId,
        /// New state
        state: TorrentHandleState,
    },
    /// A piece finished downloading and verified
    PieceFinished {
        /// Originating torrent
        handle: HandleId,
        /// Absolute index of the finished piece
        piece_index: u32,
    },
    /// Torrent metadata became available
    MetadataReceived {
        /// Originating torrent
        handle: HandleId,
    },
}

impl EngineAlert {
    /// The torrent this alert concerns.
    pub fn handle(&self) -> HandleId {
        match self {
            EngineAlert::Stats { handle, .. }
            | EngineAlert::ResumeData { handle, .. }
            | EngineAlert::State { handle, .. }
            | EngineAlert::PieceFinished { handle, .. }
            | EngineAlert::MetadataReceived { handle } => *handle,
        }
    }
}

/// Receiver of engine alerts.
///
/// `deliver` runs on the engine's callback thread and must not block: a map
/// lookup plus a bounded handoff, nothing more.
pub trait AlertSink: Send + Sync {
    /// Accepts one alert. Alerts for unknown handles are dropped silently.
    fn deliver(&self, alert: EngineAlert);
}

/// Per-torrent control surface exposed by the engine.
pub trait TorrentHandle: Send + Sync {
    /// The engine-assigned identifier.
    fn id(&self) -> HandleId;

    /// Whether the handle still refers to a live torrent.
    fn is_valid(&self) -> bool;

    /// Current lifecycle state, or `None` when the engine session is closed.
    fn state(&self) -> Option<TorrentHandleState>;

    /// Requests an asynchronous [`EngineAlert::Stats`]. Fire-and-forget.
    fn post_status_updates(&self);

    /// Requests an asynchronous [`EngineAlert::ResumeData`]. Fire-and-forget.
    fn post_save_resume(&self);

    /// Unpauses the torrent.
    fn resume(&self);

    /// Selects how eagerly one file is downloaded.
    fn set_file_priority(&self, file_index: u32, priority: FilePriority);

    /// Fetches the torrent's metadata.
    ///
    /// # Errors
    ///
    /// - `EngineError::MetadataNotReady` - Metadata has not been resolved
    /// - `EngineError::EngineClosed` - The session is closed
    fn reload_file(&self) -> Result<TorrentDescriptor, EngineError>;

    /// Snapshot of currently connected peers.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Asks the engine to complete `piece_index` within `deadline` from now.
    ///
    /// `Duration::ZERO` means "most urgent". A later deadline for the same
    /// piece overrides an earlier one.
    fn set_piece_deadline(&self, piece_index: u32, deadline: Duration);

    /// Removes all piece deadlines for this torrent.
    fn clear_piece_deadlines(&self);

    /// Adds a tracker to the torrent. Additive.
    fn add_tracker(&self, url: &str, tier: u8, fail_limit: u32);

    /// Magnet URI for the torrent, when one can be derived.
    fn magnet_uri(&self) -> Option<String>;
}

/// Write-only builder describing a torrent to add.
///
/// Exactly one of magnet URI / torrent file path must be provided; the
/// resume data path is optional.
pub trait TorrentAddInfo: Send {
    /// Identifies the torrent by magnet URI.
    fn set_magnet_uri(&mut self, uri: &str);

    /// Identifies the torrent by `.torrent` file path.
    fn set_torrent_file_path(&mut self, path: &Path);

    /// Points at a previously saved resume-data blob.
    fn set_resume_data_path(&mut self, path: &Path);
}

/// Engine session owning all torrent handles.
pub trait TorrentManagerSession: Send + Sync {
    /// Concrete handle type of this engine variant.
    type Handle: TorrentHandle + Clone + Send + Sync + 'static;
    /// Concrete add-info builder of this engine variant.
    type AddInfo: TorrentAddInfo;

    /// Registers the sink that receives this session's alerts.
    fn set_alert_sink(&self, sink: Arc<dyn AlertSink>);

    /// Allocates a fresh, not-yet-started handle.
    fn create_torrent_handle(&self) -> Self::Handle;

    /// Creates an empty add-info builder.
    fn create_add_info(&self) -> Self::AddInfo;

    /// Starts downloading into `save_dir`. Returns `Ok(false)` when the
    /// engine rejected the add.
    ///
    /// # Errors
    ///
    /// - `EngineError::AlreadyStarted` - The handle was started before
    /// - `EngineError::UnknownHandle` - The handle is not from this session
    /// - `EngineError::EngineClosed` - The session is closed
    fn start_download(
        &self,
        handle: &Self::Handle,
        add_info: Self::AddInfo,
        save_dir: &Path,
    ) -> Result<bool, EngineError>;

    /// Releases the handle; the engine stops delivering alerts for it.
    fn release_handle(&self, handle: &Self::Handle);

    /// Unpauses every torrent in the session.
    fn resume(&self);

    /// Applies runtime tuning to the engine.
    fn apply_config(&self, config: &EngineConfig);
}
