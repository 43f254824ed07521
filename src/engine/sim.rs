//! Deterministic in-process engine variant.
//!
//! Implements the full engine contract without any networking: tests and
//! development environments drive metadata, piece completion, stats and
//! resume data by hand, and every alert is delivered synchronously to the
//! registered sink in call order. This is the second contract variant next
//! to a production engine wrapper, exercising the same session layer
//! bit-for-bit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AlertSink, EngineAlert, EngineError, FilePriority, HandleId, PeerInfo, TorrentAddInfo,
    TorrentDescriptor, TorrentHandle, TorrentHandleState, TorrentManagerSession,
    TorrentResumeData, TorrentStats,
};
use crate::config::EngineConfig;

/// Scripted per-torrent state.
struct SimTorrent {
    started: bool,
    paused: bool,
    state: TorrentHandleState,
    magnet: Option<String>,
    torrent_file: Option<PathBuf>,
    resume_source: Option<Vec<u8>>,
    descriptor: Option<TorrentDescriptor>,
    stats: TorrentStats,
    peers: Vec<PeerInfo>,
    deadline_requests: Vec<(u32, Duration)>,
    deadlines: HashMap<u32, Duration>,
    file_priorities: HashMap<u32, FilePriority>,
    trackers: Vec<(String, u8, u32)>,
    resume_blob: Vec<u8>,
}

impl Default for SimTorrent {
    fn default() -> Self {
        Self {
            started: false,
            paused: false,
            state: TorrentHandleState::QueuedForChecking,
            magnet: None,
            torrent_file: None,
            resume_source: None,
            descriptor: None,
            stats: TorrentStats::default(),
            peers: Vec::new(),
            deadline_requests: Vec::new(),
            deadlines: HashMap::new(),
            file_priorities: HashMap::new(),
            trackers: Vec::new(),
            resume_blob: Vec::new(),
        }
    }
}

struct SimShared {
    next_handle: AtomicU64,
    closed: AtomicBool,
    reject_adds: AtomicBool,
    sink: RwLock<Option<Arc<dyn AlertSink>>>,
    torrents: Mutex<HashMap<HandleId, SimTorrent>>,
    applied_configs: Mutex<Vec<EngineConfig>>,
}

impl SimShared {
    fn deliver(&self, alert: EngineAlert) {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => sink.deliver(alert),
            None => tracing::trace!("sim alert dropped: no sink registered"),
        }
    }

    fn with_torrent<T>(&self, id: HandleId, f: impl FnOnce(&SimTorrent) -> T) -> Option<T> {
        let guard = self.torrents.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(&id).map(f)
    }

    fn with_torrent_mut<T>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut SimTorrent) -> T,
    ) -> Option<T> {
        let mut guard = self.torrents.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get_mut(&id).map(f)
    }
}

/// Deterministic engine session, cloneable so tests can keep a control
/// handle while the downloader owns another.
#[derive(Clone)]
pub struct SimEngine {
    shared: Arc<SimShared>,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    /// Creates an empty sim session.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                next_handle: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                reject_adds: AtomicBool::new(false),
                sink: RwLock::new(None),
                torrents: Mutex::new(HashMap::new()),
                applied_configs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes subsequent `start_download` calls report an engine rejection.
    pub fn set_reject_adds(&self, reject: bool) {
        self.shared.reject_adds.store(reject, Ordering::SeqCst);
    }

    /// Closes the session: every handle's `state()` turns `None`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    /// Publishes metadata for the torrent and alerts the sink.
    pub fn publish_metadata(&self, id: HandleId, descriptor: TorrentDescriptor) {
        self.shared.with_torrent_mut(id, |torrent| {
            torrent.descriptor = Some(descriptor);
            torrent.state = TorrentHandleState::Downloading;
        });
        self.shared.deliver(EngineAlert::MetadataReceived { handle: id });
    }

    /// Reports one piece as downloaded and verified.
    pub fn finish_piece(&self, id: HandleId, piece_index: u32) {
        self.shared.deliver(EngineAlert::PieceFinished {
            handle: id,
            piece_index,
        });
    }

    /// Publishes a lifecycle state change.
    pub fn publish_state(&self, id: HandleId, state: TorrentHandleState) {
        self.shared.with_torrent_mut(id, |torrent| torrent.state = state);
        self.shared.deliver(EngineAlert::State { handle: id, state });
    }

    /// Stores a stats snapshot and alerts the sink with it.
    pub fn publish_stats(&self, id: HandleId, stats: TorrentStats) {
        self.shared
            .with_torrent_mut(id, |torrent| torrent.stats = stats.clone());
        self.shared.deliver(EngineAlert::Stats { handle: id, stats });
    }

    /// Sets the blob the next `post_save_resume` will hand out.
    pub fn set_resume_blob(&self, id: HandleId, blob: Vec<u8>) {
        self.shared
            .with_torrent_mut(id, |torrent| torrent.resume_blob = blob);
    }

    /// Sets the peer snapshot returned by the handle.
    pub fn set_peers(&self, id: HandleId, peers: Vec<PeerInfo>) {
        self.shared.with_torrent_mut(id, |torrent| torrent.peers = peers);
    }

    /// Every `set_piece_deadline` call for the torrent, in call order.
    pub fn deadline_requests(&self, id: HandleId) -> Vec<(u32, Duration)> {
        self.shared
            .with_torrent(id, |torrent| torrent.deadline_requests.clone())
            .unwrap_or_default()
    }

    /// Resume-data bytes the engine read back at `start_download`, if any.
    pub fn resume_source(&self, id: HandleId) -> Option<Vec<u8>> {
        self.shared
            .with_torrent(id, |torrent| torrent.resume_source.clone())
            .flatten()
    }

    /// Whether the torrent was started.
    pub fn is_started(&self, id: HandleId) -> bool {
        self.shared
            .with_torrent(id, |torrent| torrent.started)
            .unwrap_or(false)
    }

    /// Configs received through `apply_config`, in call order.
    pub fn applied_configs(&self) -> Vec<EngineConfig> {
        self.shared
            .applied_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// File priority previously set through the handle.
    pub fn file_priority(&self, id: HandleId, file_index: u32) -> Option<FilePriority> {
        self.shared
            .with_torrent(id, |torrent| torrent.file_priorities.get(&file_index).copied())
            .flatten()
    }

    /// Trackers added through the handle, in call order.
    pub fn trackers(&self, id: HandleId) -> Vec<(String, u8, u32)> {
        self.shared
            .with_torrent(id, |torrent| torrent.trackers.clone())
            .unwrap_or_default()
    }

    /// Number of live (not yet released) torrents.
    pub fn torrent_count(&self) -> usize {
        self.shared
            .torrents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TorrentManagerSession for SimEngine {
    type Handle = SimTorrentHandle;
    type AddInfo = SimAddInfo;

    fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        *self.shared.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn create_torrent_handle(&self) -> SimTorrentHandle {
        let id = HandleId::new(self.shared.next_handle.fetch_add(1, Ordering::SeqCst));
        self.shared
            .torrents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, SimTorrent::default());
        SimTorrentHandle {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    fn create_add_info(&self) -> SimAddInfo {
        SimAddInfo::default()
    }

    fn start_download(
        &self,
        handle: &SimTorrentHandle,
        add_info: SimAddInfo,
        save_dir: &Path,
    ) -> Result<bool, EngineError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::EngineClosed);
        }
        if self.shared.reject_adds.load(Ordering::SeqCst) {
            tracing::debug!(handle = %handle.id, "sim engine rejecting add");
            return Ok(false);
        }
        // Exactly one way of identifying the torrent must be given.
        if add_info.magnet.is_some() == add_info.torrent_file.is_some() {
            tracing::debug!(handle = %handle.id, "sim engine rejecting malformed add info");
            return Ok(false);
        }

        let resume_source = add_info
            .resume_path
            .as_deref()
            .and_then(|path| std::fs::read(path).ok());

        let mut guard = self
            .shared
            .torrents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let torrent = guard
            .get_mut(&handle.id)
            .ok_or(EngineError::UnknownHandle { handle: handle.id })?;
        if torrent.started {
            return Err(EngineError::AlreadyStarted { handle: handle.id });
        }

        torrent.started = true;
        torrent.magnet = add_info.magnet;
        torrent.torrent_file = add_info.torrent_file;
        torrent.resume_source = resume_source;
        torrent.state = if torrent.descriptor.is_some() {
            TorrentHandleState::Downloading
        } else {
            TorrentHandleState::DownloadingMetadata
        };
        tracing::debug!(
            handle = %handle.id,
            save_dir = %save_dir.display(),
            "sim torrent started"
        );
        Ok(true)
    }

    fn release_handle(&self, handle: &SimTorrentHandle) {
        self.shared
            .torrents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
    }

    fn resume(&self) {
        let mut guard = self
            .shared
            .torrents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for torrent in guard.values_mut() {
            torrent.paused = false;
        }
    }

    fn apply_config(&self, config: &EngineConfig) {
        self.shared
            .applied_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config.clone());
    }
}

/// Handle onto one sim torrent.
#[derive(Clone)]
pub struct SimTorrentHandle {
    id: HandleId,
    shared: Arc<SimShared>,
}

impl TorrentHandle for SimTorrentHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn is_valid(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
            && self.shared.with_torrent(self.id, |_| ()).is_some()
    }

    fn state(&self) -> Option<TorrentHandleState> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.shared.with_torrent(self.id, |torrent| torrent.state)
    }

    fn post_status_updates(&self) {
        let Some(stats) = self.shared.with_torrent(self.id, |t| t.stats.clone()) else {
            return;
        };
        self.shared.deliver(EngineAlert::Stats {
            handle: self.id,
            stats,
        });
    }

    fn post_save_resume(&self) {
        let Some(payload) = self.shared.with_torrent(self.id, |t| t.resume_blob.clone()) else {
            return;
        };
        self.shared.deliver(EngineAlert::ResumeData {
            handle: self.id,
            data: Box::new(SimResumeData { payload }),
        });
    }

    fn resume(&self) {
        self.shared.with_torrent_mut(self.id, |torrent| torrent.paused = false);
    }

    fn set_file_priority(&self, file_index: u32, priority: FilePriority) {
        self.shared.with_torrent_mut(self.id, |torrent| {
            torrent.file_priorities.insert(file_index, priority);
        });
    }

    fn reload_file(&self) -> Result<TorrentDescriptor, EngineError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::EngineClosed);
        }
        self.shared
            .with_torrent(self.id, |torrent| torrent.descriptor.clone())
            .flatten()
            .ok_or(EngineError::MetadataNotReady)
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .with_torrent(self.id, |torrent| torrent.peers.clone())
            .unwrap_or_default()
    }

    fn set_piece_deadline(&self, piece_index: u32, deadline: Duration) {
        self.shared.with_torrent_mut(self.id, |torrent| {
            torrent.deadline_requests.push((piece_index, deadline));
            // A later deadline for the same piece overrides the earlier one.
            torrent.deadlines.insert(piece_index, deadline);
        });
    }

    fn clear_piece_deadlines(&self) {
        self.shared
            .with_torrent_mut(self.id, |torrent| torrent.deadlines.clear());
    }

    fn add_tracker(&self, url: &str, tier: u8, fail_limit: u32) {
        self.shared.with_torrent_mut(self.id, |torrent| {
            torrent.trackers.push((url.to_string(), tier, fail_limit));
        });
    }

    fn magnet_uri(&self) -> Option<String> {
        self.shared
            .with_torrent(self.id, |torrent| torrent.magnet.clone())
            .flatten()
    }
}

/// Add-info builder for the sim engine.
#[derive(Debug, Default)]
pub struct SimAddInfo {
    magnet: Option<String>,
    torrent_file: Option<PathBuf>,
    resume_path: Option<PathBuf>,
}

impl TorrentAddInfo for SimAddInfo {
    fn set_magnet_uri(&mut self, uri: &str) {
        self.magnet = Some(uri.to_string());
    }

    fn set_torrent_file_path(&mut self, path: &Path) {
        self.torrent_file = Some(path.to_path_buf());
    }

    fn set_resume_data_path(&mut self, path: &Path) {
        self.resume_path = Some(path.to_path_buf());
    }
}

/// Opaque resume blob handed out by the sim engine.
#[derive(Debug)]
struct SimResumeData {
    payload: Vec<u8>,
}

#[async_trait]
impl TorrentResumeData for SimResumeData {
    async fn save_to_path(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, &self.payload).await
    }
}
