//! Per-torrent sessions: engine alerts in, piece state and streams out.
//!
//! A [`DownloadSession`] owns the engine handle for one torrent. The
//! dispatcher feeds it alerts in engine order; the session turns them into
//! piece-state transitions (releasing blocked reads), a stats broadcast, a
//! lifecycle-state stream, and resume-data writes. It also opens
//! [`TorrentInput`]s whose wait hook sets piece deadlines through the handle.

pub mod dispatcher;

pub use dispatcher::SessionDispatcher;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::config::SpindriftConfig;
use crate::engine::{
    EngineAlert, EngineError, FilePriority, HandleId, PeerInfo, TorrentDescriptor, TorrentHandle,
    TorrentHandleState, TorrentResumeData, TorrentStats,
};
use crate::input::{InputError, PieceWaitListener, TorrentFileView, TorrentInput};
use crate::piece::{PieceList, PieceState};

/// Wait hook that asks the engine to hurry the piece the reader is stuck on.
struct DeadlineHint<H> {
    handle: H,
    deadline: Duration,
}

#[async_trait]
impl<H: TorrentHandle> PieceWaitListener for DeadlineHint<H> {
    async fn on_piece_wait(&self, piece_index: u32) {
        tracing::debug!(piece = piece_index, "deadline hint for stalled read");
        self.handle.set_piece_deadline(piece_index, self.deadline);
    }
}

/// Live session for one torrent.
pub struct DownloadSession<H: TorrentHandle> {
    handle: H,
    save_dir: PathBuf,
    resume_data_path: Option<PathBuf>,
    piece_deadline: Duration,
    buffer_size: u64,
    descriptor: RwLock<Option<TorrentDescriptor>>,
    pieces: OnceLock<PieceList>,
    stats_tx: broadcast::Sender<TorrentStats>,
    state_tx: watch::Sender<Option<TorrentHandleState>>,
}

impl<H> DownloadSession<H>
where
    H: TorrentHandle + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        handle: H,
        save_dir: PathBuf,
        resume_data_path: Option<PathBuf>,
        config: &SpindriftConfig,
    ) -> Self {
        let (stats_tx, _) = broadcast::channel(config.session.stats_capacity);
        let (state_tx, _) = watch::channel(handle.state());
        Self {
            handle,
            save_dir,
            resume_data_path,
            piece_deadline: config.session.piece_deadline,
            buffer_size: config.input.buffer_size,
            descriptor: RwLock::new(None),
            pieces: OnceLock::new(),
            stats_tx,
            state_tx,
        }
    }

    /// Engine identifier of the torrent this session is bound to.
    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    /// The engine handle this session drives.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Subscribes to stats snapshots in engine delivery order.
    pub fn stats(&self) -> broadcast::Receiver<TorrentStats> {
        self.stats_tx.subscribe()
    }

    /// Subscribes to lifecycle state updates. Holds `None` until the engine
    /// reports a state (or when the engine session is closed).
    pub fn state(&self) -> watch::Receiver<Option<TorrentHandleState>> {
        self.state_tx.subscribe()
    }

    /// Torrent metadata, once it has been received.
    pub fn descriptor(&self) -> Option<TorrentDescriptor> {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The torrent-global piece list, once metadata has been received.
    pub fn pieces(&self) -> Option<&PieceList> {
        self.pieces.get()
    }

    /// Asks the engine for a stats snapshot. Fire-and-forget; the snapshot
    /// arrives on the [`DownloadSession::stats`] stream.
    pub fn request_stats(&self) {
        self.handle.post_status_updates();
    }

    /// Asks the engine to produce resume data. Fire-and-forget; the blob is
    /// persisted at the session's resume path when it arrives.
    pub fn request_save_resume(&self) {
        self.handle.post_save_resume();
    }

    /// Unpauses the torrent.
    pub fn resume(&self) {
        self.handle.resume();
    }

    /// Snapshot of connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.handle.peers()
    }

    /// Selects how eagerly one file is downloaded.
    pub fn set_file_priority(&self, file_index: u32, priority: FilePriority) {
        self.handle.set_file_priority(file_index, priority);
    }

    /// Magnet URI of the torrent, when derivable.
    pub fn magnet_uri(&self) -> Option<String> {
        self.handle.magnet_uri()
    }

    /// Current engine state.
    ///
    /// # Errors
    ///
    /// - `EngineError::EngineClosed` - The engine session is closed; this
    ///   session should be released
    pub fn engine_state(&self) -> Result<TorrentHandleState, EngineError> {
        self.handle.state().ok_or(EngineError::EngineClosed)
    }

    /// Opens a streaming input over one file of the torrent.
    ///
    /// The input's wait hook sets a piece deadline through this session's
    /// handle, so stalled reads pull the swarm toward the cursor.
    ///
    /// # Errors
    ///
    /// - `EngineError::MetadataNotReady` - Metadata has not arrived yet
    /// - `InputError::InvariantViolation` - `file_index` is out of range or
    ///   the piece space does not cover the file
    /// - `InputError::Io` - The save file could not be opened
    pub async fn open_input(&self, file_index: usize) -> crate::Result<TorrentInput> {
        let descriptor = self.descriptor().ok_or(EngineError::MetadataNotReady)?;
        let pieces = self.pieces.get().ok_or(EngineError::MetadataNotReady)?;
        let file = descriptor
            .files
            .get(file_index)
            .ok_or_else(|| InputError::InvariantViolation {
                reason: format!(
                    "file index {file_index} out of range ({} files)",
                    descriptor.files.len()
                ),
            })?;
        let start_offset = descriptor
            .file_start_offset(file_index)
            .unwrap_or_default();

        let first_piece = (start_offset / descriptor.piece_length) as u32;
        let last_byte = start_offset + file.len.saturating_sub(1);
        let last_piece = (last_byte / descriptor.piece_length) as u32;
        let view_pieces =
            pieces
                .view(first_piece, last_piece)
                .ok_or_else(|| InputError::InvariantViolation {
                    reason: format!(
                        "pieces {first_piece}..={last_piece} not inside the torrent's piece space"
                    ),
                })?;
        let view = TorrentFileView::new(view_pieces, start_offset, file.len);

        let save_path = self.save_dir.join(&file.path);
        let listener = Arc::new(DeadlineHint {
            handle: self.handle.clone(),
            deadline: self.piece_deadline,
        });
        let input = TorrentInput::open(&save_path, view, self.buffer_size, listener).await?;
        Ok(input)
    }

    /// Applies one engine alert. Called by the dispatcher's drain task, so
    /// alerts for this session arrive strictly in delivery order.
    pub(crate) async fn on_alert(&self, alert: EngineAlert) {
        match alert {
            EngineAlert::Stats { stats, .. } => {
                // No receivers is fine; stats are droppable.
                let _ = self.stats_tx.send(stats);
            }
            EngineAlert::State { state, .. } => {
                self.state_tx.send_replace(Some(state));
            }
            EngineAlert::PieceFinished { piece_index, .. } => {
                self.finish_piece(piece_index);
            }
            EngineAlert::MetadataReceived { .. } => {
                self.load_metadata();
            }
            EngineAlert::ResumeData { data, .. } => {
                self.persist_resume_data(data).await;
            }
        }
    }

    fn finish_piece(&self, piece_index: u32) {
        match self.pieces.get().and_then(|pieces| pieces.by_index(piece_index)) {
            Some(piece) => {
                piece.set_state(PieceState::Finished);
                tracing::trace!(handle = %self.id(), piece = piece_index, "piece finished");
            }
            None => {
                tracing::trace!(
                    handle = %self.id(),
                    piece = piece_index,
                    "finished alert before metadata; ignored"
                );
            }
        }
    }

    fn load_metadata(&self) {
        match self.handle.reload_file() {
            Ok(descriptor) => {
                let _ = self.pieces.set(descriptor.piece_list());
                tracing::debug!(
                    handle = %self.id(),
                    name = %descriptor.name,
                    pieces = descriptor.num_pieces,
                    "metadata received"
                );
                *self
                    .descriptor
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(descriptor);
            }
            Err(error) => {
                tracing::warn!(handle = %self.id(), error = %error, "metadata reload failed");
            }
        }
    }

    async fn persist_resume_data(&self, data: Box<dyn TorrentResumeData>) {
        let Some(path) = &self.resume_data_path else {
            tracing::trace!(handle = %self.id(), "resume data dropped: no path configured");
            return;
        };
        match data.save_to_path(path).await {
            Ok(()) => {
                tracing::debug!(handle = %self.id(), path = %path.display(), "resume data saved");
            }
            Err(error) => {
                tracing::warn!(
                    handle = %self.id(),
                    path = %path.display(),
                    error = %error,
                    "failed to save resume data"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::engine::{AlertSink, TorrentManagerSession};

    fn test_session(engine: &SimEngine) -> Arc<DownloadSession<crate::engine::sim::SimTorrentHandle>> {
        let handle = engine.create_torrent_handle();
        Arc::new(DownloadSession::new(
            handle,
            PathBuf::from("/tmp"),
            None,
            &SpindriftConfig::default(),
        ))
    }

    fn two_piece_descriptor() -> TorrentDescriptor {
        TorrentDescriptor {
            name: "demo".to_string(),
            num_pieces: 2,
            piece_length: 16,
            last_piece_len: 8,
            files: vec![crate::engine::TorrentFileInfo {
                name: "demo.bin".to_string(),
                path: PathBuf::from("demo.bin"),
                len: 24,
            }],
        }
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_handle_id() {
        let engine = SimEngine::new();
        let dispatcher = Arc::new(SessionDispatcher::new());

        let session_a = test_session(&engine);
        let session_b = test_session(&engine);
        dispatcher.register(Arc::clone(&session_a));
        dispatcher.register(Arc::clone(&session_b));

        let mut hit = None;
        dispatcher.dispatch_to_session(session_b.id(), |session| hit = Some(session.id()));
        assert_eq!(hit, Some(session_b.id()));
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_to_released_handle_is_silent() {
        let engine = SimEngine::new();
        let dispatcher = Arc::new(SessionDispatcher::new());

        let session = test_session(&engine);
        let id = session.id();
        dispatcher.register(Arc::clone(&session));
        assert!(dispatcher.unregister(id).is_some());

        let mut called = false;
        dispatcher.dispatch_to_session(id, |_| called = true);
        assert!(!called);

        // Alerts after release are dropped without error.
        dispatcher.deliver(EngineAlert::PieceFinished {
            handle: id,
            piece_index: 0,
        });
    }

    #[tokio::test]
    async fn test_stats_arrive_in_engine_order() {
        let engine = SimEngine::new();
        let dispatcher = Arc::new(SessionDispatcher::new());
        let session = test_session(&engine);
        let mut stats = session.stats();
        dispatcher.register(Arc::clone(&session));

        for done in [100u64, 200] {
            dispatcher.deliver(EngineAlert::Stats {
                handle: session.id(),
                stats: TorrentStats {
                    total_done: done,
                    ..TorrentStats::default()
                },
            });
        }

        let first = tokio::time::timeout(Duration::from_secs(1), stats.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), stats.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.total_done, 100);
        assert_eq!(second.total_done, 200);
    }

    #[tokio::test]
    async fn test_piece_finished_alert_releases_waiters() {
        let engine = SimEngine::new();
        let dispatcher = Arc::new(SessionDispatcher::new());
        let session = test_session(&engine);
        let id = session.id();
        dispatcher.register(Arc::clone(&session));

        engine.set_alert_sink(dispatcher.clone() as Arc<dyn AlertSink>);
        engine.publish_metadata(id, two_piece_descriptor());

        // Wait for the metadata alert to be drained.
        tokio::time::timeout(Duration::from_secs(1), async {
            while session.pieces().is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let pieces = session.pieces().unwrap().clone();
        let waiter = {
            let piece = pieces.by_index(1).unwrap();
            assert!(!piece.is_finished());
            let pieces = pieces.clone();
            tokio::spawn(async move {
                pieces.by_index(1).unwrap().wait_finished().await;
            })
        };

        engine.finish_piece(id, 1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("piece wait did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_stream_follows_alerts() {
        let engine = SimEngine::new();
        let dispatcher = Arc::new(SessionDispatcher::new());
        let session = test_session(&engine);
        let mut state = session.state();
        dispatcher.register(Arc::clone(&session));

        dispatcher.deliver(EngineAlert::State {
            handle: session.id(),
            state: TorrentHandleState::Seeding,
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                state.changed().await.unwrap();
                if *state.borrow() == Some(TorrentHandleState::Seeding) {
                    break;
                }
            }
        })
        .await
        .expect("state update not observed");
    }
}
