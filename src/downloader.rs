//! Downloader facade: session lifecycle over one engine session.
//!
//! Owns the native engine session, the dispatcher registry and the data
//! root. Adding a torrent builds the engine's add-info, starts the download
//! and registers a [`DownloadSession`] under the engine-assigned handle id;
//! releasing tears both down again.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{EngineConfig, SpindriftConfig};
use crate::engine::{
    AlertSink, EngineError, HandleId, TorrentAddInfo, TorrentManagerSession, TorrentSource,
};
use crate::session::{DownloadSession, SessionDispatcher};

/// Lifecycle manager for download sessions on one engine.
pub struct Downloader<S: TorrentManagerSession> {
    native: S,
    dispatcher: Arc<SessionDispatcher<S::Handle>>,
    save_dir: PathBuf,
    config: SpindriftConfig,
}

impl<S: TorrentManagerSession> Downloader<S> {
    /// Wraps an engine session, wiring its alerts into a fresh dispatcher.
    ///
    /// `save_dir` is where the engine stores save files; every session's
    /// inputs resolve file paths against it.
    pub fn new(native: S, save_dir: PathBuf, config: SpindriftConfig) -> Self {
        let dispatcher = Arc::new(SessionDispatcher::new());
        native.set_alert_sink(Arc::clone(&dispatcher) as Arc<dyn AlertSink>);
        Self {
            native,
            dispatcher,
            save_dir,
            config,
        }
    }

    /// Adds a torrent and registers a session for it.
    ///
    /// `resume_data_path` is both read (handed to the engine so it can skip
    /// re-checking) and written (the session persists future resume blobs
    /// there).
    ///
    /// # Errors
    ///
    /// - `EngineError::StartRejected` - The engine refused the add
    /// - `EngineError::AlreadyStarted` / `EngineError::EngineClosed` -
    ///   Propagated from the engine session
    pub fn add_torrent(
        &self,
        source: &TorrentSource,
        resume_data_path: Option<PathBuf>,
    ) -> Result<Arc<DownloadSession<S::Handle>>, EngineError> {
        let mut add_info = self.native.create_add_info();
        match source {
            TorrentSource::Magnet(uri) => add_info.set_magnet_uri(uri),
            TorrentSource::TorrentFile(path) => add_info.set_torrent_file_path(path),
        }
        if let Some(path) = &resume_data_path {
            add_info.set_resume_data_path(path);
        }

        let handle = self.native.create_torrent_handle();
        let started = self.native.start_download(&handle, add_info, &self.save_dir)?;
        if !started {
            self.native.release_handle(&handle);
            return Err(EngineError::StartRejected {
                reason: "engine refused the add".to_string(),
            });
        }

        let session = Arc::new(DownloadSession::new(
            handle,
            self.save_dir.clone(),
            resume_data_path,
            &self.config,
        ));
        self.dispatcher.register(Arc::clone(&session));
        tracing::info!(handle = %session.id(), "torrent added");
        Ok(session)
    }

    /// Releases the session's engine handle and drops it from the registry.
    pub fn release(&self, session: &Arc<DownloadSession<S::Handle>>) {
        self.dispatcher.unregister(session.id());
        self.native.release_handle(session.handle());
        tracing::info!(handle = %session.id(), "torrent released");
    }

    /// The session registered for `id`, if still live.
    pub fn session(&self, id: HandleId) -> Option<Arc<DownloadSession<S::Handle>>> {
        self.dispatcher.session(id)
    }

    /// The alert registry, for direct dispatch.
    pub fn dispatcher(&self) -> &Arc<SessionDispatcher<S::Handle>> {
        &self.dispatcher
    }

    /// Forwards runtime tuning to the engine.
    pub fn apply_config(&self, config: &EngineConfig) {
        self.native.apply_config(config);
    }

    /// Unpauses every torrent in the engine session.
    pub fn resume(&self) {
        self.native.resume();
    }

    /// Directory the engine stores save files in.
    pub fn save_dir(&self) -> &PathBuf {
        &self.save_dir
    }

    /// Releases every handle and drains the registry.
    pub fn close(&self) {
        let sessions = self.dispatcher.drain();
        tracing::info!(count = sessions.len(), "downloader closing");
        for session in sessions {
            self.native.release_handle(session.handle());
        }
    }
}
