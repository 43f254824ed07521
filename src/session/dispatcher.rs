//! Routes engine alerts to the session that owns the handle.
//!
//! The engine delivers callbacks on its own thread and must never block
//! there: `deliver` is a read-locked map lookup plus an unbounded channel
//! send. Each registered session drains its own queue on a dedicated task,
//! so alerts for one handle are processed in delivery order while different
//! handles proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use super::DownloadSession;
use crate::engine::{AlertSink, EngineAlert, HandleId, TorrentHandle};

struct SessionEntry<H: TorrentHandle> {
    session: Arc<DownloadSession<H>>,
    alerts: mpsc::UnboundedSender<EngineAlert>,
}

/// Registry mapping live handle ids to their sessions.
pub struct SessionDispatcher<H: TorrentHandle> {
    entries: RwLock<HashMap<HandleId, SessionEntry<H>>>,
}

impl<H> Default for SessionDispatcher<H>
where
    H: TorrentHandle + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionDispatcher<H>
where
    H: TorrentHandle + Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a session under its handle id and spawns its drain task.
    ///
    /// Must run inside a tokio runtime. Re-registering an id replaces the
    /// previous entry; its drain task winds down once the old sender drops.
    pub fn register(&self, session: Arc<DownloadSession<H>>) {
        let (alerts, mut queue) = mpsc::unbounded_channel();
        let drained = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(alert) = queue.recv().await {
                drained.on_alert(alert).await;
            }
        });

        let id = session.id();
        let replaced = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, SessionEntry { session, alerts });
        if replaced.is_some() {
            tracing::warn!(handle = %id, "session re-registered over a live entry");
        } else {
            tracing::debug!(handle = %id, "session registered");
        }
    }

    /// Removes and returns the session for `id`, if registered.
    pub fn unregister(&self, id: HandleId) -> Option<Arc<DownloadSession<H>>> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            tracing::debug!(handle = %id, "session unregistered");
        }
        removed.map(|entry| entry.session)
    }

    /// The session registered for `id`, if any.
    pub fn session(&self, id: HandleId) -> Option<Arc<DownloadSession<H>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Runs `action` against the session registered for `id`; silently does
    /// nothing when no session is registered. Dropping is safe because
    /// engine callbacks for released handles are expected.
    pub fn dispatch_to_session(&self, id: HandleId, action: impl FnOnce(&Arc<DownloadSession<H>>)) {
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match guard.get(&id) {
            Some(entry) => action(&entry.session),
            None => tracing::trace!(handle = %id, "dispatch target not registered"),
        }
    }

    /// Removes every entry, returning the drained sessions.
    pub fn drain(&self) -> Vec<Arc<DownloadSession<H>>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry.session)
            .collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H> AlertSink for SessionDispatcher<H>
where
    H: TorrentHandle + Clone + Send + Sync + 'static,
{
    fn deliver(&self, alert: EngineAlert) {
        let id = alert.handle();
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match guard.get(&id) {
            // The drain task may already be gone during teardown; a failed
            // send is equivalent to an unknown handle.
            Some(entry) => {
                let _ = entry.alerts.send(alert);
            }
            None => tracing::trace!(handle = %id, "alert for unknown handle dropped"),
        }
    }
}
