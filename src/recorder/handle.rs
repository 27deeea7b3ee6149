//! Session registry and recording handles
//!
//! Sessions publish snapshots into a shared registry; handles look their
//! session up by id and never own it. When a session's execution context
//! ends its entry is removed and every handle reads `None` from then on.

use super::state::{RecordingSnapshot, RecordingState};
use crate::utils::error::{RecorderError, RecorderResult, SessionWarning};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Identifies a session within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

struct Entry {
    output_path: PathBuf,
    snapshot: watch::Sender<RecordingSnapshot>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<SessionId, Entry>,
}

/// Live sessions, keyed by id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

/// Compare output paths by their resolved parent directory, since the file
/// itself usually does not exist yet
fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session writing to `output_path`.
    ///
    /// Fails if a live, non-terminal session already writes there.
    pub(crate) fn claim(
        &self,
        output_path: &Path,
        snapshot: RecordingSnapshot,
    ) -> RecorderResult<SessionId> {
        let output_path = normalize(output_path);
        let mut inner = self.inner.write();

        let in_use = inner.entries.values().any(|entry| {
            entry.output_path == output_path && !entry.snapshot.borrow().state.is_terminal()
        });
        if in_use {
            return Err(RecorderError::OutputPathInUse(output_path));
        }

        inner.next_id += 1;
        let id = SessionId(inner.next_id);
        let (tx, _) = watch::channel(snapshot);
        inner.entries.insert(
            id,
            Entry {
                output_path,
                snapshot: tx,
            },
        );

        tracing::debug!("Registered {}", id);
        Ok(id)
    }

    /// Replace the published snapshot and notify watchers
    pub(crate) fn publish(&self, id: SessionId, snapshot: RecordingSnapshot) {
        if let Some(entry) = self.inner.read().entries.get(&id) {
            entry.snapshot.send_replace(snapshot);
        }
    }

    /// Drop the entry; handles and watchers observe the session as gone
    pub(crate) fn invalidate(&self, id: SessionId) {
        if self.inner.write().entries.remove(&id).is_some() {
            tracing::debug!("Invalidated {}", id);
        }
    }

    pub fn handle(&self, id: SessionId) -> RecordingHandle {
        RecordingHandle {
            id,
            registry: self.clone(),
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.read().entries.contains_key(&id)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, id: SessionId, f: impl FnOnce(&RecordingSnapshot) -> T) -> Option<T> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|entry| f(&entry.snapshot.borrow()))
    }
}

/// Non-owning view of one session
#[derive(Clone)]
pub struct RecordingHandle {
    id: SessionId,
    registry: SessionRegistry,
}

impl RecordingHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// `false` once the session has been torn down
    pub fn is_live(&self) -> bool {
        self.registry.contains(self.id)
    }

    pub fn state(&self) -> Option<RecordingState> {
        self.registry.read(self.id, |s| s.state)
    }

    /// Recorded seconds, excluding pauses
    pub fn duration(&self) -> Option<f64> {
        self.registry.read(self.id, |s| s.duration_secs)
    }

    pub fn snapshot(&self) -> Option<RecordingSnapshot> {
        self.registry.read(self.id, RecordingSnapshot::clone)
    }

    pub fn warnings(&self) -> Option<Vec<SessionWarning>> {
        self.registry.read(self.id, |s| s.warnings.clone())
    }

    /// Subscribe to snapshot pushes. The receiver errors on `changed()`
    /// once the session is gone.
    pub fn watch(&self) -> Option<watch::Receiver<RecordingSnapshot>> {
        self.registry
            .inner
            .read()
            .entries
            .get(&self.id)
            .map(|entry| entry.snapshot.subscribe())
    }
}

impl fmt::Debug for RecordingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::config::AudioMode;

    fn snapshot(state: RecordingState) -> RecordingSnapshot {
        RecordingSnapshot {
            state,
            ..RecordingSnapshot::new(AudioMode::SideFile)
        }
    }

    #[test]
    fn test_handle_reads_published_snapshot() {
        let registry = SessionRegistry::new();
        let id = registry
            .claim(Path::new("/tmp/a.mp4"), snapshot(RecordingState::Ready))
            .unwrap();
        let handle = registry.handle(id);

        assert_eq!(handle.state(), Some(RecordingState::Ready));

        let mut next = snapshot(RecordingState::Recording);
        next.duration_secs = 3.5;
        registry.publish(id, next);

        assert_eq!(handle.state(), Some(RecordingState::Recording));
        assert_eq!(handle.duration(), Some(3.5));
    }

    #[test]
    fn test_invalidated_handle_reads_none() {
        let registry = SessionRegistry::new();
        let id = registry
            .claim(Path::new("/tmp/b.mp4"), snapshot(RecordingState::Ready))
            .unwrap();
        let handle = registry.handle(id);

        registry.invalidate(id);

        assert!(!handle.is_live());
        assert!(handle.state().is_none());
        assert!(handle.snapshot().is_none());
        assert!(handle.watch().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_output_path_is_exclusive_until_terminal() {
        let registry = SessionRegistry::new();
        let path = Path::new("/tmp/c.mp4");
        let first = registry.claim(path, snapshot(RecordingState::Ready)).unwrap();

        assert!(matches!(
            registry.claim(path, snapshot(RecordingState::Ready)),
            Err(RecorderError::OutputPathInUse(_))
        ));

        registry.publish(first, snapshot(RecordingState::Finished));
        assert!(registry.claim(path, snapshot(RecordingState::Ready)).is_ok());
    }

    #[tokio::test]
    async fn test_watch_sees_pushes_and_closure() {
        let registry = SessionRegistry::new();
        let id = registry
            .claim(Path::new("/tmp/d.mp4"), snapshot(RecordingState::Ready))
            .unwrap();
        let mut rx = registry.handle(id).watch().unwrap();

        registry.publish(id, snapshot(RecordingState::Paused));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, RecordingState::Paused);

        registry.invalidate(id);
        assert!(rx.changed().await.is_err());
    }
}
