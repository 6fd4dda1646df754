//! Session storage
//!
//! The store is read synchronously on every outgoing request, so reads only
//! ever touch memory: implementations keep the session behind a `RwLock`.
//!
//! `FileSessionStore` persists across process restarts. Mutations update the
//! in-memory copy and queue a snapshot to a background writer task, which
//! applies them with the atomic temp-file + rename scheme; no disk I/O runs
//! while the lock is held. `flush()` waits for the writer to catch up.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::RwLock;

use common::Secret;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::Session;

/// Read/write/clear contract for the current session.
///
/// No validation happens here. Implementations must be safe to call from
/// many tasks at once, and none of the synchronous methods may block on I/O.
pub trait SessionStore: Send + Sync {
    /// Current session, if any.
    fn read(&self) -> Option<Session>;

    /// Replace the current session.
    fn write(&self, session: Session);

    /// Drop the current session. Clearing an empty store is a no-op.
    fn clear(&self);

    /// Replace only the access credential after a refresh.
    ///
    /// Does nothing when no session exists: a teardown that raced the
    /// refresh wins.
    fn set_access(&self, access: String) {
        if let Some(mut session) = self.read() {
            session.access = Secret::new(access);
            self.write(session);
        }
    }

    /// Wait until every mutation made so far has reached the backing medium.
    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(std::future::ready(()))
    }

    /// Name of the backing medium, for logs.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Process-lifetime session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn read(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write(&self, session: Session) {
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
    }

    fn clear(&self) {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn set_access(&self, access: String) {
        let mut guard = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(session) = guard.as_mut() {
            session.access = Secret::new(access);
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Session store backed by a JSON file.
///
/// The in-memory copy is authoritative for reads. Each mutation bumps a
/// generation and queues a snapshot while still under the lock, so the writer
/// sees snapshots in mutation order. The writer only applies the newest one it
/// has. Disk failures are logged and do not fail the request path; the
/// in-memory session stays usable.
pub struct FileSessionStore {
    path: PathBuf,
    state: RwLock<FileState>,
    snapshots: mpsc::UnboundedSender<Snapshot>,
    persisted: watch::Receiver<u64>,
}

struct FileState {
    session: Option<Session>,
    generation: u64,
}

struct Snapshot {
    generation: u64,
    session: Option<Session>,
}

impl FileSessionStore {
    /// Load the session from `path` and start the writer task.
    ///
    /// A missing file is a cold start with no session. Must be called from
    /// within a tokio runtime.
    pub fn load(path: PathBuf) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Io(format!("file session store needs a tokio runtime: {e}")))?;

        let session = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let session: Session = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing session file: {e}")))?;
            info!(path = %path.display(), role = %session.role, "loaded session");
            Some(session)
        } else {
            debug!(path = %path.display(), "session file not found, starting signed out");
            None
        };

        let (snapshots, queue) = mpsc::unbounded_channel();
        let (done, persisted) = watch::channel(0);
        runtime.spawn(persist_loop(path.clone(), queue, done));

        Ok(Self {
            path,
            state: RwLock::new(FileState {
                session,
                generation: 0,
            }),
            snapshots,
            persisted,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to the in-memory session; queue a snapshot if it did anything.
    fn update(&self, change: impl FnOnce(&mut Option<Session>) -> bool) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !change(&mut state.session) {
            return;
        }
        state.generation += 1;
        let snapshot = Snapshot {
            generation: state.generation,
            session: state.session.clone(),
        };
        if self.snapshots.send(snapshot).is_err() {
            warn!(path = %self.path.display(), "session writer stopped, change kept in memory only");
        }
    }
}

impl SessionStore for FileSessionStore {
    fn read(&self) -> Option<Session> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .session
            .clone()
    }

    fn write(&self, session: Session) {
        self.update(|current| {
            *current = Some(session);
            true
        });
    }

    fn clear(&self) {
        self.update(|current| current.take().is_some());
    }

    fn set_access(&self, access: String) {
        self.update(|current| match current.as_mut() {
            Some(session) => {
                session.access = Secret::new(access);
                true
            }
            None => false,
        });
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let target = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .generation;
        let mut persisted = self.persisted.clone();
        Box::pin(async move {
            if persisted.wait_for(|done| *done >= target).await.is_err() {
                warn!("session writer stopped before flushing");
            }
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Drain queued snapshots and write the newest one to disk.
async fn persist_loop(
    path: PathBuf,
    mut queue: mpsc::UnboundedReceiver<Snapshot>,
    done: watch::Sender<u64>,
) {
    while let Some(mut snapshot) = queue.recv().await {
        while let Ok(newer) = queue.try_recv() {
            snapshot = newer;
        }

        let result = match &snapshot.session {
            Some(session) => write_atomic(&path, session).await,
            None => remove_file(&path).await,
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist session");
        }
        done.send_replace(snapshot.generation);
    }
    debug!(path = %path.display(), "session writer stopped");
}

/// Write the session to a file atomically.
///
/// Writes a temp file in the same directory, then renames it over the target.
/// Permissions are 0600 on unix since the file holds live credentials.
async fn write_atomic(path: &Path, session: &Session) -> Result<()> {
    let json = serde_json::to_string_pretty(session)
        .map_err(|e| Error::Parse(format!("serializing session: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating session directory: {e}")))?;
    }

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed session file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(format!("removing session file: {e}"))),
    }
}
