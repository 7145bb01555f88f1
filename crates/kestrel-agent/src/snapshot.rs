//! File snapshots for undo/redo.
//!
//! Before a mutating tool runs, the pre-state of its target file is captured.
//! At the end of the turn the captures are committed as one
//! [`ConversationSnapshot`] tied to the history index of the turn's user
//! message.  Files whose content did not actually change are dropped at
//! commit time, so repeating an identical write never produces a second
//! snapshot for that path.
//!
//! [`SnapshotStore::undo`] rolls files back to how they were before a given
//! message; [`SnapshotStore::redo`] re-applies the most recent undo.  Both are
//! best-effort: individual write or delete failures are collected and the
//! remaining files are still restored.
//!
//! All state is held in memory for the lifetime of the session.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared handle used by the orchestrator and the snapshot middleware.
pub type SnapshotHandle = Arc<Mutex<SnapshotStore>>;

/// Characters of the user message kept as a snapshot preview.
const PREVIEW_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Retention limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLimits {
    /// Oldest snapshots are evicted beyond this count.
    pub max_snapshots: usize,
    /// Files larger than this are never captured.
    pub max_file_bytes: u64,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            max_snapshots: 50,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// The state of one file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub path: PathBuf,
    /// Empty when the file did not exist.
    pub content: Vec<u8>,
    pub existed_before: bool,
}

/// Pre-states of every file a turn changed.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub id: Uuid,
    /// History length right after the turn's user message was appended.
    pub message_index: usize,
    pub timestamp: DateTime<Utc>,
    pub message_preview: String,
    pub files: Vec<FileSnapshot>,
}

/// What [`SnapshotStore::redo`] needs to re-apply an undo.
#[derive(Debug, Clone)]
pub struct RedoState {
    pub target_message_index: usize,
    /// File contents as they were just before the undo.
    pub files: Vec<FileSnapshot>,
    pub removed_message_count: usize,
    /// Snapshots the undo discarded; restored on redo so the turn can be
    /// undone again.
    pub snapshots: Vec<ConversationSnapshot>,
}

/// A single file that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreError {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Result of an undo.
#[derive(Debug, Clone, Default)]
pub struct UndoReport {
    pub restored: Vec<PathBuf>,
    pub errors: Vec<RestoreError>,
    /// Number of snapshots that were rolled back.
    pub snapshots_undone: usize,
}

/// Result of a redo.
#[derive(Debug, Clone, Default)]
pub struct RedoReport {
    pub target_message_index: usize,
    pub removed_message_count: usize,
    pub restored: Vec<PathBuf>,
    pub errors: Vec<RestoreError>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory snapshot and redo bookkeeping for one session.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    limits: SnapshotLimits,
    snapshots: VecDeque<ConversationSnapshot>,
    /// Captures of the turn in progress, one per path.
    pending: Vec<FileSnapshot>,
    /// Last observed content per path (`None` = absent).
    cache: HashMap<PathBuf, Option<Vec<u8>>>,
    redo_stack: Vec<RedoState>,
}

impl SnapshotStore {
    pub fn new(limits: SnapshotLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Create a store wrapped for sharing.
    pub fn shared(limits: SnapshotLimits) -> SnapshotHandle {
        Arc::new(Mutex::new(Self::new(limits)))
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &ConversationSnapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record the pre-state of `path` before a mutation.
    ///
    /// Returns `false` when nothing was captured: the path is already
    /// captured for this turn, the file is over the size ceiling, or it could
    /// not be read.
    pub async fn capture(&mut self, path: &Path) -> bool {
        if self.pending.iter().any(|f| f.path == path) {
            return false;
        }

        let state = match read_state(path, self.limits.max_file_bytes).await {
            ReadState::Present(bytes) => FileSnapshot {
                path: path.to_path_buf(),
                content: bytes,
                existed_before: true,
            },
            ReadState::Absent => FileSnapshot {
                path: path.to_path_buf(),
                content: Vec::new(),
                existed_before: false,
            },
            ReadState::TooLarge(size) => {
                tracing::debug!(path = %path.display(), size, "file too large to snapshot");
                return false;
            }
            ReadState::Unreadable(reason) => {
                tracing::warn!(path = %path.display(), reason = %reason, "cannot snapshot file");
                return false;
            }
        };

        self.cache.insert(
            state.path.clone(),
            state.existed_before.then(|| state.content.clone()),
        );
        self.pending.push(state);
        true
    }

    /// Commit the pending captures under `message_index`.
    ///
    /// Only files whose current content differs from the cached pre-state
    /// are kept.  Returns the id of the new snapshot, or `None` when no file
    /// changed.
    pub async fn commit(&mut self, message_index: usize, preview: &str) -> Option<Uuid> {
        let pending = std::mem::take(&mut self.pending);
        let mut files = Vec::with_capacity(pending.len());

        for pre in pending {
            let post = match read_state(&pre.path, self.limits.max_file_bytes).await {
                ReadState::Present(bytes) => Some(bytes),
                ReadState::Absent => None,
                ReadState::TooLarge(size) => {
                    tracing::debug!(path = %pre.path.display(), size, "file grew past snapshot ceiling");
                    continue;
                }
                ReadState::Unreadable(reason) => {
                    tracing::warn!(path = %pre.path.display(), reason = %reason, "cannot read post-state");
                    continue;
                }
            };

            let cached = self.cache.get(&pre.path).cloned().flatten();
            if post == cached {
                tracing::debug!(path = %pre.path.display(), "content unchanged, not snapshotting");
                continue;
            }

            self.cache.insert(pre.path.clone(), post);
            files.push(pre);
        }

        if files.is_empty() {
            return None;
        }

        let snapshot = ConversationSnapshot {
            id: Uuid::now_v7(),
            message_index,
            timestamp: Utc::now(),
            message_preview: preview.chars().take(PREVIEW_CHARS).collect(),
            files,
        };
        let id = snapshot.id;

        tracing::info!(
            snapshot_id = %id,
            message_index,
            files = snapshot.files.len(),
            "committed file snapshot"
        );

        self.insert_ordered(snapshot);
        self.redo_stack.clear();

        while self.snapshots.len() > self.limits.max_snapshots {
            if let Some(evicted) = self.snapshots.pop_front() {
                tracing::debug!(snapshot_id = %evicted.id, "evicted oldest snapshot");
            }
        }

        Some(id)
    }

    /// Forget the captures of the turn in progress.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Roll files back to their state before `target_message_index`.
    ///
    /// `removed_message_count` is carried into the redo state so the caller
    /// can restore its history on redo.
    pub async fn undo(
        &mut self,
        target_message_index: usize,
        removed_message_count: usize,
    ) -> UndoReport {
        let (undone, kept): (Vec<_>, Vec<_>) = self
            .snapshots
            .drain(..)
            .partition(|s| s.message_index > target_message_index);
        self.snapshots = kept.into();

        // Ascending index order: the first version seen per path is the one
        // closest to the target.
        let mut merged: Vec<FileSnapshot> = Vec::new();
        for snapshot in &undone {
            for file in &snapshot.files {
                if !merged.iter().any(|f| f.path == file.path) {
                    merged.push(file.clone());
                }
            }
        }

        let mut current = Vec::with_capacity(merged.len());
        for file in &merged {
            let state = match read_state(&file.path, u64::MAX).await {
                ReadState::Present(bytes) => FileSnapshot {
                    path: file.path.clone(),
                    content: bytes,
                    existed_before: true,
                },
                _ => FileSnapshot {
                    path: file.path.clone(),
                    content: Vec::new(),
                    existed_before: false,
                },
            };
            current.push(state);
        }

        let (restored, errors) = self.apply(&merged).await;

        tracing::info!(
            target_message_index,
            snapshots = undone.len(),
            restored = restored.len(),
            errors = errors.len(),
            "undo applied"
        );

        let snapshots_undone = undone.len();
        self.redo_stack.push(RedoState {
            target_message_index,
            files: current,
            removed_message_count,
            snapshots: undone,
        });

        UndoReport {
            restored,
            errors,
            snapshots_undone,
        }
    }

    /// Re-apply the most recent undo.  Returns `None` when there is nothing
    /// to redo.
    pub async fn redo(&mut self) -> Option<RedoReport> {
        let state = self.redo_stack.pop()?;
        let (restored, errors) = self.apply(&state.files).await;

        for snapshot in state.snapshots {
            self.insert_ordered(snapshot);
        }

        tracing::info!(
            target_message_index = state.target_message_index,
            restored = restored.len(),
            errors = errors.len(),
            "redo applied"
        );

        Some(RedoReport {
            target_message_index: state.target_message_index,
            removed_message_count: state.removed_message_count,
            restored,
            errors,
        })
    }

    /// Drop all redo states.
    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    /// Explicit reset: forget everything.
    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.pending.clear();
        self.cache.clear();
        self.redo_stack.clear();
    }

    fn insert_ordered(&mut self, snapshot: ConversationSnapshot) {
        let pos = self
            .snapshots
            .iter()
            .position(|s| s.message_index > snapshot.message_index)
            .unwrap_or(self.snapshots.len());
        self.snapshots.insert(pos, snapshot);
    }

    /// Write each file back (or delete it if it did not exist), collecting
    /// failures.
    async fn apply(&mut self, files: &[FileSnapshot]) -> (Vec<PathBuf>, Vec<RestoreError>) {
        let mut restored = Vec::new();
        let mut errors = Vec::new();

        for file in files {
            let outcome = if file.existed_before {
                write_file(&file.path, &file.content).await
            } else {
                match tokio::fs::remove_file(&file.path).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            };

            match outcome {
                Ok(()) => {
                    self.cache.insert(
                        file.path.clone(),
                        file.existed_before.then(|| file.content.clone()),
                    );
                    restored.push(file.path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %file.path.display(), error = %e, "restore failed");
                    errors.push(RestoreError {
                        path: file.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        (restored, errors)
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

enum ReadState {
    Present(Vec<u8>),
    Absent,
    TooLarge(u64),
    Unreadable(String),
}

async fn read_state(path: &Path, max_bytes: u64) -> ReadState {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > max_bytes => return ReadState::TooLarge(meta.len()),
        Ok(meta) if meta.is_dir() => return ReadState::Unreadable("is a directory".into()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ReadState::Absent,
        Err(e) => return ReadState::Unreadable(e.to_string()),
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => ReadState::Present(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReadState::Absent,
        Err(e) => ReadState::Unreadable(e.to_string()),
    }
}

async fn write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, content).await
}
