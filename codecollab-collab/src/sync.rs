//! Edit synchronizer: persist-then-broadcast of full-content file edits.
//!
//! ```text
//! codeChange(P, F, content) from conn
//!   │
//!   ├─ 1. conn ∈ room(P)?              no ──► NotInRoom (dropped)
//!   ├─ 2. lock(F)
//!   ├─ 3. store.overwrite_content(P, F)  err ──► dropped, nothing broadcast
//!   ├─ 4. publish codeUpdate(F, content) to room(P) \ {conn}
//!   └─ 5. unlock(F)
//! ```
//!
//! Conflict policy is last-writer-wins by arrival order: no versions, no
//! merge. Two clients editing the same file concurrently overwrite each other
//! and the later arrival wins. Holding the per-file lock across persist and
//! publish makes the broadcast order equal the persist order, so the last
//! `codeUpdate` every peer sees for a file is the content that is stored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use codecollab_core::{EditEvent, FileId, ProjectId};

use crate::broadcast::RoomBroadcaster;
use crate::protocol::{ProtocolError, ServerEvent};
use crate::registry::{ConnectionId, SessionRegistry};
use crate::storage::{Persistence, StoreError};

/// Why an inbound event was not applied.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connection {conn} is not in room project-{project_id}")]
    NotInRoom {
        conn: ConnectionId,
        project_id: ProjectId,
    },
    #[error("File {file_id} is not part of project {project_id}")]
    FileNotInProject {
        project_id: ProjectId,
        file_id: FileId,
    },
    #[error("Message content is empty")]
    EmptyMessage,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Store task failed: {0}")]
    Task(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Validation failures are caused by the client, not by the server.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::NotInRoom { .. } | SyncError::FileNotInProject { .. } | SyncError::EmptyMessage
        )
    }
}

/// Edit synchronizer statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub edits_applied: u64,
    pub edits_rejected: u64,
    pub persist_failures: u64,
}

#[derive(Default)]
struct AtomicSyncStats {
    edits_applied: AtomicU64,
    edits_rejected: AtomicU64,
    persist_failures: AtomicU64,
}

/// Per-file async locks, created on demand and dropped when uncontended.
#[derive(Default)]
struct FileLocks {
    locks: Mutex<HashMap<FileId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocks {
    async fn lock(&self, file_id: FileId) -> FileGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(file_id).or_default().clone()
        };
        let guard = mutex.clone().lock_owned().await;
        FileGuard {
            locks: self,
            file_id,
            mutex,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct FileGuard<'a> {
    locks: &'a FileLocks,
    file_id: FileId,
    mutex: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this guard still hold it: nobody is waiting
        if Arc::strong_count(&self.mutex) == 2 {
            locks.remove(&self.file_id);
        }
    }
}

/// Applies `codeChange` events: validate, persist, then fan out.
pub struct EditSynchronizer {
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<RoomBroadcaster>,
    store: Arc<dyn Persistence>,
    file_locks: FileLocks,
    stats: AtomicSyncStats,
}

impl EditSynchronizer {
    pub fn new(broadcaster: Arc<RoomBroadcaster>, store: Arc<dyn Persistence>) -> Self {
        Self {
            registry: broadcaster.registry().clone(),
            broadcaster,
            store,
            file_locks: FileLocks::default(),
            stats: AtomicSyncStats::default(),
        }
    }

    /// Handle one edit from `sender`.
    ///
    /// Returns the number of peers the resulting `codeUpdate` was queued for.
    /// On any error nothing is broadcast and nothing is sent to the sender.
    pub async fn on_edit_event(&self, sender: ConnectionId, edit: EditEvent) -> Result<usize, SyncError> {
        let EditEvent {
            project_id,
            file_id,
            content,
        } = edit;

        if !self.registry.is_member(sender, project_id).await {
            self.stats.edits_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::NotInRoom {
                conn: sender,
                project_id,
            });
        }

        let _file_guard = self.file_locks.lock(file_id).await;

        let store = self.store.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            store
                .overwrite_content(project_id, file_id, &content)
                .map(|()| content)
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?;

        let content = match persisted {
            Ok(content) => content,
            Err(StoreError::FileNotFound(_) | StoreError::FileNotInProject { .. }) => {
                self.stats.edits_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SyncError::FileNotInProject {
                    project_id,
                    file_id,
                });
            }
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                return Err(SyncError::Store(e));
            }
        };

        let update = ServerEvent::CodeUpdate { file_id, content };
        let delivered = self
            .broadcaster
            .publish(project_id, &update, Some(sender))
            .await?;

        self.stats.edits_applied.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "File {file_id} in {} updated by {sender}, relayed to {delivered} peer(s)",
            project_id.room_name()
        );
        Ok(delivered)
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            edits_applied: self.stats.edits_applied.load(Ordering::Relaxed),
            edits_rejected: self.stats.edits_rejected.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
        }
    }
}
