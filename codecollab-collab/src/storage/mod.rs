//! Persistent storage for projects, files, members and chat.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   overwrite_content   ┌──────────────┐
//! │ EditSynchronizer │ ────────────────────► │              │
//! └──────────────────┘                       │  Persistence │
//! ┌──────────────────┐   append_message      │   (trait)    │
//! │ ChatRelay        │ ────────────────────► │              │
//! └──────────────────┘                       └──────┬───────┘
//!                                                   │ impl
//!                                                   ▼
//!                       ┌──────────────────────────────────────┐
//!                       │ RocksStore (RocksDB column families) │
//!                       │ projects, files, contents (LZ4),     │
//!                       │ project_files, members, users,       │
//!                       │ messages, meta                       │
//!                       └──────────────────────────────────────┘
//! ```
//!
//! The realtime layer only depends on [`Persistence`]. The wider CRUD API on
//! [`RocksStore`] is what an HTTP layer would call to create projects and
//! files or to read chat history.

pub mod rocks;

use codecollab_core::{FileId, Message, ProjectId, User, UserId};

pub use rocks::{RocksStore, StoreConfig, StoreError};

/// The store operations the realtime core needs.
///
/// Calls are synchronous; async callers run them on the blocking pool.
pub trait Persistence: Send + Sync + 'static {
    /// Unconditionally replace the content of `file_id`.
    ///
    /// Fails with [`StoreError::FileNotInProject`] when the file exists but
    /// belongs to another project, and [`StoreError::FileNotFound`] when it
    /// does not exist at all.
    fn overwrite_content(
        &self,
        project_id: ProjectId,
        file_id: FileId,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Append a chat message authored by `author_id`.
    fn append_message(
        &self,
        project_id: ProjectId,
        author_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Look up a user record.
    fn user(&self, user_id: UserId) -> Result<User, StoreError>;

    /// Whether `user_id` may collaborate on `project_id` (owners included).
    fn is_member(&self, project_id: ProjectId, user_id: UserId) -> Result<bool, StoreError>;
}
