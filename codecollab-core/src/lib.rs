//! # codecollab-core: Shared data model for CodeCollab
//!
//! Entities exchanged between the realtime server, the persistence store
//! and editor clients:
//!
//! ```text
//! User ──owns──► Project ──has──► File (filename, language, content)
//!   │               │
//!   └──member of────┤
//!                   └──has──► Message (chat, append-only)
//! ```
//!
//! `EditEvent` is the unit of synchronization: a full-content replacement of
//! one file. It is never stored as an entity of its own.
//!
//! All types serialize with camelCase field names so they can travel on the
//! JSON wire unchanged. Ids in `EditEvent` also decode from digit strings
//! (see [`wire::numeric_id`]).

pub mod language;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

pub use language::{default_file_content, language_for_filename, welcome_file, DEFAULT_FILENAME};

/// Numeric project identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl ProjectId {
    /// Name of the realtime room for this project (`project-<id>`).
    pub fn room_name(&self) -> String {
        format!("project-{}", self.0)
    }
}

impl From<u64> for ProjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric file identifier, unique across all projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl From<u64> for FileId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric chat message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier (UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub owner_id: UserId,
    /// Creation time (Unix millis)
    pub created_at: u64,
}

/// A source file. `content` is the full current text; there is no history.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: FileId,
    pub project_id: ProjectId,
    pub filename: String,
    pub language: String,
    pub content: String,
}

/// A persisted chat message.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub project_id: ProjectId,
    pub author_id: UserId,
    pub content: String,
    /// Creation time (Unix millis)
    pub created_at: u64,
}

/// A project with its files and member users, owner included.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub files: Vec<File>,
    pub members: Vec<User>,
}

/// Full-content replacement of one file, produced by a debounced client.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditEvent {
    #[serde(deserialize_with = "wire::numeric_id")]
    pub project_id: ProjectId,
    #[serde(deserialize_with = "wire::numeric_id")]
    pub file_id: FileId,
    pub content: String,
}

impl EditEvent {
    pub fn new(project_id: ProjectId, file_id: FileId, content: impl Into<String>) -> Self {
        Self {
            project_id,
            file_id,
            content: content.into(),
        }
    }
}
