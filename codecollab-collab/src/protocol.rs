//! JSON wire protocol for room events.
//!
//! Every WebSocket text frame carries one event:
//! ```text
//! { "event": "<name>", "data": { ...camelCase fields... } }
//! ```
//!
//! | Direction | Event          | Data                                              |
//! |-----------|----------------|---------------------------------------------------|
//! | C→S       | `joinProject`  | `{projectId, token?}`                             |
//! | C→S       | `leaveProject` | `{projectId}`                                     |
//! | C→S       | `codeChange`   | `{projectId, fileId, content}`                    |
//! | C→S       | `sendMessage`  | `{projectId, content}`                            |
//! | S→C       | `joined`       | `{projectId}`                                     |
//! | S→C       | `codeUpdate`   | `{fileId, content}`                               |
//! | S→C       | `newMessage`   | `{id, content, createdAt, projectId, author}`     |
//!
//! Disconnect is implicit (socket close). Incoming `projectId` and `fileId`
//! are numbers, but digit strings such as `"42"` are accepted too.

use codecollab_core::{EditEvent, FileId, Message, MessageId, ProjectId, User, UserId};
use codecollab_core::wire::numeric_id;
use serde::{Deserialize, Serialize};

/// `joinProject` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinProject {
    #[serde(deserialize_with = "numeric_id")]
    pub project_id: ProjectId,
    /// Bearer token; required on the first join of a connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// `leaveProject` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveProject {
    #[serde(deserialize_with = "numeric_id")]
    pub project_id: ProjectId,
}

/// `sendMessage` payload.
///
/// Older clients also send a `userId`; it is accepted and ignored, the
/// author is always the connection's verified user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(deserialize_with = "numeric_id")]
    pub project_id: ProjectId,
    pub content: String,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinProject(JoinProject),
    LeaveProject(LeaveProject),
    CodeChange(EditEvent),
    SendMessage(SendMessage),
}

/// Author block of a `newMessage` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
}

/// `newMessage` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    pub created_at: u64,
    pub project_id: ProjectId,
    pub author: Author,
}

impl ChatMessage {
    pub fn new(message: Message, author: &User) -> Self {
        Self {
            id: message.id,
            content: message.content,
            created_at: message.created_at,
            project_id: message.project_id,
            author: Author {
                id: author.id,
                name: author.name.clone(),
            },
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Acknowledges a successful `joinProject`.
    #[serde(rename_all = "camelCase")]
    Joined { project_id: ProjectId },
    /// Another client replaced the content of a file.
    #[serde(rename_all = "camelCase")]
    CodeUpdate { file_id: FileId, content: String },
    NewMessage(ChatMessage),
}

impl ClientEvent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// The project the event addresses.
    pub fn project_id(&self) -> ProjectId {
        match self {
            ClientEvent::JoinProject(join) => join.project_id,
            ClientEvent::LeaveProject(leave) => leave.project_id,
            ClientEvent::CodeChange(edit) => edit.project_id,
            ClientEvent::SendMessage(msg) => msg.project_id,
        }
    }
}

impl ServerEvent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
