//! Project chat relay.
//!
//! A `sendMessage` from a room member is appended to the project's history
//! and relayed to the other members as `newMessage`. The sender renders its
//! own message optimistically, so it is excluded from the fan-out. The author
//! is the connection's verified user, never a field from the payload.

use std::sync::Arc;

use codecollab_core::User;

use crate::broadcast::RoomBroadcaster;
use crate::protocol::{ChatMessage, SendMessage, ServerEvent};
use crate::registry::{ConnectionId, SessionRegistry};
use crate::storage::Persistence;
use crate::sync::SyncError;

/// Persists chat messages and fans them out to the room.
pub struct ChatRelay {
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<RoomBroadcaster>,
    store: Arc<dyn Persistence>,
}

impl ChatRelay {
    pub fn new(broadcaster: Arc<RoomBroadcaster>, store: Arc<dyn Persistence>) -> Self {
        Self {
            registry: broadcaster.registry().clone(),
            broadcaster,
            store,
        }
    }

    /// Handle one chat message from `sender`, authored by `author`.
    ///
    /// Returns the persisted message as relayed to peers.
    pub async fn on_send_message(
        &self,
        sender: ConnectionId,
        author: &User,
        msg: SendMessage,
    ) -> Result<ChatMessage, SyncError> {
        let SendMessage {
            project_id,
            content,
        } = msg;

        if !self.registry.is_member(sender, project_id).await {
            return Err(SyncError::NotInRoom {
                conn: sender,
                project_id,
            });
        }
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let store = self.store.clone();
        let author_id = author.id;
        let message = tokio::task::spawn_blocking(move || {
            store.append_message(project_id, author_id, &content)
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))??;

        let chat = ChatMessage::new(message, author);
        let delivered = self
            .broadcaster
            .publish(project_id, &ServerEvent::NewMessage(chat.clone()), Some(sender))
            .await?;

        log::debug!(
            "Message {} from {} relayed to {delivered} peer(s) in {}",
            chat.id,
            author.name,
            project_id.room_name()
        );
        Ok(chat)
    }
}
