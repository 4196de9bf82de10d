//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect detection)
//! - `joinProject` / `leaveProject`
//! - `codeChange` and `sendMessage` emission
//! - Inbound `codeUpdate` / `newMessage` surfaced as [`SyncEvent`]s
//!
//! There is no offline queue: sends while disconnected fail with
//! [`ProtocolError::ConnectionClosed`] and a reconnecting client re-reads
//! file content instead of replaying edits.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use codecollab_core::{EditEvent, FileId, ProjectId};

use crate::protocol::{ChatMessage, ClientEvent, JoinProject, LeaveProject, ProtocolError, SendMessage, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The server accepted a `joinProject`
    Joined(ProjectId),
    /// Another client replaced a file's content
    CodeUpdate { file_id: FileId, content: String },
    /// Another member posted to the project chat
    NewMessage(ChatMessage),
}

impl From<ServerEvent> for SyncEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::Joined { project_id } => SyncEvent::Joined(project_id),
            ServerEvent::CodeUpdate { file_id, content } => SyncEvent::CodeUpdate { file_id, content },
            ServerEvent::NewMessage(msg) => SyncEvent::NewMessage(msg),
        }
    }
}

/// The sync client.
pub struct SyncClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new client for `server_url` (e.g. `ws://127.0.0.1:5000`).
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: surface server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            let _ = event_tx.send(SyncEvent::from(event)).await;
                        }
                        Err(e) => log::warn!("Ignoring malformed server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join a project room. The first join must carry a token.
    pub async fn join_project(&self, project_id: ProjectId, token: Option<String>) -> Result<(), ProtocolError> {
        self.send(ClientEvent::JoinProject(JoinProject { project_id, token }))
            .await
    }

    pub async fn leave_project(&self, project_id: ProjectId) -> Result<(), ProtocolError> {
        self.send(ClientEvent::LeaveProject(LeaveProject { project_id }))
            .await
    }

    /// Send a full-content edit of one file.
    pub async fn send_code_change(&self, edit: EditEvent) -> Result<(), ProtocolError> {
        self.send(ClientEvent::CodeChange(edit)).await
    }

    /// Post to the project chat.
    pub async fn send_message(&self, project_id: ProjectId, content: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientEvent::SendMessage(SendMessage {
            project_id,
            content: content.into(),
        }))
        .await
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let text = event.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(text).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. Pending outgoing frames are flushed first.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
