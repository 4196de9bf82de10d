//! Editor session: a task driving one [`EditBuffer`] for one project.
//!
//! ```text
//!  keystrokes ──edit()──┐
//!  file tabs ───open()──┤   ┌──────────────┐   EditEvent    ┌────────────┐
//!  codeUpdate ─remote()─┼──►│ session task │ ─────────────► │ outgoing   │
//!  unmount ────close()──┘   │ (EditBuffer) │                │ (→ client) │
//!                           └──────┬───────┘                └────────────┘
//!                                  │ watch
//!                                  ▼
//!                             EditorView
//! ```
//!
//! The task sleeps until the buffer's single deadline. Dropping or closing
//! the session cancels a pending emission without sending it.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use codecollab_core::{EditEvent, FileId, ProjectId};

use crate::buffer::{BufferError, EditBuffer};

/// What the editor currently shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorView {
    pub file_id: Option<FileId>,
    pub content: String,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Editor session is closed")]
    Closed,
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

enum Command {
    Edit(String),
    Open(FileId, oneshot::Sender<Result<(), BufferError>>),
    Track(FileId, String),
    Remote(FileId, String),
    Flush,
    Close,
}

/// Handle to a running editor session.
pub struct EditorSession {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<EditorView>,
    task: JoinHandle<()>,
}

impl EditorSession {
    /// Spawn a session for `project_id` that emits on `outgoing`.
    pub fn spawn(project_id: ProjectId, window: Duration, outgoing: mpsc::Sender<EditEvent>) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let (view_tx, view) = watch::channel(EditorView::default());
        let buffer = EditBuffer::new(project_id, window);
        let task = tokio::spawn(run(buffer, rx, outgoing, view_tx));
        Self { commands, view, task }
    }

    /// Replace the active file's content with the editor's new text.
    pub async fn edit(&self, content: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Edit(content.into())).await
    }

    /// Register a project file with its server content.
    pub async fn track(&self, file_id: FileId, content: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Track(file_id, content.into())).await
    }

    /// Switch the editor to `file_id`, flushing unsent changes of the current file.
    pub async fn open(&self, file_id: FileId) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Open(file_id, tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    /// Apply a `codeUpdate` received from the server.
    pub async fn remote(&self, file_id: FileId, content: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::Remote(file_id, content.into())).await
    }

    /// Send any unsent change now instead of waiting for the deadline.
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.command(Command::Flush).await
    }

    /// Stop the session; a pending emission is discarded.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close).await;
        let _ = self.task.await;
    }

    /// Subscribe to view changes.
    pub fn subscribe(&self) -> watch::Receiver<EditorView> {
        self.view.clone()
    }

    /// Current view.
    pub fn view(&self) -> EditorView {
        self.view.borrow().clone()
    }

    async fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

async fn run(
    mut buffer: EditBuffer,
    mut commands: mpsc::Receiver<Command>,
    outgoing: mpsc::Sender<EditEvent>,
    view: watch::Sender<EditorView>,
) {
    loop {
        let deadline = buffer.deadline();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Edit(content) => {
                        if let Err(e) = buffer.local_change(content, Instant::now()) {
                            log::warn!("Dropping edit: {e}");
                        }
                    }
                    Command::Open(file_id, reply) => {
                        let outcome = match buffer.switch_to(file_id) {
                            Ok(Some(flushed)) => {
                                emit(&outgoing, flushed).await;
                                Ok(())
                            }
                            Ok(None) => Ok(()),
                            Err(e) => Err(e),
                        };
                        publish_view(&buffer, &view);
                        let _ = reply.send(outcome);
                    }
                    Command::Track(file_id, content) => buffer.track(file_id, content),
                    Command::Remote(file_id, content) => {
                        buffer.apply_remote(file_id, content);
                    }
                    Command::Flush => {
                        if let Some(event) = buffer.flush_now() {
                            emit(&outgoing, event).await;
                        }
                    }
                    Command::Close => break,
                }
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(event) = buffer.poll_due(Instant::now()) {
                    emit(&outgoing, event).await;
                    buffer.finish_flush();
                }
            }
        }

        publish_view(&buffer, &view);
    }

    buffer.close();
    log::debug!("Editor session for project {} closed", buffer.project_id());
}

fn publish_view(buffer: &EditBuffer, view: &watch::Sender<EditorView>) {
    view.send_if_modified(|current| {
        let next = EditorView {
            file_id: buffer.active_file(),
            content: buffer.active_content().unwrap_or_default().to_string(),
        };
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn emit(outgoing: &mpsc::Sender<EditEvent>, event: EditEvent) {
    if outgoing.send(event).await.is_err() {
        log::debug!("Edit sink closed, dropping edit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: ProjectId = ProjectId(1);

    #[tokio::test(start_paused = true)]
    async fn test_debounced_emission() {
        let (tx, mut rx) = mpsc::channel(16);
        let session = EditorSession::spawn(P, Duration::from_millis(500), tx);
        session.track(FileId(1), "").await.unwrap();
        session.open(FileId(1)).await.unwrap();

        session.edit("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.edit("ab").await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, EditEvent::new(P, FileId(1), "ab"));
        assert!(rx.try_recv().is_err());
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_unknown_file_errors() {
        let (tx, _rx) = mpsc::channel(16);
        let session = EditorSession::spawn(P, Duration::from_millis(500), tx);
        assert_eq!(
            session.open(FileId(9)).await,
            Err(SessionError::Buffer(BufferError::UnknownFile(FileId(9))))
        );
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_follows_edits_and_remote() {
        let (tx, _rx) = mpsc::channel(16);
        let session = EditorSession::spawn(P, Duration::from_millis(500), tx);
        session.track(FileId(1), "start").await.unwrap();
        session.open(FileId(1)).await.unwrap();
        assert_eq!(
            session.view(),
            EditorView {
                file_id: Some(FileId(1)),
                content: "start".to_string()
            }
        );

        let mut view_rx = session.subscribe();
        view_rx.borrow_and_update();
        session.remote(FileId(1), "from peer").await.unwrap();
        view_rx.changed().await.unwrap();
        assert_eq!(view_rx.borrow().content, "from peer");
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_after_close_fail() {
        let (tx, _rx) = mpsc::channel(16);
        let session = EditorSession::spawn(P, Duration::from_millis(500), tx);
        let commands = session.commands.clone();
        session.close().await;
        assert!(commands.send(Command::Flush).await.is_err());
    }
}
