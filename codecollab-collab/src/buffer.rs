//! Client edit buffer: debounced emission of full-content edits.
//!
//! State machine for the active file:
//! ```text
//!            local_change              deadline passed
//!   Idle ───────────────► Pending ───────────────────► Flushing
//!    ▲                    │  ▲  │ local_change              │
//!    │                    │  └──┘ (re-arm deadline)         │
//!    │  switch / remote / │                                 │
//!    │  close (cancel)    ▼                                 │
//!    └────────────────── Idle ◄──────── finish_flush ───────┘
//! ```
//!
//! Only one deadline exists at a time. Switching files force-flushes the
//! outgoing file when its local content differs from what was last sent.
//! Remote updates replace the view without arming the deadline, so applying
//! a peer's `codeUpdate` never produces a `codeChange` of its own.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use codecollab_core::{EditEvent, FileId, ProjectId};

/// Default quiet period before a burst of keystrokes is sent.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Debounce state of the active file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Pending { deadline: Instant },
    Flushing,
}

/// Buffer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("File {0} is not part of this project")]
    UnknownFile(FileId),
    #[error("No file is open")]
    NoActiveFile,
}

#[derive(Debug)]
struct ActiveFile {
    file_id: FileId,
    /// Current local content (what the editor shows)
    content: String,
    /// Content last sent to, or received from, the server
    last_sent: String,
}

/// Per-project editor buffer.
#[derive(Debug)]
pub struct EditBuffer {
    project_id: ProjectId,
    window: Duration,
    state: BufferState,
    active: Option<ActiveFile>,
    /// Last-known content of the project's inactive files
    known: HashMap<FileId, String>,
}

impl EditBuffer {
    pub fn new(project_id: ProjectId, window: Duration) -> Self {
        Self {
            project_id,
            window,
            state: BufferState::Idle,
            active: None,
            known: HashMap::new(),
        }
    }

    /// Register a file of the project with its current server content.
    ///
    /// Tracking the active file again is ignored; use
    /// [`apply_remote`](Self::apply_remote) for server updates.
    pub fn track(&mut self, file_id: FileId, content: impl Into<String>) {
        if self.active_file() != Some(file_id) {
            self.known.insert(file_id, content.into());
        }
    }

    /// Record a local edit of the active file and (re)arm the deadline.
    pub fn local_change(&mut self, content: impl Into<String>, now: Instant) -> Result<(), BufferError> {
        let active = self.active.as_mut().ok_or(BufferError::NoActiveFile)?;
        active.content = content.into();
        self.state = BufferState::Pending {
            deadline: now + self.window,
        };
        Ok(())
    }

    /// The armed deadline, if an emission is pending.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            BufferState::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Emit the latest content once the deadline has passed.
    ///
    /// On `Some`, the buffer is `Flushing` until [`finish_flush`](Self::finish_flush).
    pub fn poll_due(&mut self, now: Instant) -> Option<EditEvent> {
        match self.state {
            BufferState::Pending { deadline } if now >= deadline => {}
            _ => return None,
        }
        match self.take_unsent() {
            Some(event) => {
                self.state = BufferState::Flushing;
                Some(event)
            }
            None => {
                self.state = BufferState::Idle;
                None
            }
        }
    }

    /// Mark the in-flight emission as handed off.
    pub fn finish_flush(&mut self) {
        if self.state == BufferState::Flushing {
            self.state = BufferState::Idle;
        }
    }

    /// Cancel the deadline and emit immediately if anything is unsent.
    pub fn flush_now(&mut self) -> Option<EditEvent> {
        self.state = BufferState::Idle;
        self.take_unsent()
    }

    /// Make `file_id` the active file.
    ///
    /// Returns the forced flush of the outgoing file, if it had unsent changes.
    pub fn switch_to(&mut self, file_id: FileId) -> Result<Option<EditEvent>, BufferError> {
        if self.active_file() == Some(file_id) {
            return Ok(None);
        }
        let incoming = self
            .known
            .remove(&file_id)
            .ok_or(BufferError::UnknownFile(file_id))?;

        let flushed = self.flush_now();
        if let Some(outgoing) = self.active.take() {
            self.known.insert(outgoing.file_id, outgoing.content);
        }
        self.active = Some(ActiveFile {
            file_id,
            last_sent: incoming.clone(),
            content: incoming,
        });
        Ok(flushed)
    }

    /// Apply a `codeUpdate` from another client.
    ///
    /// Returns whether anything changed. Never arms the deadline; a pending
    /// local emission for the same file is cancelled because the view now
    /// shows the server's newer content.
    pub fn apply_remote(&mut self, file_id: FileId, content: impl Into<String>) -> bool {
        let content = content.into();
        match self.active.as_mut() {
            Some(active) if active.file_id == file_id => {
                if active.content == content {
                    active.last_sent = content;
                    return false;
                }
                active.last_sent = content.clone();
                active.content = content;
                if matches!(self.state, BufferState::Pending { .. }) {
                    self.state = BufferState::Idle;
                }
                true
            }
            _ => match self.known.get(&file_id) {
                Some(existing) if *existing == content => false,
                _ => {
                    self.known.insert(file_id, content);
                    true
                }
            },
        }
    }

    /// Cancel any pending emission without sending it (editor unmount).
    pub fn close(&mut self) {
        self.state = BufferState::Idle;
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn active_file(&self) -> Option<FileId> {
        self.active.as_ref().map(|a| a.file_id)
    }

    /// Content the editor currently shows.
    pub fn active_content(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.content.as_str())
    }

    /// Last-known content of any file of the project.
    pub fn content_of(&self, file_id: FileId) -> Option<&str> {
        match &self.active {
            Some(active) if active.file_id == file_id => Some(&active.content),
            _ => self.known.get(&file_id).map(String::as_str),
        }
    }

    fn take_unsent(&mut self) -> Option<EditEvent> {
        let active = self.active.as_mut()?;
        if active.content == active.last_sent {
            return None;
        }
        active.last_sent = active.content.clone();
        Some(EditEvent::new(self.project_id, active.file_id, active.content.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: ProjectId = ProjectId(42);
    const F1: FileId = FileId(1);
    const F2: FileId = FileId(2);

    fn buffer() -> EditBuffer {
        let mut buffer = EditBuffer::new(P, DEFAULT_DEBOUNCE);
        buffer.track(F1, "one");
        buffer.track(F2, "two");
        buffer.switch_to(F1).unwrap();
        buffer
    }

    #[test]
    fn test_burst_coalesces_into_one_event() {
        let mut b = buffer();
        let t0 = Instant::now();
        for (i, text) in ["o", "on", "one!"].iter().enumerate() {
            b.local_change(*text, t0 + Duration::from_millis(100 * i as u64)).unwrap();
        }
        // Deadline re-armed by the last change
        assert_eq!(b.deadline(), Some(t0 + Duration::from_millis(700)));
        assert_eq!(b.poll_due(t0 + Duration::from_millis(600)), None);

        let event = b.poll_due(t0 + Duration::from_millis(700)).unwrap();
        assert_eq!(event, EditEvent::new(P, F1, "one!"));
        assert_eq!(b.state(), BufferState::Flushing);
        b.finish_flush();
        assert_eq!(b.state(), BufferState::Idle);
        assert_eq!(b.poll_due(t0 + Duration::from_secs(5)), None);
    }

    #[test]
    fn test_change_back_to_sent_content_emits_nothing() {
        let mut b = buffer();
        let t0 = Instant::now();
        b.local_change("onex", t0).unwrap();
        b.local_change("one", t0).unwrap();
        assert_eq!(b.poll_due(t0 + DEFAULT_DEBOUNCE), None);
        assert_eq!(b.state(), BufferState::Idle);
    }

    #[test]
    fn test_switch_flushes_unsent_changes() {
        let mut b = buffer();
        b.local_change("one edited", Instant::now()).unwrap();

        let flushed = b.switch_to(F2).unwrap();
        assert_eq!(flushed, Some(EditEvent::new(P, F1, "one edited")));
        assert_eq!(b.state(), BufferState::Idle);
        assert_eq!(b.active_file(), Some(F2));
        assert_eq!(b.active_content(), Some("two"));
        assert_eq!(b.content_of(F1), Some("one edited"));
    }

    #[test]
    fn test_switch_without_changes_emits_nothing() {
        let mut b = buffer();
        assert_eq!(b.switch_to(F2).unwrap(), None);
        assert_eq!(b.switch_to(F2).unwrap(), None);
    }

    #[test]
    fn test_switch_to_unknown_file() {
        let mut b = buffer();
        assert_eq!(b.switch_to(FileId(99)), Err(BufferError::UnknownFile(FileId(99))));
        assert_eq!(b.active_file(), Some(F1));
    }

    #[test]
    fn test_local_change_without_file() {
        let mut b = EditBuffer::new(P, DEFAULT_DEBOUNCE);
        assert_eq!(b.local_change("x", Instant::now()), Err(BufferError::NoActiveFile));
    }

    #[test]
    fn test_remote_update_does_not_arm_timer() {
        let mut b = buffer();
        assert!(b.apply_remote(F1, "from peer"));
        assert_eq!(b.active_content(), Some("from peer"));
        assert_eq!(b.deadline(), None);
        assert_eq!(b.flush_now(), None);
    }

    #[test]
    fn test_identical_remote_update_ignored() {
        let mut b = buffer();
        assert!(!b.apply_remote(F1, "one"));
        assert!(!b.apply_remote(F2, "two"));
    }

    #[test]
    fn test_remote_update_cancels_pending_local() {
        let mut b = buffer();
        let t0 = Instant::now();
        b.local_change("mine", t0).unwrap();
        assert!(b.apply_remote(F1, "theirs"));
        assert_eq!(b.state(), BufferState::Idle);
        assert_eq!(b.poll_due(t0 + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_remote_update_for_inactive_file() {
        let mut b = buffer();
        assert!(b.apply_remote(F2, "two v2"));
        assert_eq!(b.content_of(F2), Some("two v2"));
        assert_eq!(b.active_content(), Some("one"));
        b.switch_to(F2).unwrap();
        assert_eq!(b.active_content(), Some("two v2"));
    }

    #[test]
    fn test_close_cancels_without_flush() {
        let mut b = buffer();
        let t0 = Instant::now();
        b.local_change("unsaved", t0).unwrap();
        b.close();
        assert_eq!(b.deadline(), None);
        assert_eq!(b.poll_due(t0 + Duration::from_secs(1)), None);
    }
}
