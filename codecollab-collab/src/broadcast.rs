//! Room fan-out with per-connection outboxes.
//!
//! Each attached connection owns a bounded outbox (`mpsc`). Publishing to a
//! room encodes the event once and pushes the shared frame into the outbox
//! of every current member except the excluded sender:
//!
//! ```text
//!                      ┌──► outbox(conn A) ──► socket A
//! publish(project) ────┼──► outbox(conn B) ──► socket B
//!   (encode once)      └──x outbox(sender)     (excluded)
//! ```
//!
//! Delivery is at-most-once. A full or closed outbox drops the frame for that
//! member only and counts it in [`BroadcastStats::messages_dropped`]; nothing
//! is retried. Outboxes are FIFO, so frames from one publisher arrive in the
//! order they were published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use codecollab_core::ProjectId;

use crate::protocol::{ProtocolError, ServerEvent};
use crate::registry::{ConnectionId, SessionRegistry};

/// A pre-encoded frame shared by every recipient.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Events published (each counted once regardless of fan-out)
    pub messages_sent: u64,
    /// Frames placed into outboxes
    pub messages_delivered: u64,
    /// Frames lost to full or closed outboxes
    pub messages_dropped: u64,
    pub attached_connections: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Routes encoded events to the members of a project room.
pub struct RoomBroadcaster {
    registry: Arc<SessionRegistry>,
    outboxes: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    /// Frames buffered per connection before drops start
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl RoomBroadcaster {
    /// Create a broadcaster over `registry` with `capacity` frames per outbox.
    pub fn new(registry: Arc<SessionRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            outboxes: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register an outbox for a newly accepted connection.
    ///
    /// The connection task drains the returned receiver into its socket.
    pub async fn attach(&self, conn: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outboxes.write().await.insert(conn, tx);
        rx
    }

    /// Drop the outbox of a closed connection and remove it from every room.
    pub async fn detach(&self, conn: ConnectionId) -> Vec<ProjectId> {
        self.outboxes.write().await.remove(&conn);
        let left = self.registry.leave_all(conn).await;
        if !left.is_empty() {
            log::debug!("Connection {conn} left {} room(s) on disconnect", left.len());
        }
        left
    }

    /// Publish `event` to every member of `project_id` except `exclude`.
    ///
    /// Returns the number of members the frame was queued for.
    pub async fn publish(
        &self,
        project_id: ProjectId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let members = self.registry.members(project_id).await;
        let outboxes = self.outboxes.read().await;
        let mut delivered = 0;
        for conn in members {
            if Some(conn) == exclude {
                continue;
            }
            let Some(outbox) = outboxes.get(&conn) else {
                continue;
            };
            if self.push(conn, outbox, frame.clone()) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Queue `event` for a single connection (e.g. a join acknowledgement).
    pub async fn send_to(&self, conn: ConnectionId, event: &ServerEvent) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        let outboxes = self.outboxes.read().await;
        Ok(match outboxes.get(&conn) {
            Some(outbox) => self.push(conn, outbox, frame),
            None => false,
        })
    }

    fn push(&self, conn: ConnectionId, outbox: &mpsc::Sender<Frame>, frame: Frame) -> bool {
        match outbox.try_send(frame) {
            Ok(()) => {
                self.atomic_stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox of {conn} is full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbox of {conn} is closed, dropping frame");
                false
            }
        }
    }

    /// Get broadcast statistics (snapshot).
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.atomic_stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            attached_connections: self.outboxes.read().await.len(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codecollab_core::FileId;

    fn update(content: &str) -> ServerEvent {
        ServerEvent::CodeUpdate {
            file_id: FileId(7),
            content: content.to_string(),
        }
    }

    fn setup(capacity: usize) -> (Arc<SessionRegistry>, RoomBroadcaster) {
        let registry = Arc::new(SessionRegistry::new(100));
        let broadcaster = RoomBroadcaster::new(registry.clone(), capacity);
        (registry, broadcaster)
    }

    #[tokio::test]
    async fn test_publish_excludes_sender() {
        let (registry, broadcaster) = setup(16);
        let sender = ConnectionId::new();
        let peer = ConnectionId::new();
        let mut sender_rx = broadcaster.attach(sender).await;
        let mut peer_rx = broadcaster.attach(peer).await;
        registry.join(sender, ProjectId(1)).await;
        registry.join(peer, ProjectId(1)).await;

        let n = broadcaster
            .publish(ProjectId(1), &update("x=1"), Some(sender))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let frame = peer_rx.recv().await.unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), update("x=1"));
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_only_reaches_room_members() {
        let (registry, broadcaster) = setup(16);
        let member = ConnectionId::new();
        let outsider = ConnectionId::new();
        let mut member_rx = broadcaster.attach(member).await;
        let mut outsider_rx = broadcaster.attach(outsider).await;
        registry.join(member, ProjectId(1)).await;
        registry.join(outsider, ProjectId(2)).await;

        broadcaster.publish(ProjectId(1), &update("a"), None).await.unwrap();

        assert!(member_rx.recv().await.is_some());
        assert!(outsider_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_missing_room() {
        let (_registry, broadcaster) = setup(16);
        let n = broadcaster.publish(ProjectId(404), &update("a"), None).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(broadcaster.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_full_outbox_drops() {
        let (registry, broadcaster) = setup(2);
        let slow = ConnectionId::new();
        let _slow_rx = broadcaster.attach(slow).await;
        registry.join(slow, ProjectId(1)).await;

        for i in 0..5 {
            broadcaster
                .publish(ProjectId(1), &update(&i.to_string()), None)
                .await
                .unwrap();
        }

        let stats = broadcaster.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_delivered, 2);
        assert_eq!(stats.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_order_preserved_per_publisher() {
        let (registry, broadcaster) = setup(64);
        let peer = ConnectionId::new();
        let mut rx = broadcaster.attach(peer).await;
        registry.join(peer, ProjectId(1)).await;

        for i in 0..10 {
            broadcaster
                .publish(ProjectId(1), &update(&i.to_string()), None)
                .await
                .unwrap();
        }
        for i in 0..10 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(ServerEvent::decode(&frame).unwrap(), update(&i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_detach_cleans_membership() {
        let (registry, broadcaster) = setup(16);
        let conn = ConnectionId::new();
        let _rx = broadcaster.attach(conn).await;
        registry.join(conn, ProjectId(1)).await;

        let left = broadcaster.detach(conn).await;
        assert_eq!(left, vec![ProjectId(1)]);
        assert!(!registry.room_exists(ProjectId(1)).await);
        assert_eq!(broadcaster.stats().await.attached_connections, 0);
        assert!(!broadcaster
            .send_to(conn, &ServerEvent::Joined { project_id: ProjectId(1) })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_send_to_single_connection() {
        let (_registry, broadcaster) = setup(16);
        let conn = ConnectionId::new();
        let mut rx = broadcaster.attach(conn).await;

        let ack = ServerEvent::Joined { project_id: ProjectId(3) };
        assert!(broadcaster.send_to(conn, &ack).await.unwrap());
        assert_eq!(ServerEvent::decode(&rx.recv().await.unwrap()).unwrap(), ack);
    }
}
