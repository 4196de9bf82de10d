//! Session registry: which live connections are in which project room.
//!
//! ```text
//!  rooms:        ProjectId ──► { ConnectionId, ... }
//!  memberships:  ConnectionId ──► { ProjectId, ... }
//! ```
//!
//! A room exists exactly while its member set is non-empty; the last leave
//! removes the entry. Both maps are updated under one write lock, so a join,
//! leave or disconnect is observed atomically by every other task.
//!
//! The registry is an explicit instance owned by the server and shared via
//! `Arc`. State is process-local and lost on restart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use codecollab_core::ProjectId;

/// Opaque identifier of one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection was added to the room.
    Joined,
    /// The connection was already a member; nothing changed.
    AlreadyMember,
    /// The room is at its member cap.
    RoomFull,
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<ProjectId, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<ProjectId>>,
}

/// Tracks room membership of live connections.
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    max_members_per_room: usize,
}

impl SessionRegistry {
    /// Create a registry that admits at most `max_members_per_room`
    /// connections per room.
    pub fn new(max_members_per_room: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_members_per_room,
        }
    }

    /// Add `conn` to the room of `project_id`. Idempotent.
    pub async fn join(&self, conn: ConnectionId, project_id: ProjectId) -> JoinOutcome {
        let mut state = self.state.write().await;

        let room_len = state.rooms.get(&project_id).map_or(0, HashSet::len);
        if state
            .rooms
            .get(&project_id)
            .is_some_and(|members| members.contains(&conn))
        {
            return JoinOutcome::AlreadyMember;
        }
        if room_len >= self.max_members_per_room {
            return JoinOutcome::RoomFull;
        }

        if room_len == 0 {
            log::info!("Room {} created", project_id.room_name());
        }
        state.rooms.entry(project_id).or_default().insert(conn);
        state.memberships.entry(conn).or_default().insert(project_id);
        JoinOutcome::Joined
    }

    /// Remove `conn` from one room. Returns whether it was a member.
    pub async fn leave(&self, conn: ConnectionId, project_id: ProjectId) -> bool {
        let mut state = self.state.write().await;
        let removed = state.remove_membership(conn, project_id);
        if let Some(projects) = state.memberships.get(&conn) {
            if projects.is_empty() {
                state.memberships.remove(&conn);
            }
        }
        removed
    }

    /// Remove `conn` from every room it is in; returns the rooms it left.
    ///
    /// Called on disconnect. Safe for unknown connections.
    pub async fn leave_all(&self, conn: ConnectionId) -> Vec<ProjectId> {
        let mut state = self.state.write().await;
        let projects: Vec<ProjectId> = state
            .memberships
            .remove(&conn)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for project_id in &projects {
            state.remove_from_room(conn, *project_id);
        }
        projects
    }

    /// Whether `conn` is currently in the room of `project_id`.
    pub async fn is_member(&self, conn: ConnectionId, project_id: ProjectId) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(&project_id)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Current members of a room (empty if the room does not exist).
    pub async fn members(&self, project_id: ProjectId) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .rooms
            .get(&project_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms `conn` is currently in.
    pub async fn rooms_of(&self, conn: ConnectionId) -> Vec<ProjectId> {
        self.state
            .read()
            .await
            .memberships
            .get(&conn)
            .map(|projects| projects.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_exists(&self, project_id: ProjectId) -> bool {
        self.state.read().await.rooms.contains_key(&project_id)
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Number of connections that are in at least one room.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.memberships.len()
    }

    pub fn max_members_per_room(&self) -> usize {
        self.max_members_per_room
    }
}

impl RegistryState {
    fn remove_membership(&mut self, conn: ConnectionId, project_id: ProjectId) -> bool {
        let was_member = self
            .memberships
            .get_mut(&conn)
            .is_some_and(|projects| projects.remove(&project_id));
        if was_member {
            self.remove_from_room(conn, project_id);
        }
        was_member
    }

    fn remove_from_room(&mut self, conn: ConnectionId, project_id: ProjectId) {
        if let Some(members) = self.rooms.get_mut(&project_id) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(&project_id);
                log::info!("Room {} removed (empty)", project_id.room_name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P42: ProjectId = ProjectId(42);

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let registry = SessionRegistry::new(100);
        let conn = ConnectionId::new();

        assert_eq!(registry.join(conn, P42).await, JoinOutcome::Joined);
        assert_eq!(registry.join(conn, P42).await, JoinOutcome::AlreadyMember);
        assert_eq!(registry.members(P42).await, vec![conn]);
    }

    #[tokio::test]
    async fn test_join_join_leave_removes_room() {
        let registry = SessionRegistry::new(100);
        let conn = ConnectionId::new();

        registry.join(conn, P42).await;
        registry.join(conn, P42).await;
        assert!(registry.leave(conn, P42).await);

        assert!(!registry.is_member(conn, P42).await);
        assert!(!registry.room_exists(P42).await);
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_non_member_is_noop() {
        let registry = SessionRegistry::new(100);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.join(a, P42).await;

        assert!(!registry.leave(b, P42).await);
        assert!(!registry.leave(a, ProjectId(7)).await);
        assert!(registry.is_member(a, P42).await);
    }

    #[tokio::test]
    async fn test_room_survives_until_last_member_leaves() {
        let registry = SessionRegistry::new(100);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.join(a, P42).await;
        registry.join(b, P42).await;

        registry.leave(a, P42).await;
        assert!(registry.room_exists(P42).await);
        registry.leave(b, P42).await;
        assert!(!registry.room_exists(P42).await);
    }

    #[tokio::test]
    async fn test_leave_all_on_disconnect() {
        let registry = SessionRegistry::new(100);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.join(a, ProjectId(1)).await;
        registry.join(a, ProjectId(2)).await;
        registry.join(b, ProjectId(2)).await;

        let mut left = registry.leave_all(a).await;
        left.sort();
        assert_eq!(left, vec![ProjectId(1), ProjectId(2)]);

        assert!(!registry.room_exists(ProjectId(1)).await);
        assert_eq!(registry.members(ProjectId(2)).await, vec![b]);
        assert!(registry.rooms_of(a).await.is_empty());

        // Unknown connection
        assert!(registry.leave_all(ConnectionId::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_room_member_cap() {
        let registry = SessionRegistry::new(2);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let c = ConnectionId::new();

        assert_eq!(registry.join(a, P42).await, JoinOutcome::Joined);
        assert_eq!(registry.join(b, P42).await, JoinOutcome::Joined);
        assert_eq!(registry.join(c, P42).await, JoinOutcome::RoomFull);
        // Existing members are still idempotent at the cap
        assert_eq!(registry.join(a, P42).await, JoinOutcome::AlreadyMember);
        assert!(!registry.is_member(c, P42).await);
        assert!(registry.rooms_of(c).await.is_empty());
    }
}
