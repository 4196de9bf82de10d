//! WebSocket collaboration server with project rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌──► EditSynchronizer ──► Persistence
//!            ├── connection task ───┤         │ (per-file lock)      (RocksDB)
//! Client B ──┘   (select! loop)     ├──► ChatRelay ─────────┤
//!                     ▲             └──► SessionRegistry    │
//!                     │                        ▲            ▼
//!                     └──── outbox ◄──── RoomBroadcaster ◄──┘
//! ```
//!
//! Each connection task:
//! - reads JSON text frames and dispatches them in arrival order
//! - drains its outbox (frames published by other connections) into the socket
//! - sends a WebSocket ping every heartbeat interval
//!
//! Identity is established once, on the first `joinProject`, from a verified
//! token. Rejected or failing events are logged and dropped; no error event is
//! sent back. When the socket closes the connection leaves every room.
//!
//! On shutdown every live connection is sent a Close frame and detached, and
//! `serve_with_shutdown` returns only after all connection tasks have ended.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use codecollab_core::{ProjectId, User, UserId};

use crate::auth::{AuthError, JwtVerifier, TokenVerifier};
use crate::broadcast::{BroadcastStats, RoomBroadcaster};
use crate::chat::ChatRelay;
use crate::protocol::{ClientEvent, JoinProject, ServerEvent};
use crate::registry::{ConnectionId, JoinOutcome, SessionRegistry};
use crate::storage::{Persistence, RocksStore, StoreConfig, StoreError};
use crate::sync::{EditSynchronizer, SyncError, SyncStats};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per project room
    pub max_members_per_room: usize,
    /// Frames buffered per connection before drops start
    pub outbox_capacity: usize,
    /// Heartbeat (WebSocket ping) interval in seconds
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory
    pub storage_path: PathBuf,
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            max_members_per_room: 100,
            outbox_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: PathBuf::from("codecollab_data"),
            jwt_secret: "codecollab-dev-secret".to_string(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid value '{value}' for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl ServerConfig {
    /// Defaults overlaid with `CODECOLLAB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Keys: `CODECOLLAB_BIND_ADDR`, `CODECOLLAB_MAX_MEMBERS_PER_ROOM`,
    /// `CODECOLLAB_OUTBOX_CAPACITY`, `CODECOLLAB_HEARTBEAT_SECS`,
    /// `CODECOLLAB_STORAGE_PATH`, `CODECOLLAB_JWT_SECRET`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("CODECOLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("CODECOLLAB_MAX_MEMBERS_PER_ROOM") {
            config.max_members_per_room = parse_positive("CODECOLLAB_MAX_MEMBERS_PER_ROOM", raw)?;
        }
        if let Some(raw) = lookup("CODECOLLAB_OUTBOX_CAPACITY") {
            config.outbox_capacity = parse_positive("CODECOLLAB_OUTBOX_CAPACITY", raw)?;
        }
        if let Some(raw) = lookup("CODECOLLAB_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse_positive("CODECOLLAB_HEARTBEAT_SECS", raw)? as u64;
        }
        if let Some(path) = lookup("CODECOLLAB_STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(secret) = lookup("CODECOLLAB_JWT_SECRET") {
            if secret.is_empty() {
                return Err(ConfigError {
                    key: "CODECOLLAB_JWT_SECRET",
                    value: secret,
                    reason: "must not be empty".to_string(),
                });
            }
            config.jwt_secret = secret;
        }
        Ok(config)
    }
}

fn parse_positive(key: &'static str, raw: String) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError {
            key,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a single inbound event was dropped.
#[derive(Debug, thiserror::Error)]
enum EventError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("First join on a connection must carry a token")]
    MissingToken,
    #[error("Token belongs to a different user than the connection")]
    IdentityMismatch,
    #[error("Connection has not joined any project")]
    Unauthenticated,
    #[error("User {user_id} has no access to project {project_id}")]
    Forbidden { user_id: UserId, project_id: ProjectId },
    #[error("Room project-{0} is full")]
    RoomFull(ProjectId),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub rejected_events: u64,
    pub joins: u64,
    pub active_rooms: usize,
    pub broadcast: BroadcastStats,
    pub sync: SyncStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_events: AtomicU64,
    rejected_events: AtomicU64,
    joins: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<RoomBroadcaster>,
    sync: EditSynchronizer,
    chat: ChatRelay,
    store: Arc<dyn Persistence>,
    verifier: Arc<dyn TokenVerifier>,
    stats: AtomicServerStats,
}

/// The collaboration server.
pub struct CollabServer {
    shared: Arc<Shared>,
}

impl CollabServer {
    /// Open the RocksDB store and JWT verifier described by `config`.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let store = RocksStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?;
        let verifier = JwtVerifier::new(&config.jwt_secret);
        Ok(Self::with_parts(config, Arc::new(store), Arc::new(verifier)))
    }

    /// Build a server over an existing store and token verifier.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn Persistence>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_members_per_room));
        let broadcaster = Arc::new(RoomBroadcaster::new(registry.clone(), config.outbox_capacity));
        let sync = EditSynchronizer::new(broadcaster.clone(), store.clone());
        let chat = ChatRelay::new(broadcaster.clone(), store.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                broadcaster,
                sync,
                chat,
                store,
                verifier,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    ///
    /// On shutdown, live connections are closed and detached; this returns
    /// once every connection task has finished.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        log::info!("Collab server listening on {local_addr}");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => break Err(ServerError::from(e)),
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    let stop = stop_rx.clone();
                    connections.spawn(async move {
                        shared.handle_connection(stream, addr, stop).await;
                    });
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }
                _ = &mut shutdown => {
                    log::info!("Collab server on {local_addr} shutting down");
                    break Ok(());
                }
            }
        };

        drop(listener);
        let _ = stop_tx.send(true);
        let open = connections.len();
        if open > 0 {
            log::info!("Closing {open} live connection(s)");
        }
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                log::error!("Connection task failed: {e}");
            }
        }
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_events: s.total_events.load(Ordering::Relaxed),
            rejected_events: s.rejected_events.load(Ordering::Relaxed),
            joins: s.joins.load(Ordering::Relaxed),
            active_rooms: self.shared.registry.room_count().await,
            broadcast: self.shared.broadcaster.stats().await,
            sync: self.shared.sync.stats(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }
}

impl Shared {
    /// Run one connection to completion, then release its memberships.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        stop: watch::Receiver<bool>,
    ) {
        let conn = ConnectionId::new();
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.connection_loop(stream, addr, conn, stop).await {
            log::error!("Connection error from {addr}: {e}");
        }

        let left = self.broadcaster.detach(conn).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn} from {addr} closed, left {} room(s)", left.len());
    }

    async fn connection_loop(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        conn: ConnectionId,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio::select! {
            ws = tokio_tungstenite::accept_async(stream) => ws?,
            _ = stop.changed() => return Ok(()),
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut outbox = self.broadcaster.attach(conn).await;
        log::info!("WebSocket connection {conn} established from {addr}");

        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Bound on the first successful join
        let mut identity: Option<User> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(conn, &mut identity, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Ignoring binary frame from {conn}");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }

                _ = stop.changed() => {
                    log::debug!("Closing {conn}: server shutting down");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Decode and apply one client frame. Failures are logged and dropped.
    async fn dispatch(&self, conn: ConnectionId, identity: &mut Option<User>, text: &str) {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                self.stats.rejected_events.fetch_add(1, Ordering::Relaxed);
                log::warn!("Malformed frame from {conn}: {e}");
                return;
            }
        };
        self.stats.total_events.fetch_add(1, Ordering::Relaxed);

        let project_id = event.project_id();
        let (kind, result) = match event {
            ClientEvent::JoinProject(join) => ("joinProject", self.handle_join(conn, identity, join).await),
            ClientEvent::LeaveProject(leave) => {
                if self.registry.leave(conn, leave.project_id).await {
                    log::info!("Connection {conn} left {}", leave.project_id.room_name());
                }
                ("leaveProject", Ok(()))
            }
            ClientEvent::CodeChange(edit) => (
                "codeChange",
                self.sync
                    .on_edit_event(conn, edit)
                    .await
                    .map(|_| ())
                    .map_err(EventError::from),
            ),
            ClientEvent::SendMessage(msg) => {
                let result = match identity.as_ref() {
                    Some(author) => self
                        .chat
                        .on_send_message(conn, author, msg)
                        .await
                        .map(|_| ())
                        .map_err(EventError::from),
                    None => Err(EventError::Unauthenticated),
                };
                ("sendMessage", result)
            }
        };

        if let Err(e) = result {
            self.stats.rejected_events.fetch_add(1, Ordering::Relaxed);
            match &e {
                EventError::Sync(err) if !err.is_validation() => {
                    log::error!("Dropped {kind} for {} from {conn}: {e}", project_id.room_name());
                }
                _ => log::warn!("Rejected {kind} for {} from {conn}: {e}", project_id.room_name()),
            }
        }
    }

    async fn handle_join(
        &self,
        conn: ConnectionId,
        identity: &mut Option<User>,
        join: JoinProject,
    ) -> Result<(), EventError> {
        let JoinProject { project_id, token } = join;

        let user_id = match (identity.as_ref(), token) {
            (None, None) => return Err(EventError::MissingToken),
            (None, Some(token)) => self.verifier.verify(&token)?,
            (Some(user), None) => user.id,
            (Some(user), Some(token)) => {
                let user_id = self.verifier.verify(&token)?;
                if user_id != user.id {
                    return Err(EventError::IdentityMismatch);
                }
                user_id
            }
        };

        let store = self.store.clone();
        let user = tokio::task::spawn_blocking(move || -> Result<Option<User>, StoreError> {
            if !store.is_member(project_id, user_id)? {
                return Ok(None);
            }
            store.user(user_id).map(Some)
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
        .map_err(SyncError::from)?
        .ok_or(EventError::Forbidden { user_id, project_id })?;

        match self.registry.join(conn, project_id).await {
            JoinOutcome::RoomFull => return Err(EventError::RoomFull(project_id)),
            JoinOutcome::Joined => {
                self.stats.joins.fetch_add(1, Ordering::Relaxed);
                log::info!("{} ({}) joined {} on {conn}", user.name, user.id, project_id.room_name());
            }
            JoinOutcome::AlreadyMember => {
                log::debug!("{} already in {}", user.name, project_id.room_name());
            }
        }
        if identity.is_none() {
            *identity = Some(user);
        }

        self.broadcaster
            .send_to(conn, &ServerEvent::Joined { project_id })
            .await
            .map_err(SyncError::from)?;
        Ok(())
    }
}
