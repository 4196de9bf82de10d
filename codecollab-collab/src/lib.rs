//! # codecollab-collab: Realtime collaboration layer for CodeCollab
//!
//! Room-based synchronization of file content over WebSockets with
//! last-writer-wins persistence, plus the project chat relay that shares the
//! same rooms.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  codeChange (debounced)  ┌──────────────────┐
//! │ EditorSession│ ───────► SyncClient ────►│  CollabServer    │
//! │ (EditBuffer) │ ◄─────── codeUpdate ◄────│  (per-conn task) │
//! └──────────────┘                          └────────┬─────────┘
//!                                                    │
//!                        ┌───────────────────────────┼─────────────────┐
//!                        ▼                           ▼                 ▼
//!                ┌───────────────┐          ┌─────────────────┐  ┌───────────┐
//!                │SessionRegistry│◄─────────│ RoomBroadcaster │  │ ChatRelay │
//!                │ (rooms)       │          │ (outboxes)      │  └─────┬─────┘
//!                └───────────────┘          └────────▲────────┘        │
//!                                                    │                 │
//!                                          ┌─────────┴────────┐        │
//!                                          │ EditSynchronizer │        │
//!                                          └─────────┬────────┘        │
//!                                                    ▼                 ▼
//!                                            ┌──────────────────────────────┐
//!                                            │ Persistence (RocksStore)     │
//!                                            └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events (`joinProject`, `codeChange`, ...)
//! - [`registry`]: Room membership of live connections
//! - [`broadcast`]: Per-connection outboxes and room fan-out
//! - [`sync`]: Persist-then-broadcast of file edits
//! - [`chat`]: Project chat relay
//! - [`auth`]: Bearer token verification
//! - [`storage`]: RocksDB project store
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client
//! - [`buffer`] / [`session`]: Client-side debounced edit emission

pub mod auth;
pub mod broadcast;
pub mod buffer;
pub mod chat;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use auth::{AuthError, JwtVerifier, TokenVerifier};
pub use broadcast::{BroadcastStats, RoomBroadcaster};
pub use buffer::{BufferError, BufferState, EditBuffer, DEFAULT_DEBOUNCE};
pub use chat::ChatRelay;
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use protocol::{ChatMessage, ClientEvent, ProtocolError, ServerEvent};
pub use registry::{ConnectionId, JoinOutcome, SessionRegistry};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerError, ServerStats};
pub use session::{EditorSession, EditorView, SessionError};
pub use storage::{Persistence, RocksStore, StoreConfig, StoreError};
pub use sync::{EditSynchronizer, SyncError, SyncStats};
