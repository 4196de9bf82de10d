//! CodeCollab sync server.
//!
//! Reads `CODECOLLAB_*` settings from the environment, opens the RocksDB
//! project store and serves WebSocket clients until Ctrl-C.

use log::{error, info};
use tokio::net::TcpListener;

use codecollab_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting CodeCollab server (store: {}, room cap: {})",
        config.storage_path.display(),
        config.max_members_per_room
    );

    let server = match CollabServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(server.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", server.bind_addr());
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = server.serve_with_shutdown(listener, shutdown).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    let stats = server.stats().await;
    info!(
        "Stopped after {} connections, {} edits applied",
        stats.total_connections, stats.sync.edits_applied
    );
}
