//! canvas-server: WebSocket relay for collaborative canvas rooms.
//!
//! Configuration comes from the environment:
//!
//! - `CANVAS_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `CANVAS_STORAGE_PATH`: RocksDB directory; unset keeps rooms in memory
//! - `CANVAS_PATH_PREFIX`: URL path before the room name (default `/`)
//! - `CANVAS_DEFAULT_ROOM`: room for requests that name none
//! - `CANVAS_HEARTBEAT_SECS`: WebSocket ping interval, `0` disables
//!
//! Logging is controlled with `RUST_LOG`.

use canvas_collab::ServerConfig;
use canvas_collab::SyncServer;
use log::{info, warn};
use std::path::PathBuf;

fn config_from_env<F>(lookup: F) -> ServerConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ServerConfig::default();
    if let Some(addr) = lookup("CANVAS_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(path) = lookup("CANVAS_STORAGE_PATH").filter(|p| !p.is_empty()) {
        config.storage_path = Some(PathBuf::from(path));
    }
    if let Some(prefix) = lookup("CANVAS_PATH_PREFIX") {
        config.path_prefix = prefix;
    }
    if let Some(room) = lookup("CANVAS_DEFAULT_ROOM").filter(|r| !r.is_empty()) {
        config.default_room = room;
    }
    if let Some(secs) = lookup("CANVAS_HEARTBEAT_SECS") {
        match secs.parse() {
            Ok(secs) => config.heartbeat_interval_secs = secs,
            Err(_) => warn!("Ignoring CANVAS_HEARTBEAT_SECS={secs:?}, not a number"),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from_env(|key| std::env::var(key).ok());
    match &config.storage_path {
        Some(path) => info!("Persisting rooms under {}", path.display()),
        None => info!("No storage path set, rooms are kept in memory"),
    }

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    server.registry().flush_persistence().await;
    Ok(())
}
