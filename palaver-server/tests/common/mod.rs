//! Shared harness: an in-memory server state with fake connections.
//!
//! `dispatch` is synchronous, so tests drive the full event path without a
//! socket: register an mpsc sender as a connection, dispatch client events,
//! then drain what the "client" received.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use palaver_server::config::ServerConfig;
use palaver_server::db::Db;
use palaver_server::events::ServerEvent;
use palaver_server::relay::{Relay, RelayFrame};
use palaver_server::server::{SharedState, SEND_BUFFER};

pub fn test_state() -> Arc<SharedState> {
    test_state_with(ServerConfig::default())
}

pub fn test_state_with(config: ServerConfig) -> Arc<SharedState> {
    let db = Db::open_memory().expect("in-memory db");
    db.create_channel(&config.default_channel, 0).expect("default channel");
    Arc::new(SharedState::new(config, db, Relay::new("test-worker")))
}

/// A worker on an existing relay bus, with its own in-memory store.
pub fn test_state_on_bus(origin: &str, bus: broadcast::Sender<RelayFrame>) -> Arc<SharedState> {
    let config = ServerConfig::default();
    let db = Db::open_memory().expect("in-memory db");
    db.create_channel(&config.default_channel, 0).expect("default channel");
    Arc::new(SharedState::new(config, db, Relay::with_bus(origin, bus)))
}

/// Register a fake connection and return its receiving end.
pub fn connect(state: &Arc<SharedState>, session_id: &str) -> mpsc::Receiver<ServerEvent> {
    let (tx, rx) = mpsc::channel(SEND_BUFFER);
    state.connections.lock().insert(session_id.to_string(), tx);
    rx
}

/// Everything queued for the client so far.
pub fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
