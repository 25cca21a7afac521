//! Shared state and server startup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::events::ServerEvent;
use crate::registry::Registry;
use crate::relay::{self, Relay};
use crate::web;

/// Per-connection outbound buffer size.
pub const SEND_BUFFER: usize = 256;

/// State shared by all connection handlers on this worker.
///
/// Locks guard short critical sections and are never held across an await.
/// When two locks are needed, the order is registry, then groups, then
/// connections.
pub struct SharedState {
    pub config: ServerConfig,
    /// session_id -> sender for pushing events to that client.
    pub connections: Mutex<HashMap<String, mpsc::Sender<ServerEvent>>>,
    /// Display name ↔ live session bindings.
    pub registry: Mutex<Registry>,
    /// channel -> session ids currently bound to its broadcast group.
    pub groups: Mutex<HashMap<String, HashSet<String>>>,
    /// Persistence handle. Opening it at boot is fatal on failure.
    pub db: Mutex<Db>,
    /// Inter-worker fanout.
    pub relay: Relay,
}

impl SharedState {
    pub fn new(config: ServerConfig, db: Db, relay: Relay) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            registry: Mutex::new(Registry::new()),
            groups: Mutex::new(HashMap::new()),
            db: Mutex::new(db),
            relay,
        }
    }

    /// Run a closure against the store. Callers convert errors to an
    /// operation-specific `error` event at the boundary.
    pub fn with_db<F, R>(&self, f: F) -> rusqlite::Result<R>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        f(&db)
    }

    /// Push an event to one session. A full or closed buffer is logged and
    /// dropped — a stuck client must not stall the worker.
    pub fn send_to(&self, session_id: &str, event: ServerEvent) {
        if let Some(tx) = self.connections.lock().get(session_id) {
            if tx.try_send(event).is_err() {
                tracing::warn!(session_id, "send buffer full or closed");
            }
        }
    }

    /// Bind a live connection to a channel's broadcast group.
    pub fn bind(&self, channel: &str, session_id: &str) {
        self.groups
            .lock()
            .entry(channel.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Remove a live binding. Returns whether the session was bound.
    pub fn unbind(&self, channel: &str, session_id: &str) -> bool {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(channel) else {
            return false;
        };
        let removed = group.remove(session_id);
        if group.is_empty() {
            groups.remove(channel);
        }
        removed
    }

    pub fn is_bound(&self, channel: &str, session_id: &str) -> bool {
        self.groups
            .lock()
            .get(channel)
            .is_some_and(|g| g.contains(session_id))
    }

    /// Channels this session is currently live-bound to.
    pub fn bound_channels(&self, session_id: &str) -> Vec<String> {
        self.groups
            .lock()
            .iter()
            .filter(|(_, members)| members.contains(session_id))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        // Failure to reach the store at boot is fatal for the worker.
        let db = Db::open(&self.config.db_path)
            .with_context(|| format!("failed to open database at {}", self.config.db_path))?;
        db.create_channel(&self.config.default_channel, Utc::now().timestamp_millis())
            .context("failed to ensure default channel")?;

        let origin = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{:08x}", rand::random::<u32>()));
        let relay = Relay::new(&origin);
        let listen_addr = self.config.listen_addr.clone();

        let state = Arc::new(SharedState::new(self.config, db, relay));

        tokio::spawn(relay::run_consumer(state.clone(), state.relay.subscribe()));

        let app = web::build_router(state.clone());
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        tracing::info!(%listen_addr, worker = %state.relay.origin(), "listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
