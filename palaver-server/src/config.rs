//! Server configuration.

use clap::{Parser, ValueEnum};

/// What quitting a channel does to persisted membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QuitPolicy {
    /// Quit only removes the live binding; rejoining restores prior
    /// history automatically.
    Retain,
    /// Quit also removes the persisted membership; rejoin starts fresh.
    Forget,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "palaver-server", about = "Multi-channel chat coordinator")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "PALAVER_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path.
    #[arg(long, env = "PALAVER_DB", default_value = "palaver.db")]
    pub db_path: String,

    /// Directory served as static files.
    #[arg(long, env = "PALAVER_STATIC_DIR", default_value = "public")]
    pub static_dir: String,

    /// Channel new identities are joined to on their first claim.
    #[arg(long, env = "PALAVER_DEFAULT_CHANNEL", default_value = "general")]
    pub default_channel: String,

    /// Whether quitting a channel forgets persisted membership.
    #[arg(long, env = "PALAVER_QUIT_POLICY", value_enum, default_value_t = QuitPolicy::Retain)]
    pub quit_policy: QuitPolicy,

    /// Worker id used as the relay origin. Random when unset.
    #[arg(long, env = "PALAVER_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Cap on messages replayed per channel join. Unset replays everything.
    #[arg(long, env = "PALAVER_HISTORY_LIMIT")]
    pub history_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: "palaver.db".to_string(),
            static_dir: "public".to_string(),
            default_channel: "general".to_string(),
            quit_policy: QuitPolicy::Retain,
            worker_id: None,
            history_limit: None,
        }
    }
}
