//! Messaging server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::delivery::DeliveryRouter;
use crate::directory::{IdentityResolver, UserDirectory};
use crate::presence::PresenceRegistry;
use crate::store::MessageStore;

/// Configuration for the messaging server
#[derive(Clone, Debug)]
pub struct MessagingConfig {
    /// Root directory for message files
    pub data_dir: PathBuf,
    /// SQLite database shared with the account service (users, sessions)
    pub users_db: PathBuf,
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Upper bound for a single push to a live connection
    pub push_timeout: Duration,
    /// Upper bound for a single message store call
    pub store_timeout: Duration,
    /// Interval between server pings on idle sockets
    pub heartbeat_interval: Duration,
    /// A socket with no inbound frame for this long is dropped
    pub idle_timeout: Duration,
    /// Outbound queue depth per connection
    pub outbound_buffer: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("messaging_data");
        Self {
            users_db: data_dir.join("users.sqlite"),
            data_dir,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            push_timeout: Duration::from_millis(2000),
            store_timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            outbound_buffer: 64,
        }
    }
}

impl MessagingConfig {
    /// Create config rooted at a custom data directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let data_dir = base_dir.into();
        Self {
            users_db: data_dir.join("users.sqlite"),
            data_dir,
            ..Self::default()
        }
    }

    /// Read `MESSAGING_*` environment variables on top of the defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("MESSAGING_DATA_DIR") {
            Ok(dir) => Self::with_base_dir(dir),
            Err(_) => Self::default(),
        };

        if let Ok(db) = std::env::var("MESSAGING_USERS_DB") {
            config.users_db = PathBuf::from(db);
        }
        if let Ok(addr) = std::env::var("MESSAGING_BIND_ADDR") {
            config.bind_addr = addr.parse().context("parse MESSAGING_BIND_ADDR")?;
        }
        if let Some(ms) = env_u64("MESSAGING_PUSH_TIMEOUT_MS")? {
            config.push_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MESSAGING_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("MESSAGING_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("MESSAGING_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("MESSAGING_OUTBOUND_BUFFER")? {
            config.outbound_buffer = n.max(1) as usize;
        }

        Ok(config)
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("messages")
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.messages_dir()).await?;
        if let Some(parent) = self.users_db.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("parse {}", key)),
        Err(_) => Ok(None),
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MessagingConfig>,
    pub store: Arc<dyn MessageStore>,
    pub presence: Arc<PresenceRegistry>,
    pub router: Arc<DeliveryRouter>,
    pub identity: Arc<dyn IdentityResolver>,
    pub directory: Arc<dyn UserDirectory>,
}

impl AppState {
    pub fn new(
        config: MessagingConfig,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let router = Arc::new(DeliveryRouter::new(
            store.clone(),
            presence.clone(),
            config.push_timeout,
            config.store_timeout,
        ));
        Self {
            config: Arc::new(config),
            store,
            presence,
            router,
            identity,
            directory,
        }
    }
}
