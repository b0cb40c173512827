//! # Client Configuration
//!
//! Settings for the session runtime.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     PRINTLINK_WS_URL=wss://ws.example.com/0/p                          │
//! │     PRINTLINK_STORE_KIND=memory                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/printlink/client.toml (Linux)                            │
//! │     ~/Library/Application Support/com.printlink.agent/client.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # client.toml
//! [client]
//! name = "workshop"
//! tick_rate_ms = 250
//! tick_timeout_ms = 1000
//! allow_setup = true
//!
//! [connection]
//! ws_url = "wss://ws.printlink.io/0/p"
//! handshake_timeout_secs = 10
//! watchdog_secs = 30
//! initial_backoff_ms = 1000
//! max_backoff_secs = 60
//! jitter = 0.2
//!
//! [store]
//! kind = "sqlite"
//! path = "/var/lib/printlink/printers.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::ConnectionConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Store Kind
// =============================================================================

/// Which config store backs the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-process map. Lost on exit.
    Memory,

    /// SQLite file via printlink-db.
    #[default]
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreKind::Memory),
            "sqlite" | "db" => Ok(StoreKind::Sqlite),
            _ => Err(SyncError::InvalidConfig(format!(
                "Unknown store kind: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

// =============================================================================
// Client Section
// =============================================================================

/// Runtime cadence and identity of this client process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Human-readable client name, used in logs.
    #[serde(default = "default_client_name")]
    pub name: String,

    /// How often every slot ticks its Instance (milliseconds).
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Upper bound for one embedding `on_tick` call (milliseconds).
    #[serde(default = "default_tick_timeout")]
    pub tick_timeout_ms: u64,

    /// Whether unpaired records may connect to request a credential.
    #[serde(default = "default_true")]
    pub allow_setup: bool,
}

fn default_client_name() -> String {
    "printlink".to_string()
}

fn default_tick_rate() -> u64 {
    250
}

fn default_tick_timeout() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for ClientSection {
    fn default() -> Self {
        ClientSection {
            name: default_client_name(),
            tick_rate_ms: default_tick_rate(),
            tick_timeout_ms: default_tick_timeout(),
            allow_setup: true,
        }
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Control-plane connection settings.
///
/// ## Reconnect Timeline
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  fault ──► wait initial_backoff ──► dial ──► fault ──► wait 2x ──► ... │
/// │                                                                         │
/// │  Each wait is capped at max_backoff_secs, then up to `jitter` of the   │
/// │  base is added at random. A successful handshake resets the ladder.    │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Control-plane endpoint (ws:// or wss://).
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Transport open timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed between transport open and the `connected` message (seconds).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Fault when no inbound traffic arrives for this long (seconds).
    #[serde(default = "default_watchdog")]
    pub watchdog_secs: u64,

    /// Transport-level ping cadence (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Random extra delay as a fraction of the base delay (0..=1).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_ws_url() -> String {
    "wss://ws.printlink.io/0/p".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_watchdog() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    60
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            ws_url: default_ws_url(),
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            watchdog_secs: default_watchdog(),
            ping_interval_secs: default_ping_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Where printer records are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub kind: StoreKind,

    /// SQLite file. Defaults to the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    /// Resolved database path, falling back to `<data dir>/printers.db`.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "printlink", "agent")
                .map(|dirs| dirs.data_dir().join("printers.db"))
        })
    }
}

// =============================================================================
// Main Client Settings
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl ClientSettings {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (client.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut settings = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                settings = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        settings.apply_env_overrides();
        settings.validate()?;

        Ok(settings)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = &self.connection.ws_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(SyncError::InvalidUrl(format!(
                "ws_url must start with ws:// or wss://, got: {}",
                url
            )));
        }
        url::Url::parse(url)?;

        if self.client.tick_rate_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "tick_rate_ms must be greater than 0".into(),
            ));
        }

        if self.connection.watchdog_secs == 0 || self.connection.handshake_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "watchdog_secs and handshake_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.connection.initial_backoff_ms > self.connection.max_backoff_secs * 1000 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms exceeds max_backoff_secs".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.connection.jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "jitter must be within 0..=1, got {}",
                self.connection.jitter
            )));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `PRINTLINK_*` overrides from any key lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PRINTLINK_WS_URL") {
            debug!(url = %url, "Overriding ws_url from environment");
            self.connection.ws_url = url;
        }

        if let Some(name) = lookup("PRINTLINK_CLIENT_NAME") {
            self.client.name = name;
        }

        if let Some(rate) = lookup("PRINTLINK_TICK_RATE_MS") {
            match rate.parse::<u64>() {
                Ok(ms) => self.client.tick_rate_ms = ms,
                Err(_) => warn!(value = %rate, "Ignoring invalid PRINTLINK_TICK_RATE_MS"),
            }
        }

        if let Some(allow) = lookup("PRINTLINK_ALLOW_SETUP") {
            match allow.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.client.allow_setup = true,
                "0" | "false" | "no" => self.client.allow_setup = false,
                _ => warn!(value = %allow, "Ignoring invalid PRINTLINK_ALLOW_SETUP"),
            }
        }

        if let Some(secs) = lookup("PRINTLINK_WATCHDOG_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.connection.watchdog_secs = s;
            }
        }

        if let Some(kind) = lookup("PRINTLINK_STORE_KIND") {
            match kind.parse() {
                Ok(parsed) => {
                    debug!(kind = %kind, "Overriding store kind from environment");
                    self.store.kind = parsed;
                }
                Err(_) => warn!(kind = %kind, "Unknown store kind in environment"),
            }
        }

        if let Some(path) = lookup("PRINTLINK_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "printlink", "agent")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn tick_rate(&self) -> Duration {
        Duration::from_millis(self.client.tick_rate_ms)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.client.tick_timeout_ms)
    }

    /// Connection loop settings derived from `[connection]`.
    pub fn connection_config(&self) -> ConnectionConfig {
        let c = &self.connection;
        ConnectionConfig {
            url: c.ws_url.clone(),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(c.handshake_timeout_secs),
            watchdog_timeout: Duration::from_secs(c.watchdog_secs),
            ping_interval: Duration::from_secs(c.ping_interval_secs),
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
            max_backoff: Duration::from_secs(c.max_backoff_secs),
            jitter: c.jitter,
        }
    }
}
