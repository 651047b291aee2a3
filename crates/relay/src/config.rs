// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 1234;
const DEFAULT_ROOM: &str = "default";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_USERS_UPDATE_DELAY_MS: u64 = 100;
const DEFAULT_AWARENESS_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDENTITY_CAPACITY: usize = 10_000;
const DEFAULT_SHUTDOWN_DRAIN_SECS: u64 = 5;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Room joined when the connection URL names none.
    pub default_room: String,
    /// Use the URL path component as the room before falling back to `default_room`.
    pub room_from_path: bool,
    /// Liveness ping interval.
    pub heartbeat_interval: Duration,
    /// Delay between a join and the room-wide `users-update`.
    pub users_update_delay: Duration,
    /// History compaction for newly created documents.
    pub doc_gc: bool,
    /// Evict documents with no members after this much idle time. `None` keeps
    /// them for the process lifetime.
    pub doc_idle_evict_after: Option<Duration>,
    /// Presence entries not renewed within this window are dropped.
    pub awareness_timeout: Duration,
    /// Maximum number of cached user identities.
    pub identity_capacity: usize,
    /// Upper bound on waiting for sockets to close during shutdown.
    pub shutdown_drain: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_RELAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_RELAY_PORT` | `1234` |
    /// | `TANDEM_RELAY_LOG_FILTER` | `info` |
    /// | `TANDEM_RELAY_DEFAULT_ROOM` | `default` |
    /// | `TANDEM_RELAY_ROOM_FROM_PATH` | `false` |
    /// | `TANDEM_RELAY_HEARTBEAT_SECS` | `30` |
    /// | `TANDEM_RELAY_USERS_UPDATE_DELAY_MS` | `100` |
    /// | `TANDEM_RELAY_DOC_GC` | `true` |
    /// | `TANDEM_RELAY_DOC_IDLE_EVICT_SECS` | *(none: never evict)* |
    /// | `TANDEM_RELAY_AWARENESS_TIMEOUT_SECS` | `30` |
    /// | `TANDEM_RELAY_IDENTITY_CAPACITY` | `10000` |
    /// | `TANDEM_RELAY_SHUTDOWN_DRAIN_SECS` | `5` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "TANDEM_RELAY_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("TANDEM_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let default_room = env("TANDEM_RELAY_DEFAULT_ROOM")
            .ok()
            .filter(|room| !room.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ROOM.into());
        let room_from_path = parse_flag(&env, "TANDEM_RELAY_ROOM_FROM_PATH", false);

        let heartbeat_secs =
            parse_or(&env, "TANDEM_RELAY_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS).max(1);
        let users_update_delay_ms =
            parse_or(&env, "TANDEM_RELAY_USERS_UPDATE_DELAY_MS", DEFAULT_USERS_UPDATE_DELAY_MS);

        let doc_gc = parse_flag(&env, "TANDEM_RELAY_DOC_GC", true);
        let doc_idle_evict_after = env("TANDEM_RELAY_DOC_IDLE_EVICT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let awareness_timeout_secs =
            parse_or(&env, "TANDEM_RELAY_AWARENESS_TIMEOUT_SECS", DEFAULT_AWARENESS_TIMEOUT_SECS);
        let identity_capacity =
            parse_or(&env, "TANDEM_RELAY_IDENTITY_CAPACITY", DEFAULT_IDENTITY_CAPACITY).max(1);
        let shutdown_drain_secs =
            parse_or(&env, "TANDEM_RELAY_SHUTDOWN_DRAIN_SECS", DEFAULT_SHUTDOWN_DRAIN_SECS);

        Self {
            listen_addr,
            log_filter,
            default_room,
            room_from_path,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            users_update_delay: Duration::from_millis(users_update_delay_ms),
            doc_gc,
            doc_idle_evict_after,
            awareness_timeout: Duration::from_secs(awareness_timeout_secs),
            identity_capacity,
            shutdown_drain: Duration::from_secs(shutdown_drain_secs),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_flag<F>(env: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key).map(|v| v.trim().to_ascii_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
