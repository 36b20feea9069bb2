//! Server configuration.
//!
//! Defaults cover a local development server. Every field can be
//! overridden from a `STELLAR_COLLAB_*` environment variable:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STELLAR_COLLAB_BIND_ADDR` | `bind_addr` |
//! | `STELLAR_COLLAB_MAX_MEMBERS_PER_ROOM` | `max_members_per_room` |
//! | `STELLAR_COLLAB_BROADCAST_CAPACITY` | `broadcast_capacity` |
//! | `STELLAR_COLLAB_IDLE_TIMEOUT_MS` | `idle_timeout_ms` |
//! | `STELLAR_COLLAB_SWEEP_INTERVAL_MS` | `sweep_interval_ms` |
//! | `STELLAR_COLLAB_CONFLICT_WINDOW_MS` | `conflict_window_ms` |
//! | `STELLAR_COLLAB_JWT_SECRET` | `jwt_secret` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_PREFIX: &str = "STELLAR_COLLAB_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room; further joins are rejected
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// A member silent for this long is evicted
    pub idle_timeout_ms: u64,
    /// How often the idle sweeper runs
    pub sweep_interval_ms: u64,
    /// Two writes to one field closer than this conflict
    pub conflict_window_ms: u64,
    /// HS256 secret; `None` disables handshake authentication
    pub jwt_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 100,
            broadcast_capacity: 256,
            idle_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            conflict_window_ms: 2_000,
            jwt_secret: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(full_variable_name)`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(addr) = get("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(v) = get("MAX_MEMBERS_PER_ROOM") {
            config.max_members_per_room = parse_positive("MAX_MEMBERS_PER_ROOM", &v)?;
        }
        if let Some(v) = get("BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse_positive("BROADCAST_CAPACITY", &v)?;
        }
        if let Some(v) = get("IDLE_TIMEOUT_MS") {
            config.idle_timeout_ms = parse_positive("IDLE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("SWEEP_INTERVAL_MS") {
            config.sweep_interval_ms = parse_positive("SWEEP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("CONFLICT_WINDOW_MS") {
            config.conflict_window_ms = parse("CONFLICT_WINDOW_MS", &v)?;
        }
        if let Some(secret) = get("JWT_SECRET") {
            config.jwt_secret = Some(secret).filter(|s| !s.is_empty());
        }

        Ok(config)
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(name, value)?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}
