use std::path::PathBuf;

use thiserror::Error;

use lovelock_shared::error::IdentifierError;
use lovelock_shared::{KeyDeriver, Pairing};

use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("Invalid pairing: {0}")]
    Pairing(#[from] IdentifierError),
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// SQLite database path. `None` means the platform data directory.
    pub db_path: Option<PathBuf>,
    /// Identifier of the signed-in participant.
    pub me: Option<String>,
    /// Identifier of the partner to pair with.
    pub partner: Option<String>,
    pub sound_enabled: bool,
    pub desktop_notifications: bool,
    /// Capacity of the change feed broadcast channel.
    pub feed_capacity: usize,
    /// Capacity of the session command channel.
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            me: None,
            partner: None,
            sound_enabled: true,
            desktop_notifications: false,
            feed_capacity: 256,
            command_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything missing or invalid.
    ///
    /// | Variable                 | Default            |
    /// |--------------------------|--------------------|
    /// | `LOVELOCK_DB_PATH`       | platform data dir  |
    /// | `LOVELOCK_ME`            | unset              |
    /// | `LOVELOCK_PARTNER`       | unset              |
    /// | `LOVELOCK_SOUND`         | `true`             |
    /// | `LOVELOCK_NOTIFICATIONS` | `false`            |
    /// | `LOVELOCK_FEED_CAPACITY` | `256`              |
    /// | `LOVELOCK_COMMAND_BUFFER`| `64`               |
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("LOVELOCK_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        config.me = var("LOVELOCK_ME");
        config.partner = var("LOVELOCK_PARTNER");

        if let Some(val) = var("LOVELOCK_SOUND") {
            config.sound_enabled = parse_flag(&val);
        }

        if let Some(val) = var("LOVELOCK_NOTIFICATIONS") {
            config.desktop_notifications = parse_flag(&val);
        }

        if let Some(val) = var("LOVELOCK_FEED_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.feed_capacity = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid LOVELOCK_FEED_CAPACITY, using default");
                }
            }
        }

        if let Some(val) = var("LOVELOCK_COMMAND_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.command_buffer = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid LOVELOCK_COMMAND_BUFFER, using default");
                }
            }
        }

        config
    }

    /// The pairing described by `LOVELOCK_ME` and `LOVELOCK_PARTNER`.
    pub fn pairing(&self) -> Result<Pairing, ConfigError> {
        let me = self.me.as_deref().ok_or(ConfigError::Missing("LOVELOCK_ME"))?;
        let partner = self
            .partner
            .as_deref()
            .ok_or(ConfigError::Missing("LOVELOCK_PARTNER"))?;
        Ok(Pairing::from_ids(me, partner)?)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            deriver: KeyDeriver::new(),
            command_buffer: self.command_buffer,
            sound_enabled: self.sound_enabled,
            desktop_notifications: self.desktop_notifications,
        }
    }
}

fn parse_flag(val: &str) -> bool {
    val != "false" && val != "0"
}
