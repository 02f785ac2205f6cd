//! Process configuration, read from environment variables at startup —
//! the same typed-defaults-from-env convention as the teacher's
//! `rate_limit::RateLimitConfig::from_env`.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_RELAY_PORT: u16 = 43190;

#[derive(Debug, Clone)]
pub struct Config {
    /// Forces the relay client to this URL, skipping discovery entirely.
    pub relay_url: Option<String>,
    /// Default port used by discovery and by the relay server's bind address.
    pub relay_port: u16,
    /// Per-instance state directory suffix, for running multiple dev instances.
    pub instance: Option<String>,
    /// Sqlite database path.
    pub database_path: PathBuf,
    /// Managed attachments root.
    pub attachments_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let instance = env::var("LANTERN_INSTANCE").ok().filter(|s| !s.is_empty());

        let state_dir_name = match &instance {
            Some(tag) => format!("lantern-{tag}"),
            None => "lantern".to_string(),
        };

        let data_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&state_dir_name);

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("lantern.db"));

        let attachments_dir = env::var("LANTERN_ATTACHMENTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::document_dir()
                    .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
                    .join("Lantern Attachments")
            });

        let relay_port = env::var("LANTERN_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RELAY_PORT);

        Self {
            relay_url: env::var("LANTERN_RELAY_URL").ok().filter(|s| !s.is_empty()),
            relay_port,
            instance,
            database_path,
            attachments_dir,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
