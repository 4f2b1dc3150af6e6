//! Application configuration management.
//!
//! Runtime settings come from environment variables (a `.env` file is loaded
//! by the CLI before this runs):
//!
//! - `PANTRY_BACKEND_URL` (required): base URL of the REST backend
//! - `PANTRY_STORE`: `file` (default), `keyring` or `memory`
//! - `PANTRY_TOKEN_WINDOW_SECS`: assumed access-token lifetime
//! - `PANTRY_REFRESH_MARGIN_SECS`: how early to renew
//!
//! User preferences are stored at `~/.config/pantry/config.json`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::session::{DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_TOKEN_WINDOW_SECS};
use crate::auth::{FileStore, KeyringStore, MemoryStore, SessionStore};

/// Application name used for storage keys and config/data directory paths
pub const APP_NAME: &str = "pantry";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_BACKEND_URL: &str = "PANTRY_BACKEND_URL";
const ENV_STORE: &str = "PANTRY_STORE";
const ENV_TOKEN_WINDOW: &str = "PANTRY_TOKEN_WINDOW_SECS";
const ENV_REFRESH_MARGIN: &str = "PANTRY_REFRESH_MARGIN_SECS";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PANTRY_BACKEND_URL is not set")]
    MissingBackendUrl,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Where the session record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl StoreKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Some(StoreKind::File),
            "keyring" | "keychain" => Some(StoreKind::Keyring),
            "memory" => Some(StoreKind::Memory),
            _ => None,
        }
    }
}

/// Session-manager tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Storage key of the persisted session record
    pub storage_key: String,
    /// Access-token lifetime assumed when the backend omits one
    pub token_window: Duration,
    /// Renew this long before the access token expires
    pub refresh_margin: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            storage_key: format!("{}-userData", APP_NAME),
            token_window: Duration::seconds(DEFAULT_TOKEN_WINDOW_SECS),
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }
}

/// Main runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: String,
    pub store: StoreKind,
    pub session: SessionSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_url = lookup(ENV_BACKEND_URL)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingBackendUrl)?;

        let store = match lookup(ENV_STORE) {
            Some(value) => StoreKind::parse(&value).ok_or(ConfigError::InvalidValue {
                name: ENV_STORE,
                value,
            })?,
            None => StoreKind::default(),
        };

        let mut session = SessionSettings::default();
        if let Some(secs) = parse_secs(&lookup, ENV_TOKEN_WINDOW)? {
            session.token_window = secs;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_REFRESH_MARGIN)? {
            session.refresh_margin = secs;
        }
        if session.refresh_margin >= session.token_window {
            return Err(ConfigError::InvalidValue {
                name: ENV_REFRESH_MARGIN,
                value: format!(
                    "{} (must be shorter than the {}s token window)",
                    session.refresh_margin.num_seconds(),
                    session.token_window.num_seconds()
                ),
            });
        }

        Ok(Self {
            backend_url,
            store,
            session,
        })
    }

    /// Open the configured session store.
    pub fn open_store(&self) -> Result<Arc<dyn SessionStore>> {
        Ok(match self.store {
            StoreKind::File => Arc::new(FileStore::new(Self::data_dir()?)),
            StoreKind::Keyring => Arc::new(KeyringStore::new(APP_NAME)),
            StoreKind::Memory => Arc::new(MemoryStore::new()),
        })
    }

    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

fn parse_secs<F>(lookup: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<u32>() {
            Ok(secs) => Ok(Some(Duration::seconds(i64::from(secs)))),
            Err(_) => Err(ConfigError::InvalidValue { name, value }),
        },
    }
}

/// Remembered between runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Preferences {
    pub last_email: Option<String>,
}

impl Preferences {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_backend_url_is_required() {
        assert_eq!(
            Config::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::MissingBackendUrl
        );
        assert_eq!(
            Config::from_lookup(lookup(&[(ENV_BACKEND_URL, "  ")])).unwrap_err(),
            ConfigError::MissingBackendUrl
        );
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup(&[(ENV_BACKEND_URL, "http://localhost:8080/api/")])).unwrap();

        assert_eq!(config.backend_url, "http://localhost:8080/api");
        assert_eq!(config.store, StoreKind::File);
        assert_eq!(config.session.storage_key, "pantry-userData");
        assert_eq!(config.session.token_window, Duration::minutes(14));
        assert_eq!(config.session.refresh_margin, Duration::seconds(60));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost:8080/api"),
            (ENV_STORE, "Memory"),
            (ENV_TOKEN_WINDOW, "600"),
            (ENV_REFRESH_MARGIN, "30"),
        ]))
        .unwrap();

        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.session.token_window, Duration::minutes(10));
        assert_eq!(config.session.refresh_margin, Duration::seconds(30));
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_STORE, "cookie-jar"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: ENV_STORE,
                value: "cookie-jar".to_string()
            }
        );

        let err = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_REFRESH_MARGIN, "-5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: ENV_REFRESH_MARGIN, .. }));
    }

    #[test]
    fn test_refresh_margin_must_be_shorter_than_window() {
        let err = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_TOKEN_WINDOW, "30"),
            (ENV_REFRESH_MARGIN, "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: ENV_REFRESH_MARGIN, .. }));

        let err = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_TOKEN_WINDOW, "60"),
            (ENV_REFRESH_MARGIN, "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: ENV_REFRESH_MARGIN, .. }));

        // A window shorter than the default margin needs its own margin
        assert!(Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_TOKEN_WINDOW, "30"),
        ]))
        .is_err());

        let config = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_TOKEN_WINDOW, "30"),
            (ENV_REFRESH_MARGIN, "10"),
        ]))
        .unwrap();
        assert_eq!(config.session.refresh_margin, Duration::seconds(10));
    }

    #[test]
    fn test_memory_store_opens_without_filesystem() {
        let config = Config::from_lookup(lookup(&[
            (ENV_BACKEND_URL, "http://localhost"),
            (ENV_STORE, "memory"),
        ]))
        .unwrap();
        let store = config.open_store().unwrap();
        assert_eq!(store.read("anything").unwrap(), None);
    }
}
