use serde::Deserialize;
use std::fs;

use crate::error::{PlaylogError, Result};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sent on every outbound request; some upstreams reject requests
    /// without one.
    pub user_agent: String,
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub spotify: SpotifyConfig,
    pub musicbrainz: MusicBrainzConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: "playlog/0.1 (https://github.com/playlog/playlog)".to_string(),
            storage: StorageConfig::default(),
            dispatch: DispatchConfig::default(),
            spotify: SpotifyConfig::default(),
            musicbrainz: MusicBrainzConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/playlog.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub async_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { async_workers: 8 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub base_url: String,
    /// OAuth bearer token; taken from SPOTIFY_TOKEN when empty.
    pub token: String,
    pub page_limit: u32,
    pub timeout_seconds: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.spotify.com".to_string(),
            token: String::new(),
            page_limit: 50,
            timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MusicBrainzConfig {
    pub base_url: String,
    /// Admission spacing for the outbound gate; the service asks for 1 req/s.
    pub min_interval_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for MusicBrainzConfig {
    fn default() -> Self {
        Self {
            base_url: "https://musicbrainz.org/ws/2".to_string(),
            min_interval_ms: 1000,
            timeout_seconds: 15,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            PlaylogError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path, e
            ))
        })?;

        let mut config: Config = toml::from_str(&config_content)?;
        config.apply_env();
        Ok(config)
    }

    /// Like `load`, but a missing config file falls back to defaults so the
    /// CLI works out of the box.
    pub fn load_or_default() -> Result<Self> {
        match fs::read_to_string("config.toml") {
            Ok(content) => {
                let mut config: Config = toml::from_str(&content)?;
                config.apply_env();
                Ok(config)
            }
            Err(_) => {
                let mut config = Config::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if self.spotify.token.is_empty() {
            if let Ok(token) = std::env::var("SPOTIFY_TOKEN") {
                self.spotify.token = token;
            }
        }
        if let Ok(path) = std::env::var("PLAYLOG_DB_PATH") {
            self.storage.path = path;
        }
    }
}
