use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::state::RoundDuration;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    pub backend: Backend,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub round: RoundConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Backend {
    /// Base URL for the read and functions endpoints (e.g. "https://xyz.example.co")
    pub rest_url: String,
    /// Websocket URL for the push channel
    pub realtime_url: String,
    #[serde(default)]
    pub anon_key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    pub user_id: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub function: String,
    pub method: String,
    pub startup_delay_ms: u64,
    pub period_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            function: "auto-round-controller".to_string(),
            method: "POST".to_string(),
            startup_delay_ms: 3_000,
            period_ms: 60_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Minutes; must be one of the selectable durations
    pub default_duration: u32,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            default_duration: 1,
        }
    }
}

impl RoundConfig {
    pub fn duration(&self) -> RoundDuration {
        RoundDuration::from_minutes(self.default_duration).unwrap_or(RoundDuration::One)
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
            path: "roundsync-store.json".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Secrets may live in the environment (or a .env file) instead of config.toml.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ROUNDSYNC_ANON_KEY") {
            self.backend.anon_key = key;
        }
        if let Ok(token) = std::env::var("ROUNDSYNC_ACCESS_TOKEN") {
            self.session.access_token = Some(token);
        }
        if let Ok(user) = std::env::var("ROUNDSYNC_USER_ID") {
            self.session.user_id = Some(user);
        }
    }
}
