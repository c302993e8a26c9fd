use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::reconciler::ReconcilerSettings;

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_f64(key: &str, default: f64) -> Result<f64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<f64>()
            .map_err(|e| anyhow!("{key} invalid float: {e}"))?),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<usize>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn to_port(key: &str, raw: usize) -> Result<u16> {
    u16::try_from(raw).map_err(|_| anyhow!("{key} must be <= 65535 (got {raw})"))
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Backend
    pub backend_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub http_timeout_secs: f64,
    pub user_id: String,

    // Poller
    pub poll_interval_secs: f64,
    pub poll_failure_threshold: usize,

    // Commands
    pub command_timeout_secs: f64,
    pub sync_days: usize,

    // Change feed
    pub feed_enabled: bool,
    pub feed_ws_url: String,
    #[serde(skip_serializing)]
    pub feed_api_key: String,
    pub feed_heartbeat_secs: f64,
    pub feed_max_backoff_secs: f64,

    // Journal / dashboard
    pub sqlite_path: String,
    pub dashboard_enabled: bool,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    pub dashboard_cors_origins: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let api_key = get_env_string("API_KEY", "change-me");
        let feed_api_key = get_env("FEED_API_KEY")
            .or_else(|| get_env("SUPABASE_KEY"))
            .unwrap_or_default();

        let dashboard_cors_origins = get_env_string(
            "DASHBOARD_CORS_ORIGINS",
            "http://localhost:3000,http://127.0.0.1:3000",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        let s = Self {
            backend_url: get_env_string("BACKEND_URL", "http://127.0.0.1:8000"),
            api_key,
            http_timeout_secs: get_env_f64("HTTP_TIMEOUT_SECS", 8.0)?,
            user_id: get_env_string("DASHBOARD_USER_ID", "velocity_bot"),
            poll_interval_secs: get_env_f64("POLL_INTERVAL_SECS", 5.0)?,
            poll_failure_threshold: get_env_usize("POLL_FAILURE_THRESHOLD", 3)?,
            command_timeout_secs: get_env_f64("COMMAND_TIMEOUT_SECS", 10.0)?,
            sync_days: get_env_usize("SYNC_DAYS", 30)?,
            feed_enabled: get_env_bool("FEED_ENABLED", true),
            feed_ws_url: get_env_string("FEED_WS_URL", ""),
            feed_api_key,
            feed_heartbeat_secs: get_env_f64("FEED_HEARTBEAT_SECS", 30.0)?,
            feed_max_backoff_secs: get_env_f64("FEED_MAX_BACKOFF_SECS", 30.0)?,
            sqlite_path: get_env_string("SQLITE_PATH", "./data/dashsync.sqlite"),
            dashboard_enabled: get_env_bool("DASHBOARD_ENABLED", true),
            dashboard_host: get_env_string("DASHBOARD_HOST", "127.0.0.1"),
            dashboard_port: to_port("DASHBOARD_PORT", get_env_usize("DASHBOARD_PORT", 8080)?)?,
            dashboard_cors_origins,
        };

        s.validate()?;
        Ok(s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout_secs)
    }

    pub fn feed_heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.feed_heartbeat_secs)
    }

    pub fn feed_max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.feed_max_backoff_secs)
    }

    /// The change feed runs only when enabled and pointed somewhere.
    pub fn feed_active(&self) -> bool {
        self.feed_enabled && !self.feed_ws_url.is_empty()
    }

    pub fn reconciler(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            command_timeout: Duration::from_secs_f64(self.command_timeout_secs),
            poll_failure_threshold: self.poll_failure_threshold as u32,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(anyhow!(
                "BACKEND_URL must be an http(s) url (got {})",
                self.backend_url
            ));
        }
        if self.api_key.is_empty() {
            return Err(anyhow!("API_KEY must not be empty"));
        }
        if !self.poll_interval_secs.is_finite() || self.poll_interval_secs < 0.5 {
            return Err(anyhow!(
                "POLL_INTERVAL_SECS must be >= 0.5 (got {})",
                self.poll_interval_secs
            ));
        }
        if self.poll_failure_threshold < 1 {
            return Err(anyhow!(
                "POLL_FAILURE_THRESHOLD must be >= 1 (got {})",
                self.poll_failure_threshold
            ));
        }
        if !self.command_timeout_secs.is_finite() || self.command_timeout_secs <= 0.0 {
            return Err(anyhow!(
                "COMMAND_TIMEOUT_SECS must be > 0 (got {})",
                self.command_timeout_secs
            ));
        }
        if !self.http_timeout_secs.is_finite() || self.http_timeout_secs <= 0.0 {
            return Err(anyhow!(
                "HTTP_TIMEOUT_SECS must be > 0 (got {})",
                self.http_timeout_secs
            ));
        }
        if !self.feed_heartbeat_secs.is_finite() || self.feed_heartbeat_secs < 1.0 {
            return Err(anyhow!(
                "FEED_HEARTBEAT_SECS must be >= 1 (got {})",
                self.feed_heartbeat_secs
            ));
        }
        if !self.feed_max_backoff_secs.is_finite() || self.feed_max_backoff_secs < 1.0 {
            return Err(anyhow!(
                "FEED_MAX_BACKOFF_SECS must be >= 1 (got {})",
                self.feed_max_backoff_secs
            ));
        }
        if self.feed_enabled
            && !self.feed_ws_url.is_empty()
            && !self.feed_ws_url.starts_with("ws://")
            && !self.feed_ws_url.starts_with("wss://")
        {
            return Err(anyhow!(
                "FEED_WS_URL must be a ws(s) url (got {})",
                self.feed_ws_url
            ));
        }
        if self.sync_days < 1 {
            return Err(anyhow!("SYNC_DAYS must be >= 1 (got {})", self.sync_days));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        backend_url: "http://127.0.0.1:8000".to_string(),
        api_key: "test-key".to_string(),
        http_timeout_secs: 2.0,
        user_id: "velocity_bot".to_string(),
        poll_interval_secs: 5.0,
        poll_failure_threshold: 3,
        command_timeout_secs: 10.0,
        sync_days: 30,
        feed_enabled: false,
        feed_ws_url: String::new(),
        feed_api_key: String::new(),
        feed_heartbeat_secs: 30.0,
        feed_max_backoff_secs: 30.0,
        sqlite_path: ":memory:".to_string(),
        dashboard_enabled: false,
        dashboard_host: "127.0.0.1".to_string(),
        dashboard_port: 8080,
        dashboard_cors_origins: vec![],
    }
}
