//! Client configuration loaded from environment.

use crate::realtime::connection::DEFAULT_URL;

/// Client configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Default realtime endpoint (e.g. `ws://localhost:3001`).
    pub ws_url: String,
    /// Log filter: `error`, `warn`, `info`, `debug`, `trace` or a full directive.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_URL.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let ws_url = std::env::var("REALTIME_WS_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        let ws_url = validate_url(ws_url)?;

        let log_level = std::env::var("REALTIME_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(Self { ws_url, log_level })
    }

    /// Override the endpoint, e.g. from a CLI flag
    pub fn with_url(mut self, url: impl Into<String>) -> Result<Self, ConfigLoadError> {
        self.ws_url = validate_url(url.into())?;
        Ok(self)
    }
}

fn validate_url(url: String) -> Result<String, ConfigLoadError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(url)
    } else {
        Err(ConfigLoadError::InvalidUrl(url))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid REALTIME_WS_URL (expected ws:// or wss://): {0}")]
    InvalidUrl(String),
}
