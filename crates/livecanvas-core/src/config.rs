//! Client configuration read from the environment.

use thiserror::Error;

/// Environment variable holding the room access key.
pub const PUBLIC_KEY_VAR: &str = "LIVECANVAS_PUBLIC_KEY";
/// Environment variable holding the relay URL.
pub const SERVER_URL_VAR: &str = "LIVECANVAS_SERVER_URL";
/// Relay used when no URL is configured.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3030/ws";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{PUBLIC_KEY_VAR} is not set")]
    MissingPublicKey,
    #[error("invalid server URL {0:?}: {1}")]
    InvalidServerUrl(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub public_key: String,
    pub server_url: String,
}

impl ClientConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let public_key = lookup(PUBLIC_KEY_VAR)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingPublicKey)?;

        let server_url = lookup(SERVER_URL_VAR)
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        url::Url::parse(&server_url)
            .map_err(|e| ConfigError::InvalidServerUrl(server_url.clone(), e.to_string()))?;

        Ok(Self {
            public_key,
            server_url,
        })
    }
}
