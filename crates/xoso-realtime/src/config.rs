use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 1000;

#[derive(Debug, Error)]
#[error("invalid value for {key}: '{value}'")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST backend, without trailing slash.
    pub api_url: String,
    /// WebSocket URL of the realtime server.
    pub socket_url: String,
    /// Bearer token from the session provider, if logged in.
    pub token: Option<String>,
    pub reconnect_delay: Duration,
    /// Upper bound for one persistence call.
    pub send_timeout: Duration,
    pub max_message_chars: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".into(),
            socket_url: "ws://localhost:5000/socket".into(),
            token: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

impl ClientConfig {
    /// Read `XOSO_*` variables from the process environment.
    /// Call `dotenvy::dotenv()` first if a `.env` file should apply.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("XOSO_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("XOSO_SOCKET_URL") {
            config.socket_url = url;
        }
        config.token = lookup("XOSO_TOKEN").filter(|t| !t.is_empty());

        if let Some(ms) = lookup("XOSO_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(parse("XOSO_RECONNECT_DELAY_MS", ms)?);
        }
        if let Some(secs) = lookup("XOSO_SEND_TIMEOUT_SECS") {
            config.send_timeout = Duration::from_secs(parse("XOSO_SEND_TIMEOUT_SECS", secs)?);
        }
        if let Some(max) = lookup("XOSO_MAX_MESSAGE_CHARS") {
            config.max_message_chars = parse("XOSO_MAX_MESSAGE_CHARS", max)? as usize;
        }

        Ok(config)
    }
}

fn parse(key: &'static str, value: String) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { key, value })
}
