//! Configuration loading from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
}

/// Client configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Marketplace REST base URL
    pub api_base_url: String,

    /// Bid broadcast WebSocket URL
    pub ws_url: String,

    /// Session token, if the host application supplies one via env
    pub auth_token: Option<String>,

    /// Connection attempts before giving up (initial connect and each reconnect)
    pub max_reconnect_attempts: u32,

    /// First delay between attempts, doubled after each failure
    pub reconnect_delay_ms: u64,

    /// Upper bound for the attempt delay
    pub max_reconnect_delay_ms: u64,

    pub connect_timeout_secs: u64,

    /// Round-trip bound for accept/reject/counter
    pub command_timeout_secs: u64,

    pub ping_interval_secs: u64,

    /// Drop the link when nothing arrives for this long
    pub idle_timeout_secs: u64,

    /// Apply actions locally before the server confirms them
    pub optimistic_updates: bool,

    /// Refuse counter-offers that do not exceed the original bid
    pub require_counter_above_bid: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            ws_url: "ws://localhost:3000/ws".to_string(),
            auth_token: None,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            connect_timeout_secs: 10,
            command_timeout_secs: 15,
            ping_interval_secs: 20,
            idle_timeout_secs: 60,
            optimistic_updates: true,
            require_counter_above_bid: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - MARKET_API_URL: marketplace REST base URL
    ///
    /// Optional variables (with defaults):
    /// - MARKET_WS_URL: broadcast URL (derived from MARKET_API_URL)
    /// - MARKET_AUTH_TOKEN: session token
    /// - MAX_RECONNECT_ATTEMPTS (5), RECONNECT_DELAY_MS (1000), MAX_RECONNECT_DELAY_MS (30000)
    /// - CONNECT_TIMEOUT_SECS (10), COMMAND_TIMEOUT_SECS (15)
    /// - PING_INTERVAL_SECS (20), IDLE_TIMEOUT_SECS (60)
    /// - OPTIMISTIC_UPDATES (true), REQUIRE_COUNTER_ABOVE_BID (false)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = env::var("MARKET_API_URL")
            .map_err(|_| ConfigError::MissingVar("MARKET_API_URL".to_string()))?;
        let api_url = Url::parse(&api_base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", api_base_url, e)))?;

        let ws_url = match env::var("MARKET_WS_URL") {
            Ok(raw) => {
                Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", raw, e)))?;
                raw
            }
            Err(_) => derive_ws_url(&api_url)?,
        };

        let auth_token = env::var("MARKET_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            ws_url,
            auth_token,
            max_reconnect_attempts: parse_var("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            reconnect_delay_ms: parse_var("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_delay_ms: parse_var("MAX_RECONNECT_DELAY_MS", defaults.max_reconnect_delay_ms),
            connect_timeout_secs: parse_var("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            command_timeout_secs: parse_var("COMMAND_TIMEOUT_SECS", defaults.command_timeout_secs),
            ping_interval_secs: parse_var("PING_INTERVAL_SECS", defaults.ping_interval_secs),
            idle_timeout_secs: parse_var("IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            optimistic_updates: parse_var("OPTIMISTIC_UPDATES", defaults.optimistic_updates),
            require_counter_above_bid: parse_var(
                "REQUIRE_COUNTER_ABOVE_BID",
                defaults.require_counter_above_bid,
            ),
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// `http(s)://host/api` -> `ws(s)://host/ws`
fn derive_ws_url(api_url: &Url) -> Result<String, ConfigError> {
    let scheme = match api_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ConfigError::InvalidUrl(format!(
                "cannot derive WebSocket URL from scheme {}",
                other
            )))
        }
    };

    let mut ws = api_url.clone();
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::InvalidUrl(api_url.to_string()))?;
    ws.set_path("/ws");
    ws.set_query(None);
    Ok(ws.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
