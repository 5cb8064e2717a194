//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible
//! defaults for development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `APP_MODE`: `development` or `production`. The development identity
//!   fallback is hard-disabled in production mode.
//! - `API_TOKENS`: comma-separated `token:user-id` pairs for the built-in
//!   bearer resolver (demo server only).
//! - `CORS_ALLOWED_ORIGINS`: comma-separated origin allow-list. Empty
//!   enables the loopback-only fallback.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{ApiError, ApiResult};

/// Process execution mode.
///
/// Gates development-only conveniences (identity fallback, error details).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    /// Parse from the `APP_MODE` environment value. Anything that is not
    /// `production` (or `prod`) is development.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Mode::Production,
            _ => Mode::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Mode::Production
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Execution mode (default: development)
    pub mode: Mode,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Bearer token table for the built-in resolver: `token:user-id` pairs.
    pub api_tokens: HashMap<String, String>,

    /// User ids granted admin access (empty = admin routes deny everyone).
    pub admin_user_ids: Vec<String>,

    /// Identity synthesized for unauthenticated requests in development
    /// mode. Ignored entirely in production.
    pub dev_fallback_identity: Option<String>,

    /// Explicit CORS origin allow-list. Empty enables the loopback-only
    /// fallback for credentialed origins.
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges for forwarded-IP validation.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Maximum requests per window for the default policy (0 = disabled).
    pub rate_limit_max_requests: u32,

    /// Window length for the default policy.
    pub rate_limit_window: Duration,

    /// Interval between expired-counter purge sweeps.
    pub store_purge_interval: Duration,

    // =========================================================================
    // Request Limits
    // =========================================================================
    /// Maximum request body size in bytes (default: 10MB).
    pub max_request_body_size: usize,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any value fails to parse or the
    /// combination is inconsistent.
    pub fn from_env() -> ApiResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            mode: Mode::parse(&env::var("APP_MODE").unwrap_or_default()),

            api_tokens: Self::parse_api_tokens(),
            admin_user_ids: Self::parse_list("ADMIN_USER_IDS"),
            dev_fallback_identity: env::var("DEV_FALLBACK_IDENTITY")
                .ok()
                .filter(|v| !v.is_empty()),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES"),

            rate_limit_max_requests: Self::parse_env("RATE_LIMIT_MAX_REQUESTS", 60)?,
            rate_limit_window: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_WINDOW_SECS",
                60,
            )?),
            store_purge_interval: Duration::from_secs(Self::parse_env(
                "STORE_PURGE_INTERVAL_SECS",
                60,
            )?),

            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?,

            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    fn validate(&self) -> ApiResult<()> {
        if self.rate_limit_max_requests > 0 && self.rate_limit_window.is_zero() {
            return Err(config_error(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0 when rate limiting is enabled",
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(config_error("MAX_REQUEST_BODY_SIZE must be greater than 0"));
        }

        if self.store_purge_interval.is_zero() {
            return Err(config_error(
                "STORE_PURGE_INTERVAL_SECS must be greater than 0",
            ));
        }

        if self.mode.is_production() && self.dev_fallback_identity.is_some() {
            // Hard error rather than a silent ignore: a fallback identity in
            // production config is a deployment mistake worth failing on
            return Err(config_error(
                "DEV_FALLBACK_IDENTITY must not be set in production mode",
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_max_requests > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address, or `None` when disabled.
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> ApiResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| config_error(&format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated environment list.
    fn parse_list(name: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse `API_TOKENS` as comma-separated `token:user-id` pairs.
    /// Malformed pairs are skipped.
    fn parse_api_tokens() -> HashMap<String, String> {
        env::var("API_TOKENS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (token, user_id) = pair.trim().split_once(':')?;
                if token.is_empty() || user_id.is_empty() {
                    return None;
                }
                Some((token.to_string(), user_id.to_string()))
            })
            .collect()
    }
}

fn config_error(message: &str) -> ApiError {
    ApiError::Internal(anyhow::anyhow!("Configuration error: {message}"))
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            mode: Mode::Development,
            api_tokens: HashMap::new(),
            admin_user_ids: vec![],
            dev_fallback_identity: None,
            cors_allowed_origins: vec![],
            trusted_proxies: vec![],
            rate_limit_max_requests: 60,
            rate_limit_window: Duration::from_secs(60),
            store_purge_interval: Duration::from_secs(60),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}
