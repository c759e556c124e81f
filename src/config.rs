//! # Configuration Management
//!
//! Loads relay settings from several layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (`APP__SECTION__KEY`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables: `HOST`, `PORT`, `RELAY_SESSION_SECRET`, `UPSTREAM_API_KEY`
//! 2. Prefixed environment variables (`APP__LIMITS__IDLE_TIMEOUT_MS=5000`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! `server.allowed_origins` and `upstream.alternative_language_codes` accept a
//! comma separated list when set from the environment.

use crate::trigger::SingingDetectorConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// HMAC-SHA256 keys shorter than this are refused at startup.
pub const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub upstream: UpstreamConfig,
    pub detector: SingingDetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Browser origins allowed to open a session. Requests without an
    /// `Origin` header (native clients) are not subject to this list.
    pub allowed_origins: Vec<String>,

    /// Take the client IP from `X-Forwarded-For` / `Forwarded` instead of the
    /// socket peer. Only enable behind a proxy that overwrites these headers.
    pub trust_forwarded_for: bool,
}

/// Session token settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HMAC key with the token issuer
    pub session_secret: String,

    /// Reject a second connection carrying an already used nonce
    pub replay_protection: bool,
}

// Keep the secret out of logs.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("session_secret", &"<redacted>")
            .field("replay_protection", &self.replay_protection)
            .finish()
    }
}

/// Per-session budgets and admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_session_duration_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_bytes_per_session: u64,
    pub rate_limit_max_connections: u32,
    pub rate_limit_window_ms: u64,
    /// Largest single WebSocket frame accepted from a client
    pub max_frame_bytes: usize,
}

/// Cloud speech service connection and recognition defaults.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: String,
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub language_code: String,
    pub alternative_language_codes: Vec<String>,
    pub interim_results: bool,
    pub connect_timeout_ms: u64,
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("encoding", &self.encoding)
            .field("sample_rate_hertz", &self.sample_rate_hertz)
            .field("language_code", &self.language_code)
            .field("alternative_language_codes", &self.alternative_language_codes)
            .field("interim_results", &self.interim_results)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            trust_forwarded_for: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // No usable default: startup fails until a secret is configured.
            session_secret: String::new(),
            replay_protection: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_session_duration_ms: 30_000,
            idle_timeout_ms: 10_000,
            max_bytes_per_session: 5 * 1024 * 1024,
            rate_limit_max_connections: 10,
            rate_limit_window_ms: 60_000,
            max_frame_bytes: 256 * 1024,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090/v1/speech:streamingRecognize".to_string(),
            api_key: String::new(),
            encoding: "LINEAR16".to_string(),
            sample_rate_hertz: 16_000,
            language_code: "en-US".to_string(),
            alternative_language_codes: Vec::new(),
            interim_results: true,
            connect_timeout_ms: 5_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__SERVER__ALLOWED_ORIGINS=https://a.example,https://b.example`
    /// - `APP__DETECTOR__HOLD_MS=800`: Override the detector hold time
    /// - `RELAY_SESSION_SECRET=...`: Token signing key
    /// - `UPSTREAM_API_KEY=...`: Cloud speech API key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
                    .with_list_parse_key("upstream.alternative_language_codes"),
            );

        // Deployment platforms set these without the APP prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(secret) = env::var("RELAY_SESSION_SECRET") {
            settings = settings.set_override("auth.session_secret", secret)?;
        }

        if let Ok(api_key) = env::var("UPSTREAM_API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the relay cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.auth.session_secret.len() < MIN_SECRET_BYTES {
            return Err(anyhow::anyhow!(
                "auth.session_secret must be at least {} bytes (set RELAY_SESSION_SECRET)",
                MIN_SECRET_BYTES
            ));
        }

        if self.server.allowed_origins.iter().any(|origin| origin.trim() == "*") {
            return Err(anyhow::anyhow!("Wildcard origins are not allowed; list each origin explicitly"));
        }

        let limits = &self.limits;
        for (name, value) in [
            ("max_session_duration_ms", limits.max_session_duration_ms),
            ("idle_timeout_ms", limits.idle_timeout_ms),
            ("max_bytes_per_session", limits.max_bytes_per_session),
            ("rate_limit_window_ms", limits.rate_limit_window_ms),
            ("max_frame_bytes", limits.max_frame_bytes as u64),
            ("rate_limit_max_connections", u64::from(limits.rate_limit_max_connections)),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("limits.{} must be greater than 0", name));
            }
        }

        if self.upstream.sample_rate_hertz == 0 {
            return Err(anyhow::anyhow!("upstream.sample_rate_hertz must be greater than 0"));
        }

        if self.upstream.url.is_empty() {
            return Err(anyhow::anyhow!("upstream.url must be set"));
        }

        self.detector
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid detector configuration: {}", e))?;

        Ok(())
    }
}

impl LimitsConfig {
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_millis(self.max_session_duration_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.auth.session_secret = "0123456789abcdef0123456789abcdef".to_string();
        config
    }

    #[test]
    fn test_default_budgets() {
        let config = AppConfig::default();
        assert_eq!(config.limits.max_session_duration(), Duration::from_secs(30));
        assert_eq!(config.limits.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.limits.max_bytes_per_session, 5_242_880);
        assert_eq!(config.limits.rate_limit_max_connections, 10);
        assert_eq!(config.limits.rate_limit_window(), Duration::from_secs(60));
        assert!(config.auth.replay_protection);
    }

    #[test]
    fn test_missing_secret_rejected() {
        assert!(AppConfig::default().validate().is_err());
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.auth.session_secret = "too-short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_origin_rejected() {
        let mut config = valid_config();
        config.server.allowed_origins.push("*".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = valid_config();
        config.limits.idle_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_detector_hysteresis_rejected() {
        let mut config = valid_config();
        config.detector.stop_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = valid_config();
        config.upstream.api_key = "super-secret-api-key".to_string();
        let printed = format!("{:?}", config);

        assert!(!printed.contains("0123456789abcdef"));
        assert!(!printed.contains("super-secret-api-key"));
        assert!(printed.contains("<redacted>"));
    }
}
