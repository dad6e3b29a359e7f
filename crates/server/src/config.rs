//! Server configuration, loaded from a TOML file with environment-variable
//! fallbacks for secrets.

use serde::Deserialize;

use leafline_compliance::{
    GateConfig, QuietHours, default_opt_in_keywords, default_opt_out_keywords,
};

use crate::error::ServerError;

/// Top-level configuration for the Leafline server.
#[derive(Debug, Default, Deserialize)]
pub struct LeaflineConfig {
    /// HTTP bind configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Queue backend configuration.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Carrier configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Compliance policy configuration.
    #[serde(default)]
    pub compliance: ComplianceConfig,
    /// Worker pool configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// API-level rate limiting, consumed by the fronting HTTP layer.
    #[serde(default)]
    pub rate_limit: ApiRateLimitConfig,
}

/// HTTP bind configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// External base URL of the API (used in links and confirmations).
    pub api_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_base_url: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    3000
}

/// Store configuration.
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Falls back to `DATABASE_URL`.
    pub url: Option<String>,
    /// Connection pool bounds.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Connection pool bounds.
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Minimum pooled connections.
    #[serde(default = "default_pool_min")]
    pub min: u32,
    /// Maximum pooled connections.
    #[serde(default = "default_pool_max")]
    pub max: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
        }
    }
}

fn default_pool_min() -> u32 {
    2
}

fn default_pool_max() -> u32 {
    10
}

/// Queue backend configuration.
#[derive(Debug, Default, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL. Falls back to `REDIS_URL`.
    pub url: Option<String>,
}

/// Carrier configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderConfig {
    /// Carrier API key. Falls back to `TELNYX_API_KEY`. Required.
    pub api_key: Option<String>,
    /// Base64 Ed25519 public key for webhook verification. Falls back to
    /// `TELNYX_PUBLIC_KEY`.
    pub public_key: Option<String>,
    /// Default messaging-profile id for locations without a dedicated
    /// sending number.
    pub messaging_profile_id: Option<String>,
    /// API base URL override (testing).
    pub api_base_url: Option<String>,
}

/// Compliance policy configuration.
#[derive(Debug, Deserialize)]
pub struct ComplianceConfig {
    /// Quiet-hours window boundaries.
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
    /// Per-recipient daily message limit.
    #[serde(default = "default_max_per_day")]
    pub max_messages_per_day_per_recipient: u32,
    /// Opt-out keywords (matched case-insensitively).
    #[serde(default = "default_opt_out_keywords")]
    pub opt_out_keywords: Vec<String>,
    /// Opt-in keywords.
    #[serde(default = "default_opt_in_keywords")]
    pub opt_in_keywords: Vec<String>,
    /// Fallback IANA timezone for recipients without one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            quiet_hours: QuietHoursConfig::default(),
            max_messages_per_day_per_recipient: default_max_per_day(),
            opt_out_keywords: default_opt_out_keywords(),
            opt_in_keywords: default_opt_in_keywords(),
            default_timezone: default_timezone(),
        }
    }
}

fn default_max_per_day() -> u32 {
    3
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_owned()
}

/// Quiet-hours window boundaries in `HH:MM`.
#[derive(Debug, Deserialize)]
pub struct QuietHoursConfig {
    /// When the window opens.
    #[serde(default = "default_quiet_start")]
    pub start: String,
    /// When the window closes.
    #[serde(default = "default_quiet_end")]
    pub end: String,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            start: default_quiet_start(),
            end: default_quiet_end(),
        }
    }
}

fn default_quiet_start() -> String {
    "21:00".to_owned()
}

fn default_quiet_end() -> String {
    "08:00".to_owned()
}

/// Worker pool configuration.
#[derive(Debug, Deserialize)]
pub struct QueueConfig {
    /// Concurrent SMS delivery workers.
    #[serde(default = "default_sms_concurrency")]
    pub sms_concurrency: usize,
    /// Concurrent campaign expansion workers.
    #[serde(default = "default_campaign_concurrency")]
    pub campaign_concurrency: usize,
    /// Idle worker poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Dispatch rate limit, tuned to the carrier throughput cap.
    #[serde(default)]
    pub rate_limit: DispatchRateLimit,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sms_concurrency: default_sms_concurrency(),
            campaign_concurrency: default_campaign_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            rate_limit: DispatchRateLimit::default(),
        }
    }
}

fn default_sms_concurrency() -> usize {
    10
}

fn default_campaign_concurrency() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Dispatched-jobs-per-interval cap.
#[derive(Debug, Deserialize)]
pub struct DispatchRateLimit {
    /// Jobs per interval.
    #[serde(default = "default_rate_max")]
    pub max: u32,
    /// Interval length in milliseconds.
    #[serde(default = "default_rate_interval_ms")]
    pub interval_ms: u64,
}

impl Default for DispatchRateLimit {
    fn default() -> Self {
        Self {
            max: default_rate_max(),
            interval_ms: default_rate_interval_ms(),
        }
    }
}

fn default_rate_max() -> u32 {
    100
}

fn default_rate_interval_ms() -> u64 {
    1_000
}

/// API-level rate limiting. The core parses and exposes it; enforcement
/// lives in the fronting HTTP layer.
#[derive(Debug, Deserialize)]
pub struct ApiRateLimitConfig {
    /// Window length in milliseconds.
    #[serde(default = "default_api_window_ms")]
    pub window_ms: u64,
    /// Requests per window.
    #[serde(default = "default_api_max")]
    pub max: u32,
}

impl Default for ApiRateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_api_window_ms(),
            max: default_api_max(),
        }
    }
}

fn default_api_window_ms() -> u64 {
    60_000
}

fn default_api_max() -> u32 {
    120
}

impl LeaflineConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist, then apply environment overrides.
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let mut config: Self = if std::path::Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents).map_err(|e| ServerError::Config(e.to_string()))?
        } else {
            tracing::info!(path, "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Fill secrets from the environment when the file omitted them.
    pub fn apply_env_overrides(&mut self) {
        if self.database.url.is_none() {
            self.database.url = std::env::var("DATABASE_URL").ok();
        }
        if self.redis.url.is_none() {
            self.redis.url = std::env::var("REDIS_URL").ok();
        }
        if self.provider.api_key.is_none() {
            self.provider.api_key = std::env::var("TELNYX_API_KEY").ok();
        }
        if self.provider.public_key.is_none() {
            self.provider.public_key = std::env::var("TELNYX_PUBLIC_KEY").ok();
        }
    }

    /// Check the fields the server cannot start without.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.database.url.is_none() {
            return Err(ServerError::Config(
                "database.url is required (or set DATABASE_URL)".into(),
            ));
        }
        if self.redis.url.is_none() {
            return Err(ServerError::Config(
                "redis.url is required (or set REDIS_URL)".into(),
            ));
        }
        if self.provider.api_key.is_none() {
            return Err(ServerError::Config(
                "provider.api_key is required (or set TELNYX_API_KEY)".into(),
            ));
        }
        Ok(())
    }

    /// Build the resolved gate configuration.
    pub fn gate_config(&self) -> Result<GateConfig, ServerError> {
        let quiet_hours =
            QuietHours::parse(&self.compliance.quiet_hours.start, &self.compliance.quiet_hours.end)
                .map_err(|e| ServerError::Config(e.to_string()))?;
        let default_timezone = self
            .compliance
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| {
                ServerError::Config(format!(
                    "unknown compliance.default_timezone: {}",
                    self.compliance.default_timezone
                ))
            })?;
        Ok(GateConfig {
            quiet_hours,
            max_messages_per_day_per_recipient: self.compliance.max_messages_per_day_per_recipient,
            opt_out_keywords: upper(&self.compliance.opt_out_keywords),
            opt_in_keywords: upper(&self.compliance.opt_in_keywords),
            default_timezone,
        })
    }
}

fn upper(keywords: &[String]) -> Vec<String> {
    keywords.iter().map(|k| k.to_uppercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: LeaflineConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.pool.min, 2);
        assert_eq!(config.database.pool.max, 10);
        assert_eq!(config.compliance.quiet_hours.start, "21:00");
        assert_eq!(config.compliance.quiet_hours.end, "08:00");
        assert_eq!(config.compliance.max_messages_per_day_per_recipient, 3);
        assert_eq!(config.queue.sms_concurrency, 10);
        assert_eq!(config.queue.campaign_concurrency, 2);
        assert_eq!(config.queue.rate_limit.max, 100);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config: LeaflineConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [database]
            url = "postgres://localhost/leafline"

            [database.pool]
            min = 1
            max = 4

            [compliance.quiet_hours]
            start = "20:00"
            end = "09:30"

            [compliance]
            max_messages_per_day_per_recipient = 5

            [queue.rate_limit]
            max = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.pool.max, 4);
        assert_eq!(config.compliance.quiet_hours.end, "09:30");
        assert_eq!(config.compliance.max_messages_per_day_per_recipient, 5);
        assert_eq!(config.queue.rate_limit.max, 50);
    }

    #[test]
    fn gate_config_parses_window_and_timezone() {
        let config: LeaflineConfig = toml::from_str("").unwrap();
        let gate = config.gate_config().unwrap();
        assert_eq!(gate.max_messages_per_day_per_recipient, 3);
        assert_eq!(gate.default_timezone, chrono_tz::America::Los_Angeles);
        assert!(gate.opt_out_keywords.contains(&"STOP".to_owned()));
    }

    #[test]
    fn gate_config_rejects_bad_window() {
        let config: LeaflineConfig = toml::from_str(
            r#"
            [compliance.quiet_hours]
            start = "25:00"
            "#,
        )
        .unwrap();
        assert!(config.gate_config().is_err());
    }

    #[test]
    fn validate_requires_secrets() {
        let config: LeaflineConfig = toml::from_str(
            r#"
            [database]
            url = "postgres://localhost/leafline"

            [redis]
            url = "redis://localhost"
            "#,
        )
        .unwrap();
        // Provider key still missing.
        assert!(config.validate().is_err());
    }

    #[test]
    fn keywords_are_uppercased() {
        let config: LeaflineConfig = toml::from_str(
            r#"
            [compliance]
            opt_out_keywords = ["stop", "basta"]
            "#,
        )
        .unwrap();
        let gate = config.gate_config().unwrap();
        assert!(gate.opt_out_keywords.contains(&"BASTA".to_owned()));
    }
}
