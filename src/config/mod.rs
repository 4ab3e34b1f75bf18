use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub pipelines: PipelineConfig,
    #[serde(default)]
    pub exports: ExportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:./data/tenantdesk.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Platform admin API token
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    /// Session lifetime in hours (default: 7 days)
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// Platform admin created on first start when no user exists
    pub bootstrap_email: Option<String>,
    pub bootstrap_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
            session_ttl_hours: default_session_ttl_hours(),
            bootstrap_email: None,
            bootstrap_password: None,
        }
    }
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

fn default_session_ttl_hours() -> i64 {
    168
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests per window for general API endpoints
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    /// Requests per window for login/logout
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Seconds between sweeps of stale limiter entries
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_window: default_api_requests(),
            auth_requests_per_window: default_auth_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_requests() -> u32 {
    300
}

fn default_auth_requests() -> u32 {
    20
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Delivery attempts per event, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Per-request timeout
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failed deliveries before a webhook is disabled
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_webhook_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_failure_threshold() -> i64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Run retention policies and soft-expiry in the background
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_retention_interval(),
        }
    }
}

fn default_retention_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            tick_secs: default_tick_secs(),
        }
    }
}

fn default_tick_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Days a completed export stays downloadable
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            expiry_days: default_expiry_days(),
        }
    }
}

fn default_expiry_days() -> i64 {
    7
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse configuration file")?;
        Ok(config)
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            webhooks: WebhookConfig::default(),
            retention: RetentionConfig::default(),
            pipelines: PipelineConfig::default(),
            exports: ExportConfig::default(),
        }
    }
}
