use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::crypto::production_ready;
use crate::errors::{Result, TetherError};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

fn default_db_path() -> PathBuf {
    PathBuf::from("tether.db")
}

fn default_max_message_len() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_message_len: default_max_message_len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

fn default_access_ttl_minutes() -> i64 {
    15
}

fn default_refresh_ttl_days() -> i64 {
    30
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_access_ttl_minutes")]
    pub access_ttl_minutes: i64,
    #[serde(default = "default_refresh_ttl_days")]
    pub refresh_ttl_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_ttl_minutes: default_access_ttl_minutes(),
            refresh_ttl_days: default_refresh_ttl_days(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field(
                "jwt_secret",
                &if self.jwt_secret.is_empty() { "[empty]" } else { "[REDACTED]" },
            )
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_days", &self.refresh_ttl_days)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

fn default_encryption_version() -> u16 {
    2
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_encryption_version")]
    pub version: u16,
    /// Retired keys by version, e.g. `{"1": "old-key"}`.
    #[serde(default)]
    pub legacy_keys: HashMap<u16, String>,
    /// Accept unprefixed v1 payloads when version routing fails. Unset
    /// means on in development, off elsewhere.
    #[serde(default)]
    pub legacy_fallback: Option<bool>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            version: default_encryption_version(),
            legacy_keys: HashMap::new(),
            legacy_fallback: None,
        }
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &if self.key.is_empty() { "[empty]" } else { "[REDACTED]" })
            .field("version", &self.version)
            .field("legacy_keys", &format!("[{} key(s)]", self.legacy_keys.len()))
            .field("legacy_fallback", &self.legacy_fallback)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_checker_deadline_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_checker_deadline_secs")]
    pub checker_deadline_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// HTTP dependencies probed on every cycle.
    #[serde(default)]
    pub dependency_urls: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            checker_deadline_secs: default_checker_deadline_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            dependency_urls: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

fn default_rate_limit_per_minute() -> u32 {
    120
}

fn default_ai_rate_limit_per_minute() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_ai_rate_limit_per_minute")]
    pub ai_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_rate_limit_per_minute(),
            ai_per_minute: default_ai_rate_limit_per_minute(),
        }
    }
}

// ---------------------------------------------------------------------------
// Summarizer
// ---------------------------------------------------------------------------

fn default_summarizer_timeout_secs() -> u64 {
    30
}

fn default_summary_last_n() -> u32 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_summarizer_timeout_secs")]
    pub timeout_secs: u64,
    /// How many trailing messages feed one summary.
    #[serde(default = "default_summary_last_n")]
    pub last_n_messages: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_summarizer_timeout_secs(),
            last_n_messages: default_summary_last_n(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub gateway: GatewayConfig,
    pub chat: ChatConfig,
    pub auth: AuthConfig,
    pub encryption: EncryptionConfig,
    pub health: HealthConfig,
    pub rate_limit: RateLimitConfig,
    pub summarizer: SummarizerConfig,
}

impl Config {
    /// Legacy-payload tolerance: explicit setting wins, otherwise only
    /// development environments accept unprefixed payloads.
    pub fn legacy_fallback(&self) -> bool {
        self.encryption
            .legacy_fallback
            .unwrap_or(self.environment == Environment::Development)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.enabled && self.gateway.port == 0 {
            return Err(TetherError::validation("gateway.port", "must not be 0"));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(TetherError::validation(
                "auth.jwt_secret",
                "required; set JWT_SECRET",
            ));
        }
        if self.encryption.key.is_empty() {
            return Err(TetherError::validation(
                "encryption.key",
                "required; set DATA_ENCRYPTION_KEY",
            ));
        }
        if self.encryption.version == 0 {
            return Err(TetherError::validation(
                "encryption.version",
                "must be greater than 0",
            ));
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.ai_per_minute == 0 {
            return Err(TetherError::validation(
                "rate_limit",
                "limits must be greater than 0",
            ));
        }
        if self.environment.is_production() {
            production_ready(&self.encryption.key)?;
            if self.auth.jwt_secret.len() < 16 {
                return Err(TetherError::validation(
                    "auth.jwt_secret",
                    "production secrets must be at least 16 bytes",
                ));
            }
        }
        Ok(())
    }
}
