use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::warn;

use crate::config::schema::Config;
use crate::errors::{Result, TetherError};

/// Load configuration: defaults, then the optional JSON file, then
/// environment overrides, then validation.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("read config at {}", path.display()))
                .map_err(TetherError::Internal)?;
            serde_json::from_str(&content)
                .with_context(|| format!("parse config at {}", path.display()))
                .map_err(TetherError::Internal)?
        }
        _ => Config::default(),
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Environment wins over the file. `LOG_LEVEL` is consumed directly by
/// the subscriber in `main`, not here.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(env) = first_env(&["ENVIRONMENT", "APP_ENV"]) {
        match env.parse() {
            Ok(parsed) => config.environment = parsed,
            Err(e) => warn!("ignoring environment override: {}", e),
        }
    }
    if let Ok(secret) = std::env::var("JWT_SECRET") {
        config.auth.jwt_secret = secret;
    }
    if let Ok(key) = std::env::var("DATA_ENCRYPTION_KEY") {
        config.encryption.key = key;
    }
    if let Some(version) = parse_env("DATA_ENCRYPTION_VERSION") {
        config.encryption.version = version;
    }
    if let Ok(raw) = std::env::var("DATA_ENCRYPTION_LEGACY_KEYS") {
        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(map) => {
                for (version, key) in map {
                    match version.parse::<u16>() {
                        Ok(version) => {
                            config.encryption.legacy_keys.insert(version, key);
                        }
                        Err(_) => warn!(
                            "ignoring legacy key with non-numeric version {:?}",
                            version
                        ),
                    }
                }
            }
            Err(e) => warn!("DATA_ENCRYPTION_LEGACY_KEYS is not a JSON object: {}", e),
        }
    }
    if let Some(limit) = parse_env("RATE_LIMIT_PER_MINUTE") {
        config.rate_limit.per_minute = limit;
    }
    if let Some(limit) = parse_env("RATE_LIMIT_AI_PER_MINUTE") {
        config.rate_limit.ai_per_minute = limit;
    }
    if let Ok(path) = std::env::var("TETHER_DB_PATH") {
        config.chat.db_path = path.into();
    }
    if let Ok(host) = std::env::var("TETHER_HOST") {
        config.gateway.host = host;
    }
    if let Some(port) = parse_env("TETHER_PORT") {
        config.gateway.port = port;
    }
    if let Ok(url) = std::env::var("SUMMARIZER_URL") {
        config.summarizer.url = Some(url);
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| std::env::var(name).ok())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}
