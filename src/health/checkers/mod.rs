//! Component health probes.
//!
//! Each checker answers one question about one dependency. The
//! supervisor runs them in parallel with a per-checker deadline and
//! folds the answers into the service state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::warn;
use uuid::Uuid;

use crate::chat::ChatStore;

/// Outcome of one probe of one named checker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub ok: bool,
    pub err: Option<String>,
    pub at: DateTime<Utc>,
}

impl HealthCheckResult {
    fn passing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            err: None,
            at: Utc::now(),
        }
    }

    fn failing(name: &str, err: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            err: Some(err.into()),
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> anyhow::Result<()>;
}

/// Run one checker and fold the outcome into a [`HealthCheckResult`].
pub async fn run_checker(checker: &dyn HealthChecker) -> HealthCheckResult {
    match checker.check().await {
        Ok(()) => HealthCheckResult::passing(checker.name()),
        Err(e) => HealthCheckResult::failing(checker.name(), e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// The store handle must exist and a trivial query must return its
/// expected constant.
pub struct DatabaseChecker {
    name: String,
    store: Arc<dyn ChatStore>,
}

impl DatabaseChecker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            name: "database".to_string(),
            store,
        }
    }
}

#[async_trait]
impl HealthChecker for DatabaseChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.store
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("database ping failed: {}", e))
    }
}

// ---------------------------------------------------------------------------
// Key-value cache
// ---------------------------------------------------------------------------

/// Minimal cache surface the checker exercises.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<String>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// In-process cache used when no external cache is configured.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    map: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn ping(&self) -> anyhow::Result<String> {
        Ok("PONG".to_string())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// PING must answer PONG, and a set-then-get of a unique ephemeral key
/// must round-trip before being deleted.
pub struct CacheChecker {
    name: String,
    kv: Arc<dyn KeyValueStore>,
}

impl CacheChecker {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            name: "cache".to_string(),
            kv,
        }
    }
}

#[async_trait]
impl HealthChecker for CacheChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        let pong = self.kv.ping().await?;
        if pong != "PONG" {
            anyhow::bail!("cache ping answered {:?}, expected \"PONG\"", pong);
        }

        let key = format!("healthcheck:{}", Uuid::new_v4().simple());
        let value = Uuid::new_v4().simple().to_string();
        self.kv.set(&key, &value).await?;
        let read_back = self.kv.get(&key).await?;
        self.kv.delete(&key).await?;
        if read_back.as_deref() != Some(value.as_str()) {
            anyhow::bail!("cache read-back mismatch for ephemeral key");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP dependency
// ---------------------------------------------------------------------------

/// GET against a dependency with a health-check marker header. Retries a
/// fixed number of times with a flat 100ms gap; 2xx and 3xx count as up.
pub struct HttpChecker {
    name: String,
    client: reqwest::Client,
    url: String,
    retries: u32,
}

const HTTP_RETRY_GAP: Duration = Duration::from_millis(100);

impl HttpChecker {
    pub fn new(name: impl Into<String>, client: reqwest::Client, url: impl Into<String>, retries: u32) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            retries,
        }
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        let mut last_err = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(HTTP_RETRY_GAP).await;
            }
            let outcome = self
                .client
                .get(&self.url)
                .header("User-Agent", concat!("tether-health/", env!("CARGO_PKG_VERSION")))
                .header("X-Health-Check", "true")
                .send()
                .await;
            match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..400).contains(&status) {
                        return Ok(());
                    }
                    last_err = Some(anyhow::anyhow!("{} answered status {}", self.url, status));
                }
                Err(e) => last_err = Some(anyhow::anyhow!("{} unreachable: {}", self.url, e)),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} unreachable", self.url)))
    }
}

// ---------------------------------------------------------------------------
// Composite / dependency groups
// ---------------------------------------------------------------------------

/// Aggregates named checkers; any failure fails the composite with the
/// concatenated per-name messages.
pub struct CompositeChecker {
    name: String,
    checkers: Vec<Arc<dyn HealthChecker>>,
}

impl CompositeChecker {
    pub fn new(name: impl Into<String>, checkers: Vec<Arc<dyn HealthChecker>>) -> Self {
        Self {
            name: name.into(),
            checkers,
        }
    }
}

#[async_trait]
impl HealthChecker for CompositeChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        let results = join_all(self.checkers.iter().map(|c| run_checker(c.as_ref()))).await;
        let failures: Vec<String> = results
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("{}: {}", r.name, r.err.as_deref().unwrap_or("failed")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{}", failures.join("; "))
        }
    }
}

/// Critical dependencies fail the group; optional ones only log.
pub struct DependencyChecker {
    name: String,
    critical: Vec<Arc<dyn HealthChecker>>,
    optional: Vec<Arc<dyn HealthChecker>>,
}

impl DependencyChecker {
    pub fn new(
        name: impl Into<String>,
        critical: Vec<Arc<dyn HealthChecker>>,
        optional: Vec<Arc<dyn HealthChecker>>,
    ) -> Self {
        Self {
            name: name.into(),
            critical,
            optional,
        }
    }
}

#[async_trait]
impl HealthChecker for DependencyChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        let optional = join_all(self.optional.iter().map(|c| run_checker(c.as_ref()))).await;
        for result in optional.iter().filter(|r| !r.ok) {
            warn!(
                "optional dependency {} unhealthy: {}",
                result.name,
                result.err.as_deref().unwrap_or("failed")
            );
        }

        let critical = join_all(self.critical.iter().map(|c| run_checker(c.as_ref()))).await;
        let failures: Vec<String> = critical
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("{}: {}", r.name, r.err.as_deref().unwrap_or("failed")))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("critical dependencies down: {}", failures.join("; "))
        }
    }
}

// ---------------------------------------------------------------------------
// Load balancer pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
}

/// Judges a backend pool snapshot: an empty pool or a fully-unhealthy
/// pool fails outright; under half healthy is reported as degraded with
/// the observed ratio.
pub struct LoadBalancerChecker {
    name: String,
    stats: Arc<dyn Fn() -> PoolStats + Send + Sync>,
}

impl LoadBalancerChecker {
    pub fn new(name: impl Into<String>, stats: Arc<dyn Fn() -> PoolStats + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            stats,
        }
    }
}

#[async_trait]
impl HealthChecker for LoadBalancerChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<()> {
        let stats = (self.stats)();
        if stats.total == 0 {
            anyhow::bail!("no backends registered");
        }
        if stats.healthy == 0 {
            anyhow::bail!("all {} backends unhealthy", stats.total);
        }
        let ratio = stats.healthy as f64 / stats.total as f64;
        if ratio < 0.5 {
            anyhow::bail!(
                "degraded: only {:.0}% of backends healthy ({}/{})",
                ratio * 100.0,
                stats.healthy,
                stats.total
            );
        }
        Ok(())
    }
}
