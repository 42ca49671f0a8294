use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Result, TetherError};

/// Tolerance on the four-component sum.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

const KEY_SEMANTIC: &str = "semantic";
const KEY_INTEREST: &str = "interest";
const KEY_GEO: &str = "geo";
const KEY_RECENCY: &str = "recency";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    pub semantic: f64,
    pub interest: f64,
    pub geo: f64,
    pub recency: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            interest: 0.2,
            geo: 0.1,
            recency: 0.1,
        }
    }
}

impl RankingWeights {
    fn from_map(map: &HashMap<String, f64>) -> Self {
        let defaults = Self::default();
        Self {
            semantic: map.get(KEY_SEMANTIC).copied().unwrap_or(defaults.semantic),
            interest: map.get(KEY_INTEREST).copied().unwrap_or(defaults.interest),
            geo: map.get(KEY_GEO).copied().unwrap_or(defaults.geo),
            recency: map.get(KEY_RECENCY).copied().unwrap_or(defaults.recency),
        }
    }

    fn to_map(self) -> HashMap<String, f64> {
        HashMap::from([
            (KEY_SEMANTIC.to_string(), self.semantic),
            (KEY_INTEREST.to_string(), self.interest),
            (KEY_GEO.to_string(), self.geo),
            (KEY_RECENCY.to_string(), self.recency),
        ])
    }

    pub fn apply(self, patch: &WeightPatch) -> Self {
        Self {
            semantic: patch.semantic.unwrap_or(self.semantic),
            interest: patch.interest.unwrap_or(self.interest),
            geo: patch.geo.unwrap_or(self.geo),
            recency: patch.recency.unwrap_or(self.recency),
        }
    }

    pub fn sum(self) -> f64 {
        self.semantic + self.interest + self.geo + self.recency
    }

    pub fn validate(self) -> Result<()> {
        for (name, value) in [
            (KEY_SEMANTIC, self.semantic),
            (KEY_INTEREST, self.interest),
            (KEY_GEO, self.geo),
            (KEY_RECENCY, self.recency),
        ] {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(TetherError::validation(
                    "weights",
                    format!("{} must be within [0, 1], got {}", name, value),
                ));
            }
        }
        if (self.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(TetherError::validation(
                "weights",
                format!("components must sum to 1, got {:.4}", self.sum()),
            ));
        }
        Ok(())
    }
}

/// Partial update: absent fields keep their current value.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct WeightPatch {
    pub semantic: Option<f64>,
    pub interest: Option<f64>,
    pub geo: Option<f64>,
    pub recency: Option<f64>,
}

/// External persistence for the weight map. Missing keys fall back to
/// defaults at load time.
#[async_trait]
pub trait WeightStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, f64>>;
    async fn store(&self, weights: &HashMap<String, f64>) -> Result<()>;
}

pub struct SqliteWeightStore {
    conn: Mutex<Connection>,
}

impl SqliteWeightStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("open weight store: {}", e)))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("init weight store: {}", e)))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ranking_weights (
                key TEXT PRIMARY KEY,
                value REAL NOT NULL
            )",
        )
        .map_err(|e| TetherError::Internal(anyhow::anyhow!("init weight store: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl WeightStore for SqliteWeightStore {
    async fn load(&self) -> Result<HashMap<String, f64>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare("SELECT key, value FROM ranking_weights")
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("load weights: {}", e)))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("load weights: {}", e)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (key, value) =
                row.map_err(|e| TetherError::Internal(anyhow::anyhow!("load weights: {}", e)))?;
            map.insert(key, value);
        }
        Ok(map)
    }

    async fn store(&self, weights: &HashMap<String, f64>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction()
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("store weights: {}", e)))?;
        for (key, value) in weights {
            tx.execute(
                "INSERT INTO ranking_weights (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, value],
            )
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("store weights: {}", e)))?;
        }
        tx.commit()
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("store weights: {}", e)))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryWeightStore {
    map: Mutex<HashMap<String, f64>>,
}

#[async_trait]
impl WeightStore for InMemoryWeightStore {
    async fn load(&self) -> Result<HashMap<String, f64>> {
        Ok(self.map.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn store(&self, weights: &HashMap<String, f64>) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in weights {
            map.insert(key.clone(), *value);
        }
        Ok(())
    }
}

/// Read-through cache over a [`WeightStore`]. Updates validate the
/// post-patch sum, persist, then swap the cached snapshot so readers see
/// the new weights immediately.
pub struct WeightManager {
    store: Arc<dyn WeightStore>,
    cache: ArcSwapOption<RankingWeights>,
}

impl WeightManager {
    pub fn new(store: Arc<dyn WeightStore>) -> Self {
        Self {
            store,
            cache: ArcSwapOption::const_empty(),
        }
    }

    pub async fn current(&self) -> Result<RankingWeights> {
        if let Some(cached) = self.cache.load_full() {
            return Ok(*cached);
        }
        let weights = RankingWeights::from_map(&self.store.load().await?);
        self.cache.store(Some(Arc::new(weights)));
        Ok(weights)
    }

    pub async fn update(&self, patch: WeightPatch) -> Result<RankingWeights> {
        let next = self.current().await?.apply(&patch);
        next.validate()?;
        self.store.store(&next.to_map()).await?;
        self.cache.store(Some(Arc::new(next)));
        info!(
            "ranking weights updated: semantic={} interest={} geo={} recency={}",
            next.semantic, next.interest, next.geo, next.recency
        );
        Ok(next)
    }

    pub async fn reset(&self) -> Result<RankingWeights> {
        let defaults = RankingWeights::default();
        self.store.store(&defaults.to_map()).await?;
        self.cache.store(Some(Arc::new(defaults)));
        info!("ranking weights reset to defaults");
        Ok(defaults)
    }
}
