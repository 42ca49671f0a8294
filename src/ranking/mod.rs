//! Discovery ranking: a weighted composite over semantic similarity,
//! interest overlap, proximity, and recency.

mod score;
mod weights;

pub use score::{GeoPoint, PROXIMITY_CAP_KM, geo_score, haversine_km, jaccard, recency_score};
pub use weights::{
    InMemoryWeightStore, RankingWeights, SqliteWeightStore, WEIGHT_SUM_TOLERANCE, WeightManager,
    WeightPatch, WeightStore,
};

use chrono::{DateTime, Utc};

use crate::chat::UserId;
use crate::errors::Result;

/// One discovery candidate as seen by the scorer. `semantic_sim` is
/// pre-clamped to [0,1] by the caller.
#[derive(Debug, Clone)]
pub struct RankingInput {
    pub user: UserId,
    pub semantic_sim: f64,
    pub interest_bits: Vec<u8>,
    pub location: Option<GeoPoint>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// The requester's side of the comparison.
#[derive(Debug, Clone)]
pub struct RankingContext {
    pub user: UserId,
    pub interest_bits: Vec<u8>,
    pub location: Option<GeoPoint>,
}

/// Composite score with its per-component breakdown.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RankedCandidate {
    pub user: UserId,
    pub score: f64,
    pub semantic: f64,
    pub interest: f64,
    pub geo: f64,
    pub recency: f64,
    /// Whole minutes since the candidate was last seen; `-1` when unknown.
    pub minutes_since_seen: i64,
}

pub struct RankingEngine {
    weights: std::sync::Arc<WeightManager>,
}

impl RankingEngine {
    pub fn new(weights: std::sync::Arc<WeightManager>) -> Self {
        Self { weights }
    }

    /// Score a batch of candidates against one requester. Weights are
    /// read once for the whole batch; the output vector is the only
    /// allocation.
    pub async fn rank(
        &self,
        ctx: &RankingContext,
        candidates: &[RankingInput],
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedCandidate>> {
        let weights = self.weights.current().await?;
        let mut ranked = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            ranked.push(score_one(&weights, ctx, candidate, now));
        }
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }
}

fn score_one(
    weights: &RankingWeights,
    ctx: &RankingContext,
    candidate: &RankingInput,
    now: DateTime<Utc>,
) -> RankedCandidate {
    let semantic = candidate.semantic_sim;
    let interest = jaccard(&candidate.interest_bits, &ctx.interest_bits);
    let geo = geo_score(candidate.location, ctx.location);
    let (recency, minutes) = recency_score(candidate.last_seen, now);

    let score = weights.semantic * semantic
        + weights.interest * interest
        + weights.geo * geo
        + weights.recency * recency;

    RankedCandidate {
        user: candidate.user,
        score,
        semantic,
        interest,
        geo,
        recency,
        minutes_since_seen: minutes,
    }
}
