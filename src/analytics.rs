//! Cross-entity aggregates written through the cache.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::MAX_SCORE;
use crate::types::{EngagementType, Entity};

pub const SUMMARY_CACHE_KEY: &str = "analytics_summary";

const SCORE_BANDS: usize = 10;

/// Score distribution and engagement mix across all entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub entity_count: usize,
    pub mean_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    /// Entities per 10-point score band, `[0,10)` .. `[90,100]`
    pub score_histogram: Vec<u64>,
    pub engagement_counts: BTreeMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreTrendPoint {
    pub entity_id: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Scores refreshed in the last `days` days plus the engagement distribution over that window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseData {
    pub days: i64,
    pub score_trends: Vec<ScoreTrendPoint>,
    pub engagement_distribution: BTreeMap<String, u64>,
    pub generated_at: DateTime<Utc>,
}

pub fn enterprise_cache_key(days: i64) -> String {
    format!("enterprise_data_{}", days)
}

pub fn summarize(
    entities: &[Entity],
    counts: &HashMap<EngagementType, u64>,
    now: DateTime<Utc>,
) -> AnalyticsSummary {
    let mut histogram = vec![0u64; SCORE_BANDS];
    let mut total = 0.0;
    let mut min_score = f64::INFINITY;
    let mut max_score = f64::NEG_INFINITY;

    for entity in entities {
        let score = entity.score.clamp(0.0, MAX_SCORE);
        histogram[score_band(score)] += 1;
        total += score;
        min_score = min_score.min(score);
        max_score = max_score.max(score);
    }

    let entity_count = entities.len();
    let (mean_score, min_score, max_score) = if entity_count == 0 {
        (0.0, 0.0, 0.0)
    } else {
        (total / entity_count as f64, min_score, max_score)
    };

    AnalyticsSummary {
        entity_count,
        mean_score,
        min_score,
        max_score,
        score_histogram: histogram,
        engagement_counts: named_counts(counts),
        updated_at: now,
    }
}

pub fn enterprise_view(
    entities: &[Entity],
    counts: &HashMap<EngagementType, u64>,
    days: i64,
    now: DateTime<Utc>,
) -> EnterpriseData {
    let cutoff = window_start(now, days);
    let mut score_trends: Vec<ScoreTrendPoint> = entities
        .iter()
        .filter_map(|entity| {
            let processed = entity.last_processed?;
            (processed >= cutoff).then(|| ScoreTrendPoint {
                entity_id: entity.id.clone(),
                score: entity.score,
                timestamp: processed,
            })
        })
        .collect();
    score_trends.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.entity_id.cmp(&b.entity_id)));

    EnterpriseData {
        days,
        score_trends,
        engagement_distribution: named_counts(counts),
        generated_at: now,
    }
}

/// `now - days`, saturating at the earliest representable time
pub fn window_start(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn score_band(score: f64) -> usize {
    ((score / 10.0) as usize).min(SCORE_BANDS - 1)
}

fn named_counts(counts: &HashMap<EngagementType, u64>) -> BTreeMap<String, u64> {
    counts
        .iter()
        .map(|(ty, n)| (ty.as_str().to_string(), *n))
        .collect()
}
