//! Engagement scoring.
//!
//! Events are binned into a 3×10 tensor (engagement type × 3-day bucket),
//! decayed per bucket, weighted per type and scaled into [0, 100].
//! The reference time is always passed in, never read from the wall clock.

use chrono::{DateTime, Utc};

use crate::types::EngagementEvent;

pub const TYPE_ROWS: usize = 3;
pub const TIME_BUCKETS: usize = 10;

/// Width of one time bucket in days
const BUCKET_DAYS: i64 = 3;

/// Per-bucket exponential decay rate
const DECAY_RATE: f64 = 0.2;

/// like, retweet, reply
const TYPE_WEIGHTS: [f64; TYPE_ROWS] = [0.5, 0.8, 1.0];

const SCORE_SCALE: f64 = 10.0;
pub const MAX_SCORE: f64 = 100.0;

/// Type × time-bucket accumulator, rebuilt for every scoring run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreTensor {
    cells: [[f64; TIME_BUCKETS]; TYPE_ROWS],
}

impl ScoreTensor {
    pub fn from_events(events: &[EngagementEvent], now: DateTime<Utc>) -> Self {
        let mut tensor = Self::default();
        for event in events {
            let row = event.engagement_type.row();
            let bucket = time_bucket(now, event.created_at);
            // f64::max ignores NaN, so a NaN sentiment contributes nothing
            let sentiment = event.sentiment.unwrap_or(0.0).max(0.0);
            tensor.cells[row][bucket] += 1.0 + sentiment;
        }
        tensor
    }

    pub fn get(&self, row: usize, bucket: usize) -> f64 {
        self.cells[row][bucket]
    }

    /// Decay-weighted sum across buckets, one value per type row
    pub fn decayed_rows(&self) -> [f64; TYPE_ROWS] {
        let weights = decay_weights();
        let mut rows = [0.0; TYPE_ROWS];
        for (row, cells) in self.cells.iter().enumerate() {
            rows[row] = cells.iter().zip(weights.iter()).map(|(c, w)| c * w).sum();
        }
        rows
    }

    /// Type-weighted total before scaling
    pub fn raw_score(&self) -> f64 {
        self.decayed_rows()
            .iter()
            .zip(TYPE_WEIGHTS.iter())
            .map(|(v, w)| v * w)
            .sum()
    }
}

/// Bucket index for an event of the given age, always in `0..TIME_BUCKETS`.
///
/// Age is counted in whole days; events dated in the future land in bucket 0.
pub fn time_bucket(now: DateTime<Utc>, created_at: DateTime<Utc>) -> usize {
    let age_days = (now - created_at).num_days().max(0);
    ((age_days / BUCKET_DAYS) as usize).min(TIME_BUCKETS - 1)
}

fn decay_weights() -> [f64; TIME_BUCKETS] {
    let mut weights = [0.0; TIME_BUCKETS];
    for (bucket, w) in weights.iter_mut().enumerate() {
        *w = (-DECAY_RATE * bucket as f64).exp();
    }
    weights
}

/// Compute an entity's score in [0, 100] from its history as of `now`
pub fn compute_score(entity_id: &str, events: &[EngagementEvent], now: DateTime<Utc>) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    let tensor = ScoreTensor::from_events(events, now);
    let score = clamp_score(tensor.raw_score() * SCORE_SCALE);
    log::debug!(
        "Scoring: {} events for {} -> {:.2}",
        events.len(),
        entity_id,
        score
    );
    score
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, MAX_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngagementType;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event(ty: EngagementType, age: Duration, sentiment: Option<f64>) -> EngagementEvent {
        EngagementEvent::new("u1", ty, sentiment, now() - age)
    }

    /// Deterministic pseudo-random history generator for property checks
    fn histories(count: usize) -> Vec<Vec<EngagementEvent>> {
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seed >> 33
        };
        let types = [
            EngagementType::Like,
            EngagementType::Retweet,
            EngagementType::Reply,
            EngagementType::Other,
        ];
        (0..count)
            .map(|_| {
                let len = (next() % 120) as usize;
                (0..len)
                    .map(|_| {
                        let ty = types[(next() % 4) as usize];
                        let age = Duration::hours((next() % (24 * 45)) as i64 - 24);
                        let sentiment = match next() % 3 {
                            0 => None,
                            _ => Some((next() % 2001) as f64 / 1000.0 - 1.0),
                        };
                        event(ty, age, sentiment)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_zero_events_scores_zero() {
        assert_eq!(compute_score("u1", &[], now()), 0.0);
    }

    #[test]
    fn test_three_recent_likes_score_22_5() {
        let events = vec![
            event(EngagementType::Like, Duration::days(0), Some(0.5)),
            event(EngagementType::Like, Duration::days(1), Some(0.5)),
            event(EngagementType::Like, Duration::days(2), Some(0.5)),
        ];
        let tensor = ScoreTensor::from_events(&events, now());
        assert!((tensor.get(0, 0) - 4.5).abs() < 1e-9);
        assert!((tensor.raw_score() - 2.25).abs() < 1e-9);
        assert!((compute_score("u1", &events, now()) - 22.5).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_boundaries() {
        let n = now();
        assert_eq!(time_bucket(n, n), 0);
        assert_eq!(time_bucket(n, n - Duration::days(2)), 0);
        assert_eq!(time_bucket(n, n - Duration::days(3)), 1);
        assert_eq!(time_bucket(n, n - Duration::days(29)), 9);
        assert_eq!(time_bucket(n, n - Duration::days(400)), 9);
        assert_eq!(time_bucket(n, n + Duration::days(5)), 0);
    }

    #[test]
    fn test_negative_and_missing_sentiment_contribute_base_only() {
        let events = vec![
            event(EngagementType::Reply, Duration::hours(1), Some(-0.9)),
            event(EngagementType::Reply, Duration::hours(2), None),
        ];
        let tensor = ScoreTensor::from_events(&events, now());
        assert!((tensor.get(2, 0) - 2.0).abs() < 1e-9);
        // 2.0 * reply weight 1.0 * scale 10
        assert!((compute_score("u1", &events, now()) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_older_events_decay() {
        let fresh = vec![event(EngagementType::Retweet, Duration::days(0), None)];
        let stale = vec![event(EngagementType::Retweet, Duration::days(10), None)];
        let fresh_score = compute_score("u1", &fresh, now());
        let stale_score = compute_score("u1", &stale, now());
        assert!((fresh_score - 8.0).abs() < 1e-9);
        assert!((stale_score - 8.0 * (-0.6f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_score_saturates_at_100() {
        let events: Vec<_> = (0..50)
            .map(|_| event(EngagementType::Reply, Duration::hours(1), Some(1.0)))
            .collect();
        assert_eq!(compute_score("u1", &events, now()), MAX_SCORE);
    }

    #[test]
    fn test_score_always_in_range_and_deterministic() {
        for events in histories(200) {
            let a = compute_score("u1", &events, now());
            let b = compute_score("u1", &events, now());
            assert!((0.0..=MAX_SCORE).contains(&a), "score out of range: {}", a);
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_raising_sentiment_never_lowers_score() {
        for mut events in histories(100) {
            if events.is_empty() {
                continue;
            }
            let before = compute_score("u1", &events, now());
            let idx = events.len() / 2;
            let raised = events[idx].sentiment.unwrap_or(-1.0) + 0.25;
            events[idx].sentiment = Some(raised.min(1.0));
            let after = compute_score("u1", &events, now());
            assert!(after >= before, "{} < {}", after, before);
        }
    }
}
