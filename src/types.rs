use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PulseError;

/// A tracked subject whose engagement score is recomputed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub score: f64,
    pub last_processed: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            score: 0.0,
            last_processed: None,
        }
    }
}

/// Engagement type. Unrecognised values deserialize to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementType {
    Like,
    Retweet,
    Reply,
    #[serde(other)]
    Other,
}

impl EngagementType {
    /// Row in the score tensor. Unknown types share the `like` row.
    pub fn row(self) -> usize {
        match self {
            EngagementType::Like | EngagementType::Other => 0,
            EngagementType::Retweet => 1,
            EngagementType::Reply => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngagementType::Like => "like",
            EngagementType::Retweet => "retweet",
            EngagementType::Reply => "reply",
            EngagementType::Other => "other",
        }
    }
}

impl std::fmt::Display for EngagementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngagementType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "like" => EngagementType::Like,
            "retweet" => EngagementType::Retweet,
            "reply" => EngagementType::Reply,
            _ => EngagementType::Other,
        })
    }
}

/// A single timestamped interaction. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementEvent {
    pub id: String,
    pub entity_id: String,
    pub engagement_type: EngagementType,
    /// In [-1.0, 1.0] when present
    pub sentiment: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl EngagementEvent {
    pub fn new(
        entity_id: impl Into<String>,
        engagement_type: EngagementType,
        sentiment: Option<f64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            engagement_type,
            sentiment,
            created_at,
        }
    }
}

/// Messages carried on a push channel, in either direction.
///
/// Parsing is strict: unknown `type` tags and unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PushMessage {
    ScoreUpdate {
        entity_id: String,
        score: f64,
        timestamp: DateTime<Utc>,
    },
    Ping,
    Pong,
}

impl PushMessage {
    pub fn score_update(entity_id: &str, score: f64, timestamp: DateTime<Utc>) -> Self {
        PushMessage::ScoreUpdate {
            entity_id: entity_id.to_string(),
            score,
            timestamp,
        }
    }

    /// Parse an inbound frame, rejecting anything that is not a known message kind
    pub fn parse(text: &str) -> Result<Self, PulseError> {
        serde_json::from_str(text)
            .map_err(|e| PulseError::PermanentDownstream(format!("Malformed push message: {}", e)))
    }

    pub fn to_json(&self) -> Result<serde_json::Value, PulseError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobId {
    ScoreRefresh,
    RetentionCleanup,
    AggregateSummary,
}

impl JobId {
    pub const ALL: [JobId; 3] = [
        JobId::ScoreRefresh,
        JobId::RetentionCleanup,
        JobId::AggregateSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobId::ScoreRefresh => "score_refresh",
            JobId::RetentionCleanup => "retention_cleanup",
            JobId::AggregateSummary => "aggregate_summary",
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "score_refresh" | "scorerefresh" => Ok(JobId::ScoreRefresh),
            "retention_cleanup" | "retentioncleanup" => Ok(JobId::RetentionCleanup),
            "aggregate_summary" | "aggregatesummary" => Ok(JobId::AggregateSummary),
            _ => Err(format!("Unknown job: {}", s)),
        }
    }
}

/// Why a job run started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Scheduled,
    Missed,
    Manual,
}

/// Outcome of one job run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job: JobId,
    pub trigger: JobTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }
}
