use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MissionStarted,
    MissionCompleted,
    CardReviewed,
    ValidationCompleted,
    SessionStarted,
    SessionEnded,
    LectureUploaded,
    SearchPerformed,
    GraphViewed,
    RecommendationViewed,
    RecommendationClicked,
    RecommendationDismissed,
    RecommendationRated,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::MissionStarted,
        EventType::MissionCompleted,
        EventType::CardReviewed,
        EventType::ValidationCompleted,
        EventType::SessionStarted,
        EventType::SessionEnded,
        EventType::LectureUploaded,
        EventType::SearchPerformed,
        EventType::GraphViewed,
        EventType::RecommendationViewed,
        EventType::RecommendationClicked,
        EventType::RecommendationDismissed,
        EventType::RecommendationRated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MissionStarted => "MISSION_STARTED",
            EventType::MissionCompleted => "MISSION_COMPLETED",
            EventType::CardReviewed => "CARD_REVIEWED",
            EventType::ValidationCompleted => "VALIDATION_COMPLETED",
            EventType::SessionStarted => "SESSION_STARTED",
            EventType::SessionEnded => "SESSION_ENDED",
            EventType::LectureUploaded => "LECTURE_UPLOADED",
            EventType::SearchPerformed => "SEARCH_PERFORMED",
            EventType::GraphViewed => "GRAPH_VIEWED",
            EventType::RecommendationViewed => "RECOMMENDATION_VIEWED",
            EventType::RecommendationClicked => "RECOMMENDATION_CLICKED",
            EventType::RecommendationDismissed => "RECOMMENDATION_DISMISSED",
            EventType::RecommendationRated => "RECOMMENDATION_RATED",
        }
    }

    pub fn values() -> Vec<&'static str> {
        Self::ALL.iter().map(Self::as_str).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionQuality {
    Rushed,
    Normal,
    Thorough,
}

impl CompletionQuality {
    pub fn values() -> Vec<&'static str> {
        vec!["RUSHED", "NORMAL", "THOROUGH"]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementLevel {
    Low,
    Medium,
    High,
}

impl EngagementLevel {
    pub fn values() -> Vec<&'static str> {
        vec!["LOW", "MEDIUM", "HIGH"]
    }
}

/// The four canonical ABAB phase labels, in reversal-design order.
pub const EXPERIMENT_PHASES: [&str; 4] =
    ["baseline_1", "intervention_A_1", "baseline_2", "intervention_A_2"];

/// One observation for one learner at one moment.
///
/// Mirrors the upstream transactional schema this crate never writes to
/// directly; fields beyond what the analysis engines touch are still carried
/// so validation and ingestion can reason about the full row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BehavioralEvent {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub event_data: String,
    pub timestamp: DateTime<Utc>,
    pub session_performance_score: Option<i32>,
    pub completion_quality: Option<String>,
    pub engagement_level: Option<String>,
    pub day_of_week: Option<i32>,
    pub time_of_day: Option<i32>,
    pub experiment_phase: Option<String>,
    pub randomization_seed: Option<i64>,
    pub context_metadata_id: Option<String>,
}

impl BehavioralEvent {
    /// Reads a named outcome column as a float, where that column is one of
    /// the numeric fields carried on the row (currently only
    /// `sessionPerformanceScore` is supported as an outcome metric, matching
    /// the source schema's numeric columns).
    pub fn outcome(&self, metric: &str) -> Option<f64> {
        match metric {
            "sessionPerformanceScore" => self.session_performance_score.map(f64::from),
            _ => None,
        }
    }
}

/// A loosely-typed pre-validation row: every column is optional/stringly
/// typed so type-coercion failures are themselves reportable violations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEventRecord {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub event_data: Option<serde_json::Value>,
    pub timestamp: Option<String>,
    pub session_performance_score: Option<serde_json::Value>,
    pub completion_quality: Option<String>,
    pub engagement_level: Option<String>,
    pub day_of_week: Option<serde_json::Value>,
    pub time_of_day: Option<serde_json::Value>,
    pub experiment_phase: Option<String>,
    pub randomization_seed: Option<serde_json::Value>,
    pub context_metadata_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}
