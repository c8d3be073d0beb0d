use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A record of one completed analysis, persisted by the Run Registry (C3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisRun {
    pub run_id: String,
    pub analysis_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[sqlx(json)]
    pub params: serde_json::Value,
    #[sqlx(json)]
    pub metrics: serde_json::Value,
    #[sqlx(json)]
    pub tags: serde_json::Value,
    #[sqlx(json)]
    pub artifacts: serde_json::Value,
}

/// In-flight accumulator for a single run, flushed to the registry on
/// `end_run`. Mirrors the client-side buffering of an experiment-tracking
/// client: nothing is visible in `search` until the run ends.
#[derive(Debug, Clone)]
pub struct RunBuilder {
    pub run_id: String,
    pub analysis_type: String,
    pub start_time: DateTime<Utc>,
    pub params: HashMap<String, serde_json::Value>,
    pub metrics: HashMap<String, serde_json::Value>,
    pub tags: HashMap<String, serde_json::Value>,
    pub artifacts: HashMap<String, serde_json::Value>,
}

impl RunBuilder {
    pub fn new(analysis_type: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            analysis_type: analysis_type.into(),
            start_time: Utc::now(),
            params: HashMap::new(),
            metrics: HashMap::new(),
            tags: HashMap::new(),
            artifacts: HashMap::new(),
        }
    }

    pub fn log_param(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn log_metric(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metrics.insert(key.into(), value.into());
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn log_artifact(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.artifacts.insert(name.into(), value.into());
    }
}
