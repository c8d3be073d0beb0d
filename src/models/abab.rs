use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

fn default_outcome_metric() -> String {
    "sessionPerformanceScore".to_string()
}

fn default_n_permutations() -> u32 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AbabAnalyzeRequest {
    #[validate(length(min = 1, message = "userId must not be empty"))]
    pub user_id: String,
    pub protocol_id: String,
    #[serde(default = "default_outcome_metric")]
    pub outcome_metric: String,
    #[serde(default = "default_n_permutations")]
    #[validate(range(min = 1000, max = 50000, message = "nPermutations must be in [1000, 50000]"))]
    pub n_permutations: u32,
    pub seed: Option<u64>,
}

pub static OUTCOME_METRIC_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WwcDetails {
    pub phase_pairs: u32,
    pub criterion_phase_pairs: bool,
    pub min_observations_per_phase: usize,
    pub criterion_sufficient_data: bool,
    pub immediate_change_detected: bool,
    pub criterion_immediate_change: bool,
    pub similar_baseline_phases: bool,
    pub similar_intervention_phases: bool,
    pub criterion_similar_patterns: bool,
    pub overlap_percentage: f64,
    pub criterion_minimal_overlap: bool,
    pub p_value: f64,
    pub criterion_statistically_significant: bool,
    pub cohens_d: f64,
    pub effect_size_interpretation: String,
    pub wwc_rating: String,
    pub passes_wwc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbabAnalyzeResponse {
    pub observed_effect: f64,
    pub p_value: f64,
    pub cohens_d: f64,
    pub permutation_distribution: Vec<f64>,
    pub n_observations_per_phase: HashMap<String, usize>,
    pub passes_sced_standards: bool,
    pub wwc_details: WwcDetails,
    pub mlflow_run_id: Option<String>,
    pub computation_time_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbabHistoryEntry {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub protocol_id: Option<String>,
    pub observed_effect: Option<f64>,
    pub p_value: Option<f64>,
    pub cohens_d: Option<f64>,
    pub wwc_rating: Option<String>,
    pub passes_wwc: Option<bool>,
    pub computation_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbabHistoryResponse {
    pub user_id: String,
    pub total_runs: usize,
    pub limit: u32,
    pub offset: u32,
    pub runs: Vec<AbabHistoryEntry>,
}
