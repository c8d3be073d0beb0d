use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

fn default_outcome_metric() -> String {
    "sessionPerformanceScore".to_string()
}

fn default_mcmc_samples() -> usize {
    2000
}

fn default_mcmc_chains() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ItsAnalyzeRequest {
    #[validate(length(min = 1, message = "userId must not be empty"))]
    pub user_id: String,
    pub intervention_date: DateTime<Utc>,
    #[serde(default = "default_outcome_metric")]
    pub outcome_metric: String,
    #[serde(default)]
    pub include_day_of_week: bool,
    #[serde(default)]
    pub include_time_of_day: bool,
    #[serde(default = "default_mcmc_samples")]
    #[validate(range(min = 500, max = 10000, message = "mcmcSamples must be in [500, 10000]"))]
    pub mcmc_samples: usize,
    #[serde(default = "default_mcmc_chains")]
    #[validate(range(min = 2, max = 8, message = "mcmcChains must be in [2, 8]"))]
    pub mcmc_chains: usize,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectSummary {
    pub point_estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub probability_positive: f64,
    pub probability_negative: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McmcDiagnostics {
    pub r_hat: HashMap<String, f64>,
    pub effective_sample_size: HashMap<String, f64>,
    pub divergent_transitions: u32,
    pub max_tree_depth: u32,
    pub converged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItsPlots {
    pub observed_vs_counterfactual: String,
    pub posterior_predictive_check: String,
    pub effect_distribution: String,
    pub mcmc_diagnostics: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItsAnalyzeResponse {
    pub immediate_effect: EffectSummary,
    pub sustained_effect: EffectSummary,
    pub counterfactual_effect: EffectSummary,
    pub probability_of_benefit: f64,
    pub mcmc_diagnostics: McmcDiagnostics,
    pub plots: ItsPlots,
    pub mlflow_run_id: Option<String>,
    pub computation_time_seconds: f64,
    pub n_observations_pre: usize,
    pub n_observations_post: usize,
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
pub struct ItsHistoryEntry {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub intervention_date: Option<DateTime<Utc>>,
    pub immediate_effect: Option<f64>,
    pub sustained_effect: Option<f64>,
    pub counterfactual_effect: Option<f64>,
    pub probability_of_benefit: Option<f64>,
    pub max_rhat: Option<f64>,
    pub converged: Option<bool>,
    pub computation_time: Option<f64>,
    pub n_observations_pre: Option<i64>,
    pub n_observations_post: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItsHistoryResponse {
    pub user_id: String,
    pub total_runs: usize,
    pub limit: u32,
    pub offset: u32,
    pub runs: Vec<ItsHistoryEntry>,
}
