//! n=1 Causal Analytics Engine
//!
//! Bayesian Interrupted Time Series and ABAB randomization-test analysis
//! over an individual learner's behavioral event stream.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::{AbabRandomizationEngine, AnalyticsStoreIngestor, BayesianItsEngine, EventValidator, ResponseCache, RunRegistry};

/// Shared application state. Every service is wrapped in `Arc` so handlers
/// can cheaply clone what they need out of the extracted state.
#[derive(Clone)]
pub struct AppState {
    pub analytics_pool: SqlitePool,
    pub registry_pool: SqlitePool,

    pub validator: Arc<EventValidator>,
    pub ingestor: Arc<AnalyticsStoreIngestor>,
    pub run_registry: Arc<RunRegistry>,
    pub cache: Arc<ResponseCache>,
    pub its_engine: Arc<BayesianItsEngine>,
    pub abab_engine: Arc<AbabRandomizationEngine>,
}
