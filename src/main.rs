use axum::routing::{get, post};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use causal_engine::config::Config;
use causal_engine::services::{
    AbabRandomizationEngine, AnalyticsStoreIngestor, BayesianItsEngine, EventValidator, ResponseCache, RunRegistry,
};
use causal_engine::{handlers, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("causal-engine.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("causal engine starting up");

    for url in [&config.database.analytics_url, &config.database.registry_url] {
        if let Some(db_path) = url.strip_prefix("sqlite://") {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let analytics_pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&format!("{}?mode=rwc", config.database.analytics_url))
        .await?;
    let registry_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&format!("{}?mode=rwc", config.database.registry_url))
        .await?;
    tracing::info!("database pools created");

    let validator = Arc::new(EventValidator::new());
    let ingestor = Arc::new(AnalyticsStoreIngestor::new(analytics_pool.clone(), config.database.parquet_dir.clone().into()));
    ingestor.ensure_schema().await?;

    let run_registry = Arc::new(RunRegistry::new(registry_pool.clone()));
    run_registry.ensure_schema().await?;

    let cache = Arc::new(ResponseCache::new(config.cache.default_ttl_secs));

    let its_engine = Arc::new(BayesianItsEngine::new(
        Arc::clone(&ingestor),
        Arc::clone(&run_registry),
        Arc::clone(&cache),
        config.mcmc.timeout_secs,
        config.plots.width,
        config.plots.height,
    ));
    let abab_engine = Arc::new(AbabRandomizationEngine::new(
        Arc::clone(&ingestor),
        Arc::clone(&run_registry),
        Arc::clone(&cache),
        config.abab.timeout_base_secs,
        config.abab.timeout_max_secs,
    ));

    let app_state = Arc::new(AppState {
        analytics_pool,
        registry_pool,
        validator,
        ingestor,
        run_registry,
        cache,
        its_engine,
        abab_engine,
    });

    let analysis_routes = Router::new()
        .route("/analytics/its/analyze", post(handlers::its::analyze))
        .route("/analytics/its/history/:user_id", get(handlers::its::history))
        .route("/analytics/abab/analyze", post(handlers::abab::analyze))
        .route("/analytics/abab/history/:user_id", get(handlers::abab::history))
        .with_state(Arc::clone(&app_state));

    let health_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .with_state(Arc::clone(&app_state));

    let cors = tower_http::cors::CorsLayer::new().allow_origin(
        config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect::<Vec<_>>(),
    );

    let app = Router::new()
        .merge(analysis_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
