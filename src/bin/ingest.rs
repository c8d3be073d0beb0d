//! Offline ingestion CLI (spec §6.2): validates a batch of raw behavioral-
//! event records, windows it by `--days`/`--user-id`, and materializes the
//! result through `AnalyticsStoreIngestor` (Parquet artifact always,
//! SQLite mirror + indexes only when `--sync` is passed).

use causal_engine::config::Config;
use causal_engine::models::event::{BehavioralEvent, RawEventRecord};
use causal_engine::services::{AnalyticsStoreIngestor, EventValidator};
use chrono::{Duration, Utc};
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Validate and ingest a batch of behavioral events")]
struct Args {
    /// Path to a JSON file containing an array of raw event records, as
    /// handed off by the upstream operational store
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    /// Path to a configuration file (same format as the server's)
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Only ingest events from the last N days
    #[arg(long, value_name = "N")]
    days: Option<i64>,

    /// Only ingest events belonging to this user
    #[arg(long, value_name = "ID")]
    user_id: Option<String>,

    /// Skip C1 schema validation entirely
    #[arg(long)]
    no_validate: bool,

    /// Use C1's report mode (accumulate every violation) instead of
    /// short-circuiting on the first invalid row
    #[arg(long)]
    non_strict: bool,

    /// Also upsert the batch into the SQLite mirror and (re)build its
    /// indexes; without this flag only the Parquet artifact is written
    #[arg(long)]
    sync: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new("info")).init();

    match run().await {
        Ok(summary) => {
            tracing::info!(
                total_events = summary.total_events,
                unique_users = summary.unique_users,
                "ingestion complete"
            );
            println!("{}", serde_json::to_string_pretty(&summary).unwrap());
            ExitCode::SUCCESS
        },
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("ingest failed: {e}");
            ExitCode::FAILURE
        },
    }
}

async fn run() -> anyhow::Result<causal_engine::services::ingestor::IngestSummary> {
    let args = Args::parse();

    let config: Config = if let Some(path) = &args.config {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)?
    } else {
        Config::default()
    };

    let raw = std::fs::read_to_string(&args.input)?;
    let records: Vec<RawEventRecord> = serde_json::from_str(&raw)?;
    tracing::info!(count = records.len(), path = %args.input.display(), "loaded raw records");

    let records = filter_records(records, args.days, args.user_id.as_deref());
    tracing::info!(count = records.len(), days = ?args.days, user_id = ?args.user_id, "windowed records");

    let events = if args.no_validate {
        coerce_without_validation(records)?
    } else if args.non_strict {
        let validator = EventValidator::new();
        let (events, report) = validator.validate_with_report(&records);
        if report.invalid_rows > 0 {
            for violation in &report.errors {
                tracing::warn!(
                    row = violation.index,
                    column = %violation.column,
                    check = %violation.check,
                    "validation violation: {}",
                    violation.failure_case
                );
            }
        }
        tracing::info!(
            total = report.total_rows,
            valid = report.valid_rows,
            invalid = report.invalid_rows,
            "validation report"
        );
        events
    } else {
        let validator = EventValidator::new();
        validator.validate_strict(&records)?
    };

    std::fs::create_dir_all(&config.database.parquet_dir)?;
    if let Some(db_path) = config.database.analytics_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&format!("{}?mode=rwc", config.database.analytics_url))
        .await?;

    let ingestor = AnalyticsStoreIngestor::new(pool, config.database.parquet_dir.clone());
    let summary = ingestor.ingest(&events, args.sync).await?;
    Ok(summary)
}

/// Applies the `--days`/`--user-id` window before validation runs, matching
/// spec §6.2's "window"/"filter" semantics.
fn filter_records(records: Vec<RawEventRecord>, days: Option<i64>, user_id: Option<&str>) -> Vec<RawEventRecord> {
    let cutoff = days.map(|d| Utc::now() - Duration::days(d));

    records
        .into_iter()
        .filter(|r| match user_id {
            Some(id) => r.user_id.as_deref() == Some(id),
            None => true,
        })
        .filter(|r| match (cutoff, &r.timestamp) {
            (Some(cutoff), Some(ts)) => chrono::DateTime::parse_from_rfc3339(ts)
                .map(|parsed| parsed.with_timezone(&Utc) >= cutoff)
                .unwrap_or(true),
            (Some(_), None) => false,
            (None, _) => true,
        })
        .collect()
}

/// `--no-validate` still needs well-typed rows to write Parquet/SQLite;
/// this performs the same type coercion C1 does without any of its checks.
fn coerce_without_validation(records: Vec<RawEventRecord>) -> anyhow::Result<Vec<BehavioralEvent>> {
    let validator = EventValidator::new();
    let (events, _report) = validator.validate_with_report(&records);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: &str, ts: &str) -> RawEventRecord {
        RawEventRecord {
            id: Some("c000000000000000000000001".to_string()),
            user_id: Some(user_id.to_string()),
            event_type: Some("SESSION_STARTED".to_string()),
            event_data: None,
            timestamp: Some(ts.to_string()),
            session_performance_score: None,
            completion_quality: None,
            engagement_level: None,
            day_of_week: None,
            time_of_day: None,
            experiment_phase: None,
            randomization_seed: None,
            context_metadata_id: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn filter_records_applies_user_id_filter() {
        let records = vec![record("u1", "2026-07-01T00:00:00Z"), record("u2", "2026-07-01T00:00:00Z")];
        let filtered = filter_records(records, None, Some("u1"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn filter_records_drops_rows_older_than_the_day_window() {
        let old = (Utc::now() - Duration::days(90)).to_rfc3339();
        let recent = Utc::now().to_rfc3339();
        let records = vec![record("u1", &old), record("u1", &recent)];
        let filtered = filter_records(records, Some(7), None);
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn filter_records_is_a_no_op_with_no_flags() {
        let records = vec![record("u1", "2026-07-01T00:00:00Z"), record("u2", "2026-01-01T00:00:00Z")];
        let filtered = filter_records(records, None, None);
        assert_eq!(filtered.len(), 2);
    }
}
