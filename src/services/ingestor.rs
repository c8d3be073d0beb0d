//! Analytics Store Ingestor (C2).
//!
//! Grounded on `original_source/apps/ml-service/scripts/setup_duckdb_analytics.py`:
//! write-then-alias Parquet artifacts, create-or-replace the mirrored table,
//! conditional indexes with a warning (not fatal) on failure.
//!
//! No DuckDB-equivalent crate exists in the available dependency set, so the
//! "embedded columnar store" is realized as a pair: immutable Parquet
//! artifacts under `parquet_dir` (via `arrow`/`parquet`) plus a SQLite mirror
//! (via `sqlx`, already part of the ambient stack) used for indexed reads by
//! the analysis engines. See DESIGN.md, Open Question 1.

use crate::models::event::BehavioralEvent;
use crate::utils::EngineError;
use arrow::array::{Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestSummary {
    pub total_events: usize,
    pub unique_users: usize,
    pub event_types: Vec<String>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

pub struct AnalyticsStoreIngestor {
    pool: SqlitePool,
    parquet_dir: PathBuf,
}

impl AnalyticsStoreIngestor {
    pub fn new(pool: SqlitePool, parquet_dir: impl Into<PathBuf>) -> Self {
        Self { pool, parquet_dir: parquet_dir.into() }
    }

    pub async fn ensure_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS behavioral_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                session_performance_score INTEGER,
                completion_quality TEXT,
                engagement_level TEXT,
                day_of_week INTEGER,
                time_of_day INTEGER,
                experiment_phase TEXT,
                randomization_seed INTEGER,
                context_metadata_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Materializes a validated batch: writes a timestamped Parquet artifact
    /// and repoints the `latest` alias unconditionally; when `sync` is set,
    /// also upserts the mirrored SQLite table and (re)creates its indexes.
    /// Index-creation failures are logged at `warn` and do not fail the
    /// ingest; the `latest` alias is only advanced once every other step
    /// succeeded.
    pub async fn ingest(&self, events: &[BehavioralEvent], sync: bool) -> Result<IngestSummary, EngineError> {
        self.ensure_schema().await?;

        fs::create_dir_all(&self.parquet_dir)?;
        let artifact_name = format!("behavioral_events_{}.parquet", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let artifact_path = self.parquet_dir.join(&artifact_name);
        self.write_parquet(&artifact_path, events)?;

        if sync {
            self.upsert_sqlite(events).await?;

            if let Err(e) = self.create_indexes().await {
                tracing::warn!("index creation skipped: {}", e);
            }
        }

        let latest_path = self.parquet_dir.join("behavioral_events_latest.parquet");
        let tmp_path = self.parquet_dir.join(format!("{}.tmp", artifact_name));
        fs::copy(&artifact_path, &tmp_path)?;
        fs::rename(&tmp_path, &latest_path)?;

        Ok(self.summarize(events))
    }

    fn write_parquet(&self, path: &Path, events: &[BehavioralEvent]) -> Result<(), EngineError> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, false),
            Field::new("event_type", DataType::Utf8, false),
            Field::new("timestamp", DataType::Utf8, false),
            Field::new("session_performance_score", DataType::Int32, true),
            Field::new("experiment_phase", DataType::Utf8, true),
            Field::new("randomization_seed", DataType::Int64, true),
        ]));

        let mut sorted: Vec<&BehavioralEvent> = events.iter().collect();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let ids = StringArray::from(sorted.iter().map(|e| e.id.as_str()).collect::<Vec<_>>());
        let user_ids = StringArray::from(sorted.iter().map(|e| e.user_id.as_str()).collect::<Vec<_>>());
        let event_types = StringArray::from(sorted.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>());
        let timestamps = StringArray::from(sorted.iter().map(|e| e.timestamp.to_rfc3339()).collect::<Vec<_>>());
        let scores = Int32Array::from(sorted.iter().map(|e| e.session_performance_score).collect::<Vec<_>>());
        let phases =
            StringArray::from(sorted.iter().map(|e| e.experiment_phase.clone()).collect::<Vec<_>>());
        let seeds = Int64Array::from(sorted.iter().map(|e| e.randomization_seed).collect::<Vec<_>>());

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(ids),
                Arc::new(user_ids),
                Arc::new(event_types),
                Arc::new(timestamps),
                Arc::new(scores),
                Arc::new(phases),
                Arc::new(seeds),
            ],
        )?;

        let file = fs::File::create(path)?;
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    async fn upsert_sqlite(&self, events: &[BehavioralEvent]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO behavioral_events
                    (id, user_id, event_type, event_data, timestamp, session_performance_score,
                     completion_quality, engagement_level, day_of_week, time_of_day,
                     experiment_phase, randomization_seed, context_metadata_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    event_type = excluded.event_type,
                    event_data = excluded.event_data,
                    timestamp = excluded.timestamp,
                    session_performance_score = excluded.session_performance_score,
                    completion_quality = excluded.completion_quality,
                    engagement_level = excluded.engagement_level,
                    day_of_week = excluded.day_of_week,
                    time_of_day = excluded.time_of_day,
                    experiment_phase = excluded.experiment_phase,
                    randomization_seed = excluded.randomization_seed,
                    context_metadata_id = excluded.context_metadata_id
                "#,
            )
            .bind(&event.id)
            .bind(&event.user_id)
            .bind(&event.event_type)
            .bind(&event.event_data)
            .bind(event.timestamp.to_rfc3339())
            .bind(event.session_performance_score)
            .bind(&event.completion_quality)
            .bind(&event.engagement_level)
            .bind(event.day_of_week)
            .bind(event.time_of_day)
            .bind(&event.experiment_phase)
            .bind(event.randomization_seed)
            .bind(&event.context_metadata_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_indexes(&self) -> Result<(), EngineError> {
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_user_ts ON behavioral_events(user_id, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON behavioral_events(event_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_phase ON behavioral_events(experiment_phase)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn summarize(&self, events: &[BehavioralEvent]) -> IngestSummary {
        let unique_users: BTreeSet<&str> = events.iter().map(|e| e.user_id.as_str()).collect();
        let event_types: BTreeSet<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        let earliest = events.iter().map(|e| e.timestamp).min();
        let latest = events.iter().map(|e| e.timestamp).max();
        IngestSummary {
            total_events: events.len(),
            unique_users: unique_users.len(),
            event_types: event_types.into_iter().map(String::from).collect(),
            earliest,
            latest,
        }
    }

    /// Reads all rows for a user where `metric` is present, ordered by
    /// timestamp, optionally windowed.
    pub async fn fetch_for_user(
        &self,
        user_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<BehavioralEvent>, EngineError> {
        let mut sql = String::from(
            "SELECT id, user_id, event_type, event_data, timestamp, session_performance_score, \
             completion_quality, engagement_level, day_of_week, time_of_day, experiment_phase, \
             randomization_seed, context_metadata_id FROM behavioral_events WHERE user_id = ?",
        );
        if start.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if end.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut query = sqlx::query_as::<_, BehavioralEvent>(&sql).bind(user_id);
        if let Some(s) = start {
            query = query.bind(s.to_rfc3339());
        }
        if let Some(e) = end {
            query = query.bind(e.to_rfc3339());
        }

        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::BehavioralEvent;

    fn sample_event(id: &str, user: &str, ts: DateTime<Utc>) -> BehavioralEvent {
        BehavioralEvent {
            id: id.to_string(),
            user_id: user.to_string(),
            event_type: "SESSION_STARTED".to_string(),
            event_data: "{}".to_string(),
            timestamp: ts,
            session_performance_score: Some(70),
            completion_quality: None,
            engagement_level: None,
            day_of_week: None,
            time_of_day: None,
            experiment_phase: None,
            randomization_seed: None,
            context_metadata_id: None,
        }
    }

    #[tokio::test]
    async fn ingest_twice_produces_row_set_equal_table() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ingestor = AnalyticsStoreIngestor::new(pool.clone(), dir.path());

        let events = vec![
            sample_event("c000000000000000000000001", "u1", Utc::now()),
            sample_event("c000000000000000000000002", "u1", Utc::now()),
        ];

        ingestor.ingest(&events, true).await.unwrap();
        let first: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM behavioral_events")
            .fetch_one(&pool)
            .await
            .unwrap();

        ingestor.ingest(&events, true).await.unwrap();
        let second: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM behavioral_events")
            .fetch_one(&pool)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, 2);
    }

    #[tokio::test]
    async fn writes_and_aliases_a_parquet_artifact() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ingestor = AnalyticsStoreIngestor::new(pool, dir.path());
        let events = vec![sample_event("c000000000000000000000001", "u1", Utc::now())];
        ingestor.ingest(&events, true).await.unwrap();
        assert!(dir.path().join("behavioral_events_latest.parquet").exists());
    }
}
