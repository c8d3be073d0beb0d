//! Run Registry (C3).
//!
//! No experiment-tracking client exists in the available dependency set (no
//! MLflow equivalent), so provenance is recorded in a dedicated SQLite table,
//! exposing the same start/log/end/search contract the source's
//! `_log_to_mlflow` (`original_source/.../services/abab_engine.py`) drives.
//! See DESIGN.md, Open Question 2.

use crate::models::run::{AnalysisRun, RunBuilder};
use crate::utils::EngineError;
use chrono::Utc;
use sqlx::SqlitePool;

pub struct RunRegistry {
    pool: SqlitePool,
}

impl RunRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_runs (
                run_id TEXT PRIMARY KEY,
                analysis_type TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                params TEXT NOT NULL,
                metrics TEXT NOT NULL,
                tags TEXT NOT NULL,
                artifacts TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn start_run(&self, analysis_type: &str) -> RunBuilder {
        RunBuilder::new(analysis_type)
    }

    /// Flushes a completed run to storage. Failures are logged and
    /// propagated; the caller is expected to treat a registry failure after
    /// a successful compute as non-fatal (response omits `mlflow_run_id`).
    pub async fn end_run(&self, run: RunBuilder) -> Result<String, EngineError> {
        self.ensure_schema().await?;
        let run_id = run.run_id.clone();
        sqlx::query(
            r#"
            INSERT INTO analysis_runs (run_id, analysis_type, start_time, end_time, params, metrics, tags, artifacts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.analysis_type)
        .bind(run.start_time.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(serde_json::to_string(&run.params).unwrap_or_default())
        .bind(serde_json::to_string(&run.metrics).unwrap_or_default())
        .bind(serde_json::to_string(&run.tags).unwrap_or_default())
        .bind(serde_json::to_string(&run.artifacts).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    /// Search runs of a given type for a user, most recent first.
    pub async fn search(
        &self,
        analysis_type: &str,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AnalysisRun>, EngineError> {
        self.ensure_schema().await?;
        let rows = sqlx::query_as::<_, AnalysisRun>(
            r#"
            SELECT run_id, analysis_type, start_time, end_time, params, metrics, tags, artifacts
            FROM analysis_runs
            WHERE analysis_type = ? AND json_extract(tags, '$.userId') = ?
            ORDER BY start_time DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(analysis_type)
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self, analysis_type: &str, user_id: &str) -> Result<usize, EngineError> {
        self.ensure_schema().await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM analysis_runs WHERE analysis_type = ? AND json_extract(tags, '$.userId') = ?",
        )
        .bind(analysis_type)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_identical_runs_get_distinct_run_ids() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let registry = RunRegistry::new(pool);

        let mut run_a = registry.start_run("ABAB_randomization");
        run_a.set_tag("userId", "u1");
        let id_a = registry.end_run(run_a).await.unwrap();

        let mut run_b = registry.start_run("ABAB_randomization");
        run_b.set_tag("userId", "u1");
        let id_b = registry.end_run(run_b).await.unwrap();

        assert_ne!(id_a, id_b);
        let runs = registry.search("ABAB_randomization", "u1", 10, 0).await.unwrap();
        assert_eq!(runs.len(), 2);
    }
}
