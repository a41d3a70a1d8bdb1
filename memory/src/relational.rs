//! Cross-session relational memory store, backed by a `SqlitePool`.
//!
//! This store holds append-only observability data, never read by the
//! flow control path, so there is no optimistic-concurrency or resume
//! logic here — only inserts, "ensure row, then upsert" updates, and
//! aggregate reads.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::errors::MemoryError;

/// One row of `runs`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub final_phase: Option<String>,
}

/// One row of `phase_metrics`.
#[derive(Debug, Clone)]
pub struct PhaseMetric {
    pub run_id: String,
    pub phase: String,
    pub duration_ms: i64,
    pub retries: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub outcome: String,
}

/// One aggregate row of `role_metrics`: keyed by `(role,
/// model_id)`, incremented on every worker invocation.
#[derive(Debug, Clone)]
pub struct RoleMetric {
    pub role: String,
    pub model_id: String,
    pub invocations: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub failures: i64,
}

/// Relational store contract. Disabled-memory runs should
/// prefer [`NullRelationalStore`] over branching on a flag at every call
/// site.
#[async_trait::async_trait]
pub trait RelationalStore: Send + Sync {
    async fn record_run_started(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<(), MemoryError>;

    async fn record_run_ended(
        &self,
        run_id: &str,
        ended_at: DateTime<Utc>,
        final_phase: &str,
    ) -> Result<(), MemoryError>;

    async fn record_phase_metric(&self, metric: PhaseMetric) -> Result<(), MemoryError>;

    async fn record_role_invocation(
        &self,
        role: &str,
        model_id: &str,
        tokens_in: i64,
        tokens_out: i64,
        failed: bool,
    ) -> Result<(), MemoryError>;

    async fn phase_metrics_for_run(&self, run_id: &str) -> Result<Vec<PhaseMetric>, MemoryError>;

    async fn role_metrics(&self) -> Result<Vec<RoleMetric>, MemoryError>;

    async fn list_runs(&self) -> Result<Vec<RunRecord>, MemoryError>;
}

/// SQLite-backed implementation.
pub struct SqliteRelationalStore {
    pool: SqlitePool,
}

impl SqliteRelationalStore {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `"sqlite://crewflow-runs/metrics.db"`. Schema is created inline on
    /// connect rather than via embedded migrations, since this store owns
    /// no other migration history to coordinate with.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, MemoryError> {
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                final_phase TEXT
            )
            ",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS phase_metrics (
                run_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                retries INTEGER NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                outcome TEXT NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS role_metrics (
                role TEXT NOT NULL,
                model_id TEXT NOT NULL,
                invocations INTEGER NOT NULL DEFAULT 0,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (role, model_id)
            )
            ",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl RelationalStore for SqliteRelationalStore {
    #[instrument(skip(self), err)]
    async fn record_run_started(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<(), MemoryError> {
        sqlx::query("INSERT OR REPLACE INTO runs (run_id, started_at, ended_at, final_phase) VALUES (?1, ?2, NULL, NULL)")
            .bind(run_id)
            .bind(started_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn record_run_ended(
        &self,
        run_id: &str,
        ended_at: DateTime<Utc>,
        final_phase: &str,
    ) -> Result<(), MemoryError> {
        sqlx::query("UPDATE runs SET ended_at = ?1, final_phase = ?2 WHERE run_id = ?3")
            .bind(ended_at.to_rfc3339())
            .bind(final_phase)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, metric), err)]
    async fn record_phase_metric(&self, metric: PhaseMetric) -> Result<(), MemoryError> {
        sqlx::query(
            r"
            INSERT INTO phase_metrics (run_id, phase, duration_ms, retries, tokens_in, tokens_out, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(&metric.run_id)
        .bind(&metric.phase)
        .bind(metric.duration_ms)
        .bind(metric.retries)
        .bind(metric.tokens_in)
        .bind(metric.tokens_out)
        .bind(&metric.outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn record_role_invocation(
        &self,
        role: &str,
        model_id: &str,
        tokens_in: i64,
        tokens_out: i64,
        failed: bool,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            r"
            INSERT INTO role_metrics (role, model_id, invocations, tokens_in, tokens_out, failures)
            VALUES (?1, ?2, 1, ?3, ?4, ?5)
            ON CONFLICT(role, model_id) DO UPDATE SET
                invocations = invocations + 1,
                tokens_in = tokens_in + excluded.tokens_in,
                tokens_out = tokens_out + excluded.tokens_out,
                failures = failures + excluded.failures
            ",
        )
        .bind(role)
        .bind(model_id)
        .bind(tokens_in)
        .bind(tokens_out)
        .bind(i64::from(failed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn phase_metrics_for_run(&self, run_id: &str) -> Result<Vec<PhaseMetric>, MemoryError> {
        let rows = sqlx::query(
            "SELECT run_id, phase, duration_ms, retries, tokens_in, tokens_out, outcome FROM phase_metrics WHERE run_id = ?1",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PhaseMetric {
                run_id: row.get("run_id"),
                phase: row.get("phase"),
                duration_ms: row.get("duration_ms"),
                retries: row.get("retries"),
                tokens_in: row.get("tokens_in"),
                tokens_out: row.get("tokens_out"),
                outcome: row.get("outcome"),
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn role_metrics(&self) -> Result<Vec<RoleMetric>, MemoryError> {
        let rows = sqlx::query("SELECT role, model_id, invocations, tokens_in, tokens_out, failures FROM role_metrics")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| RoleMetric {
                role: row.get("role"),
                model_id: row.get("model_id"),
                invocations: row.get("invocations"),
                tokens_in: row.get("tokens_in"),
                tokens_out: row.get("tokens_out"),
                failures: row.get("failures"),
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn list_runs(&self) -> Result<Vec<RunRecord>, MemoryError> {
        let rows = sqlx::query("SELECT run_id, started_at, ended_at, final_phase FROM runs ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let started_at: String = row.get("started_at");
                let ended_at: Option<String> = row.get("ended_at");
                Ok(RunRecord {
                    run_id: row.get("run_id"),
                    started_at: DateTime::parse_from_rfc3339(&started_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    ended_at: ended_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
                    final_phase: row.get("final_phase"),
                })
            })
            .collect()
    }
}

/// No-op store for `memory_enabled = false` runs.
pub struct NullRelationalStore;

#[async_trait::async_trait]
impl RelationalStore for NullRelationalStore {
    async fn record_run_started(&self, _run_id: &str, _started_at: DateTime<Utc>) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn record_run_ended(
        &self,
        _run_id: &str,
        _ended_at: DateTime<Utc>,
        _final_phase: &str,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn record_phase_metric(&self, _metric: PhaseMetric) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn record_role_invocation(
        &self,
        _role: &str,
        _model_id: &str,
        _tokens_in: i64,
        _tokens_out: i64,
        _failed: bool,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn phase_metrics_for_run(&self, _run_id: &str) -> Result<Vec<PhaseMetric>, MemoryError> {
        Ok(Vec::new())
    }

    async fn role_metrics(&self) -> Result<Vec<RoleMetric>, MemoryError> {
        Ok(Vec::new())
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, MemoryError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_store() -> SqliteRelationalStore {
        SqliteRelationalStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn run_lifecycle_round_trips() {
        let store = open_test_store().await;
        let started = Utc::now();
        store.record_run_started("run-1", started).await.unwrap();
        store.record_run_ended("run-1", Utc::now(), "COMPLETE").await.unwrap();
    }

    #[tokio::test]
    async fn phase_metrics_are_queryable_by_run() {
        let store = open_test_store().await;
        store.record_run_started("run-1", Utc::now()).await.unwrap();
        store
            .record_phase_metric(PhaseMetric {
                run_id: "run-1".into(),
                phase: "PLANNING".into(),
                duration_ms: 1200,
                retries: 1,
                tokens_in: 500,
                tokens_out: 200,
                outcome: "success".into(),
            })
            .await
            .unwrap();

        let metrics = store.phase_metrics_for_run("run-1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].phase, "PLANNING");
    }

    #[tokio::test]
    async fn role_metrics_accumulate_across_invocations() {
        let store = open_test_store().await;
        store.record_role_invocation("developer", "gpt-5", 100, 50, false).await.unwrap();
        store.record_role_invocation("developer", "gpt-5", 80, 40, true).await.unwrap();

        let metrics = store.role_metrics().await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].invocations, 2);
        assert_eq!(metrics[0].tokens_in, 180);
        assert_eq!(metrics[0].failures, 1);
    }

    #[tokio::test]
    async fn list_runs_returns_every_recorded_run() {
        let store = open_test_store().await;
        store.record_run_started("run-1", Utc::now()).await.unwrap();
        store.record_run_started("run-2", Utc::now()).await.unwrap();
        store.record_run_ended("run-1", Utc::now(), "COMPLETE").await.unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn null_store_never_errors() {
        let store = NullRelationalStore;
        store.record_run_started("run-x", Utc::now()).await.unwrap();
        assert!(store.role_metrics().await.unwrap().is_empty());
    }
}
