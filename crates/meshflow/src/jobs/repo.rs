// crates/meshflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::ledger::{JobLedger, LedgerError, TransitionOutcome};
use crate::jobs::model::{Job, JobState, NewJob, StateCounts, Transition};

const JOB_COLUMNS: &str = r#"
    id, image_key, image_content_type, model_key,
    status, error,
    created_at, updated_at
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ConversionRow {
    id: Uuid,
    image_key: String,
    image_content_type: String,
    model_key: Option<String>,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversionRow> for Job {
    type Error = LedgerError;

    fn try_from(row: ConversionRow) -> Result<Self, Self::Error> {
        let state: JobState = row.status.parse().map_err(|e| LedgerError::Corrupt {
            id: row.id,
            reason: format!("{e}"),
        })?;

        Ok(Job {
            id: row.id,
            image_key: row.image_key,
            image_content_type: row.image_content_type,
            model_key: row.model_key,
            state,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed ledger over the `conversions` table.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_state(&self, id: Uuid) -> Result<Option<JobState>, LedgerError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM conversions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(|s| {
                s.parse().map_err(|e| LedgerError::Corrupt {
                    id,
                    reason: format!("{e}"),
                })
            })
            .transpose()
    }
}

#[async_trait]
impl JobLedger for JobsRepo {
    async fn insert(&self, job: NewJob) -> Result<Job, LedgerError> {
        let row = sqlx::query_as::<_, ConversionRow>(&format!(
            r#"
            INSERT INTO conversions (id, image_key, image_content_type, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.image_key)
        .bind(&job.image_content_type)
        .bind(JobState::Pending.as_str())
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => LedgerError::Duplicate(job.id),
            _ => LedgerError::Database(e),
        })?;

        row.try_into()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, LedgerError> {
        let row = sqlx::query_as::<_, ConversionRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM conversions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    /// Single-statement conditional update. The `status = $expected` guard
    /// is what keeps a stray second task from overwriting a settled job.
    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
    ) -> Result<TransitionOutcome, LedgerError> {
        let from = transition.from_state().as_str();
        let to = transition.to_state().as_str();

        let (model_key, error) = match &transition {
            Transition::Start => (None, None),
            Transition::Complete { model_key } => (Some(model_key.as_str()), None),
            Transition::Fail { error } => (None, Some(error.as_str())),
        };

        let row = sqlx::query_as::<_, ConversionRow>(&format!(
            r#"
            UPDATE conversions
            SET status = $3,
                model_key = COALESCE($4, model_key),
                error = COALESCE($5, error),
                updated_at = GREATEST(clock_timestamp(), updated_at)
            WHERE id = $1
              AND status = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(model_key)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(row.try_into()?));
        }

        Ok(match self.current_state(id).await? {
            Some(actual) => TransitionOutcome::Conflict { actual },
            None => TransitionOutcome::Missing,
        })
    }

    async fn count_by_state(&self) -> Result<StateCounts, LedgerError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM conversions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StateCounts::default();
        for (status, n) in rows {
            match status.parse::<JobState>() {
                Ok(state) => counts.add(state, n),
                Err(e) => tracing::warn!(error = %e, rows = n, "skipping unknown status in counts"),
            }
        }
        Ok(counts)
    }

    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, LedgerError> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, ConversionRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM conversions
            WHERE status = 'processing'
              AND updated_at < $1
            ORDER BY updated_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_stale(&self, updated_before: DateTime<Utc>) -> Result<i64, LedgerError> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM conversions
            WHERE status = 'processing'
              AND updated_at < $1
            "#,
        )
        .bind(updated_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(n)
    }

    async fn list_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, LedgerError> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, ConversionRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM conversions
            WHERE status = 'pending'
              AND updated_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }
}
