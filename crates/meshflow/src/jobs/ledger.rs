use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::model::{Job, JobState, NewJob, StateCounts, Transition};

pub type DynLedger = Arc<dyn JobLedger>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("job {0} already exists")]
    Duplicate(Uuid),
    #[error("corrupt ledger row for job {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of a conditional transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row was in the expected state and now holds the new one.
    Applied(Job),
    /// No row with that id.
    Missing,
    /// The row exists but was not in the state the transition expects.
    Conflict { actual: JobState },
}

/// Durable record store for conversion jobs.
///
/// Every implementation must apply [`Transition`]s as compare-and-swap
/// writes: the update happens only if the stored state equals
/// `transition.from_state()`, and the state, `model_key`/`error` and
/// `updated_at` change together.
#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Job, LedgerError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, LedgerError>;

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
    ) -> Result<TransitionOutcome, LedgerError>;

    async fn count_by_state(&self) -> Result<StateCounts, LedgerError>;

    /// Jobs sitting in `Processing` whose last transition is older than
    /// `updated_before`, oldest first.
    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, LedgerError>;

    /// Uncapped count of the rows [`JobLedger::list_stale`] would match.
    async fn count_stale(&self, updated_before: DateTime<Utc>) -> Result<i64, LedgerError>;

    /// Jobs still in `Pending` created or touched before `updated_before`,
    /// oldest first. Used to hand orphaned jobs back to a scheduler.
    async fn list_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, LedgerError>;
}
