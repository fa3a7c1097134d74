use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::jobs::ledger::{JobLedger, LedgerError, TransitionOutcome};
use crate::jobs::model::{Job, JobState, NewJob, StateCounts, Transition};

/// Process-local ledger. Used when no database is configured and by tests.
#[derive(Default)]
pub struct MemoryLedger {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn insert(&self, new: NewJob) -> Result<Job, LedgerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&new.id) {
            return Err(LedgerError::Duplicate(new.id));
        }
        let job = Job::pending(new);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, LedgerError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
    ) -> Result<TransitionOutcome, LedgerError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(TransitionOutcome::Missing);
        };

        if job.state != transition.from_state() {
            return Ok(TransitionOutcome::Conflict { actual: job.state });
        }

        job.state = transition.to_state();
        job.updated_at = Utc::now().max(job.updated_at);
        match transition {
            Transition::Start => {}
            Transition::Complete { model_key } => job.model_key = Some(model_key),
            Transition::Fail { error } => job.error = Some(error),
        }

        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn count_by_state(&self) -> Result<StateCounts, LedgerError> {
        let mut counts = StateCounts::default();
        for job in self.jobs.read().await.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, LedgerError> {
        let mut stale: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.state == JobState::Processing && j.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|j| (j.updated_at, j.id));
        stale.truncate(limit.clamp(1, 500) as usize);
        Ok(stale)
    }

    async fn count_stale(&self, updated_before: DateTime<Utc>) -> Result<i64, LedgerError> {
        let n = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.state == JobState::Processing && j.updated_at < updated_before)
            .count();
        Ok(n as i64)
    }

    async fn list_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, LedgerError> {
        let mut pending: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.state == JobState::Pending && j.updated_at < updated_before)
            .cloned()
            .collect();
        pending.sort_by_key(|j| (j.created_at, j.id));
        pending.truncate(limit.clamp(1, 500) as usize);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_job() -> NewJob {
        let id = Uuid::new_v4();
        NewJob {
            id,
            image_key: format!("images/{id}"),
            image_content_type: "image/png".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_starts_pending_without_refs() {
        let ledger = MemoryLedger::new();
        let job = ledger.insert(new_job()).await.unwrap();

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.model_key, None);
        assert_eq!(job.error, None);
        assert_eq!(job.created_at, job.updated_at);
        assert_eq!(ledger.get(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let ledger = MemoryLedger::new();
        let new = new_job();
        ledger.insert(new.clone()).await.unwrap();

        let err = ledger.insert(new).await.unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate(_)));
    }

    #[tokio::test]
    async fn transitions_are_compare_and_swap() {
        let ledger = MemoryLedger::new();
        let job = ledger.insert(new_job()).await.unwrap();

        // cannot complete a job that never started
        let early = ledger
            .transition(
                job.id,
                Transition::Complete {
                    model_key: "models/x.glb".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            early,
            TransitionOutcome::Conflict {
                actual: JobState::Pending
            }
        );

        let started = ledger.transition(job.id, Transition::Start).await.unwrap();
        assert!(matches!(started, TransitionOutcome::Applied(ref j) if j.state == JobState::Processing));

        // a second start loses the race
        let again = ledger.transition(job.id, Transition::Start).await.unwrap();
        assert_eq!(
            again,
            TransitionOutcome::Conflict {
                actual: JobState::Processing
            }
        );

        let failed = ledger
            .transition(
                job.id,
                Transition::Fail {
                    error: "bad input".into(),
                },
            )
            .await
            .unwrap();
        let TransitionOutcome::Applied(failed) = failed else {
            panic!("fail should apply from processing");
        };
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.as_deref(), Some("bad input"));
        assert_eq!(failed.model_key, None);
        assert!(failed.updated_at >= job.updated_at);

        // terminal: nothing applies any more
        let late = ledger
            .transition(
                job.id,
                Transition::Complete {
                    model_key: "models/x.glb".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            late,
            TransitionOutcome::Conflict {
                actual: JobState::Failed
            }
        );
    }

    #[tokio::test]
    async fn transition_on_unknown_id_is_missing() {
        let ledger = MemoryLedger::new();
        let outcome = ledger
            .transition(Uuid::new_v4(), Transition::Start)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Missing);
    }

    #[tokio::test]
    async fn stale_listing_only_returns_old_processing_rows() {
        let ledger = MemoryLedger::new();
        let pending = ledger.insert(new_job()).await.unwrap();
        let running = ledger.insert(new_job()).await.unwrap();
        ledger.transition(running.id, Transition::Start).await.unwrap();

        let future_cutoff = Utc::now() + Duration::seconds(5);
        let stale = ledger.list_stale(future_cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, running.id);
        assert_ne!(stale[0].id, pending.id);

        let past_cutoff = Utc::now() - Duration::seconds(60);
        assert!(ledger.list_stale(past_cutoff, 10).await.unwrap().is_empty());

        let counts = ledger.count_by_state().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn stale_count_is_not_capped_by_the_listing_limit() {
        let ledger = MemoryLedger::new();
        for _ in 0..510 {
            let job = ledger.insert(new_job()).await.unwrap();
            ledger.transition(job.id, Transition::Start).await.unwrap();
        }

        let cutoff = Utc::now() + Duration::seconds(5);
        assert_eq!(ledger.list_stale(cutoff, 1000).await.unwrap().len(), 500);
        assert_eq!(ledger.count_stale(cutoff).await.unwrap(), 510);
    }

    #[tokio::test]
    async fn pending_listing_skips_started_jobs() {
        let ledger = MemoryLedger::new();
        let first = ledger.insert(new_job()).await.unwrap();
        let second = ledger.insert(new_job()).await.unwrap();
        let running = ledger.insert(new_job()).await.unwrap();
        ledger.transition(running.id, Transition::Start).await.unwrap();

        let cutoff = Utc::now() + Duration::seconds(5);
        let ids: Vec<Uuid> = ledger
            .list_pending(cutoff, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id) && ids.contains(&second.id));

        let past = Utc::now() - Duration::seconds(60);
        assert!(ledger.list_pending(past, 10).await.unwrap().is_empty());
    }
}
