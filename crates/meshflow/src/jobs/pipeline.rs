use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::convert::{ConversionFailure, ConversionInput, GuardedConverter};
use crate::jobs::ledger::{DynLedger, LedgerError, TransitionOutcome};
use crate::jobs::metrics::stale_cutoff;
use crate::jobs::model::{JobState, NewJob, Transition};
use crate::jobs::scheduler::TaskScheduler;
use crate::storage::{image_key, model_key, BlobStore, StorageError};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Diagnostic recorded for faults that are not the converter's own verdict.
pub const INTERNAL_FAULT_MESSAGE: &str = "internal error during conversion";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid upload: {0}")]
    Validation(String),
    #[error("failed to store image: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to record job: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub state: JobState,
}

/// What went wrong between `Processing` and a terminal state.
#[derive(Debug, Error)]
enum TaskFault {
    /// Recorded verbatim as the job's error.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<ConversionFailure> for TaskFault {
    fn from(f: ConversionFailure) -> Self {
        TaskFault::Rejected(f.to_string())
    }
}

/// Creates jobs and drives each one through its lifecycle in the background.
#[derive(Clone)]
pub struct ConversionPipeline {
    ledger: DynLedger,
    blobs: BlobStore,
    converter: Arc<GuardedConverter>,
    scheduler: TaskScheduler,
}

impl ConversionPipeline {
    pub fn new(
        ledger: DynLedger,
        blobs: BlobStore,
        converter: GuardedConverter,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            ledger,
            blobs,
            converter: Arc::new(converter),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn converter(&self) -> &GuardedConverter {
        &self.converter
    }

    /// Stores the upload, records a pending job and schedules its conversion.
    /// Returns as soon as the job row exists; never waits on the converter.
    #[tracing::instrument(skip(self, image), fields(bytes = image.len(), job_id = tracing::field::Empty))]
    pub async fn ingest(
        &self,
        image: Bytes,
        content_type: Option<&str>,
    ) -> Result<JobHandle, PipelineError> {
        if image.is_empty() {
            return Err(PipelineError::Validation("image payload is empty".into()));
        }

        let content_type = content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let id = Uuid::new_v4();
        tracing::Span::current().record("job_id", tracing::field::display(id));

        // the blob must exist before the row makes the job visible
        let key = image_key(id);
        self.blobs.put_new(&key, image).await?;

        let job = self
            .ledger
            .insert(NewJob {
                id,
                image_key: key,
                image_content_type: content_type,
                created_at: Utc::now(),
            })
            .await
            .inspect_err(|e| {
                tracing::error!(error = %e, "ledger insert failed; image blob left orphaned");
            })?;

        self.schedule(job.id);
        tracing::info!(content_type = %job.image_content_type, "job accepted");

        Ok(JobHandle {
            id: job.id,
            state: job.state,
        })
    }

    fn schedule(&self, id: Uuid) -> bool {
        let this = self.clone();
        let spawned = self
            .scheduler
            .spawn(id, async move { this.run_conversion(id).await });
        if !spawned {
            tracing::debug!(job_id = %id, "conversion already scheduled; not spawning again");
        }
        spawned
    }

    /// Schedules pending jobs that have no live task in this process, e.g.
    /// jobs left queued by a previous shutdown. Only rows untouched for at
    /// least `idle_for` are considered. Returns how many tasks were spawned.
    pub async fn resume_pending(&self, idle_for: Duration, limit: i64) -> Result<usize, LedgerError> {
        let pending = self
            .ledger
            .list_pending(stale_cutoff(idle_for), limit)
            .await?;

        let mut resumed = 0;
        for job in pending {
            if self.scheduler.is_in_flight(job.id) {
                continue;
            }
            // another process may win the start transition; the loser just exits
            if self.schedule(job.id) {
                resumed += 1;
            }
        }

        if resumed > 0 {
            tracing::info!(resumed, "rescheduled pending jobs");
        }
        Ok(resumed)
    }

    /// The background half of a job. Always tries to leave the job in a
    /// terminal state once it has been moved to `Processing`.
    #[tracing::instrument(skip(self))]
    pub async fn run_conversion(&self, job_id: Uuid) {
        // queue for a slot while still pending so waiting time never counts as processing
        let _permit = match self.converter.slot().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(error = %e, "no conversion slot; job stays pending");
                return;
            }
        };

        match self.ledger.transition(job_id, Transition::Start).await {
            Ok(TransitionOutcome::Applied(_)) => {}
            Ok(TransitionOutcome::Missing) => {
                tracing::warn!("job row missing; skipping conversion");
                return;
            }
            Ok(TransitionOutcome::Conflict { actual }) => {
                tracing::warn!(state = %actual, "job already left pending; skipping conversion");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not mark job processing; job stays pending");
                return;
            }
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.convert_and_store(job_id))
            .catch_unwind()
            .await;

        let transition = match outcome {
            Ok(Ok(model_key)) => Transition::Complete { model_key },
            Ok(Err(TaskFault::Rejected(message))) => Transition::Fail { error: message },
            Ok(Err(fault)) => {
                tracing::error!(error = %fault, "conversion pipeline fault");
                Transition::Fail {
                    error: INTERNAL_FAULT_MESSAGE.to_string(),
                }
            }
            Err(_) => {
                tracing::error!("converter panicked");
                Transition::Fail {
                    error: INTERNAL_FAULT_MESSAGE.to_string(),
                }
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match self.ledger.transition(job_id, transition).await {
            Ok(TransitionOutcome::Applied(job)) => {
                tracing::info!(state = %job.state, latency_ms, error = job.error.as_deref(), "conversion finished");
            }
            Ok(TransitionOutcome::Conflict { actual }) => {
                tracing::warn!(state = %actual, latency_ms, "job settled elsewhere; result dropped");
            }
            Ok(TransitionOutcome::Missing) => {
                tracing::warn!(latency_ms, "job row vanished before it could be settled");
            }
            Err(e) => {
                tracing::error!(error = %e, latency_ms, "failed to record outcome; job left processing");
            }
        }
    }

    async fn convert_and_store(&self, job_id: Uuid) -> Result<String, TaskFault> {
        let job = self
            .ledger
            .get(job_id)
            .await?
            .ok_or_else(|| TaskFault::Rejected("job record disappeared".into()))?;

        let bytes = match self.blobs.get(&job.image_key).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { key }) => {
                return Err(TaskFault::Rejected(format!(
                    "source image `{key}` is missing from storage"
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let artifact = self
            .converter
            .convert(ConversionInput {
                job_id,
                bytes,
                content_type: job.image_content_type.clone(),
            })
            .await?;

        // the artifact is durable before the job can be seen as completed
        let key = model_key(job_id);
        self.blobs.put_new(&key, artifact.bytes).await?;
        Ok(key)
    }
}
