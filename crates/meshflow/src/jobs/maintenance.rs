use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::jobs::ledger::{DynLedger, LedgerError, TransitionOutcome};
use crate::jobs::metrics::stale_cutoff;
use crate::jobs::model::Transition;
use crate::jobs::pipeline::ConversionPipeline;
use crate::jobs::scheduler::TaskScheduler;

const SWEEP_BATCH: i64 = 100;

/// Resolves jobs left in `Processing` by a process that died mid-conversion,
/// and optionally hands pending jobs without a task back to a pipeline.
#[derive(Clone)]
pub struct StaleJobWatchdog {
    ledger: DynLedger,
    scheduler: TaskScheduler,
    stale_after: Duration,
    resume: Option<ConversionPipeline>,
}

impl StaleJobWatchdog {
    pub fn new(ledger: DynLedger, scheduler: TaskScheduler, stale_after: Duration) -> Self {
        Self {
            ledger,
            scheduler,
            stale_after,
            resume: None,
        }
    }

    /// Also reschedule pending jobs idle for `stale_after` through `pipeline`.
    pub fn with_resume(mut self, pipeline: ConversionPipeline) -> Self {
        self.resume = Some(pipeline);
        self
    }

    pub fn abandoned_message(&self) -> String {
        format!(
            "conversion abandoned: no progress for {}s",
            self.stale_after.as_secs()
        )
    }

    /// One pass over stale jobs. Returns how many were moved to `Failed`.
    pub async fn sweep(&self) -> Result<u64, LedgerError> {
        let cutoff = stale_cutoff(self.stale_after);
        let stale = self.ledger.list_stale(cutoff, SWEEP_BATCH).await?;

        let mut reaped = 0;
        for job in stale {
            // still owned by a live task in this process
            if self.scheduler.is_in_flight(job.id) {
                continue;
            }

            let outcome = self
                .ledger
                .transition(
                    job.id,
                    Transition::Fail {
                        error: self.abandoned_message(),
                    },
                )
                .await?;

            match outcome {
                TransitionOutcome::Applied(_) => {
                    tracing::warn!(job_id = %job.id, stuck_since = %job.updated_at, "reaped stale job");
                    reaped += 1;
                }
                // settled between listing and updating
                TransitionOutcome::Conflict { .. } | TransitionOutcome::Missing => {}
            }
        }

        Ok(reaped)
    }

    /// Reschedules pending jobs nobody is working on. A no-op without
    /// [`StaleJobWatchdog::with_resume`].
    pub async fn resume_orphans(&self) -> Result<usize, LedgerError> {
        match &self.resume {
            Some(pipeline) => pipeline.resume_pending(self.stale_after, SWEEP_BATCH).await,
            None => Ok(0),
        }
    }

    /// Sweeps every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        loop {
            match self.sweep().await {
                Ok(n) if n > 0 => tracing::info!(reaped = n, "watchdog sweep finished"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "watchdog sweep failed"),
            }
            if let Err(e) = self.resume_orphans().await {
                tracing::error!(error = %e, "resuming pending jobs failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::debug!("watchdog stopped");
    }
}
