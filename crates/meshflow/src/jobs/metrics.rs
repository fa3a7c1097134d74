use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::ledger::{DynLedger, LedgerError};
use crate::jobs::model::{JobState, StateCounts};

#[derive(Debug, Serialize)]
pub struct Metrics {
    pub now_utc: DateTime<Utc>,
    pub jobs: StateCounts,
    pub stale_processing: i64,
}

#[derive(Clone)]
pub struct MetricsRepo {
    ledger: DynLedger,
    stale_after: Duration,
}

impl MetricsRepo {
    pub fn new(ledger: DynLedger, stale_after: Duration) -> Self {
        Self {
            ledger,
            stale_after,
        }
    }

    pub async fn snapshot(&self) -> Result<Metrics, LedgerError> {
        let jobs = self.ledger.count_by_state().await?;
        let cutoff = stale_cutoff(self.stale_after);
        let stale_processing = self.ledger.count_stale(cutoff).await?;

        Ok(Metrics {
            now_utc: Utc::now(),
            jobs,
            stale_processing,
        })
    }
}

/// "now - stale_after", the oldest `updated_at` a processing job may have.
pub fn stale_cutoff(stale_after: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(stale_after)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Prometheus text exposition of a snapshot.
pub fn render_prometheus(m: &Metrics) -> String {
    let mut out = String::new();
    out.push_str("# HELP meshflow_jobs Number of conversion jobs by state\n");
    out.push_str("# TYPE meshflow_jobs gauge\n");
    for state in JobState::ALL {
        let _ = writeln!(out, "meshflow_jobs{{state=\"{state}\"}} {}", m.jobs.get(state));
    }
    out.push_str(
        "# HELP meshflow_jobs_stale_processing Jobs processing longer than the stale threshold\n",
    );
    out.push_str("# TYPE meshflow_jobs_stale_processing gauge\n");
    let _ = writeln!(out, "meshflow_jobs_stale_processing {}", m.stale_processing);
    out
}
