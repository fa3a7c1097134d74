use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use meshflow::db::make_pool;
use meshflow::jobs::metrics::stale_cutoff;
use meshflow::jobs::{DynLedger, JobState, JobsRepo, StaleJobWatchdog, TaskScheduler};

#[derive(Parser, Debug)]
#[command(name = "meshctl", about = "Inspect and repair the conversions ledger")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Number of jobs per state
    Counts,
    /// Print one job as JSON
    Show { id: Uuid },
    /// List processing jobs with no update for `secs` seconds
    Stale {
        secs: u64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Fail processing jobs with no update for `secs` seconds
    Reap {
        secs: u64,
        /// Deadline the server gives each conversion; `secs` must exceed it
        #[arg(long, env = "MESHFLOW_CONVERSION_TIMEOUT_MS", default_value_t = 60_000)]
        conversion_timeout_ms: u64,
        /// Reap even if live conversions could still be running
        #[arg(long)]
        force: bool,
    },
}

/// Refuses thresholds that could fail a conversion a live server is still running.
fn reap_threshold(secs: u64, conversion_timeout_ms: u64, force: bool) -> anyhow::Result<Duration> {
    let threshold = Duration::from_secs(secs);
    if !force && threshold <= Duration::from_millis(conversion_timeout_ms) {
        anyhow::bail!(
            "refusing to reap jobs idle for {secs}s: must exceed the conversion timeout ({conversion_timeout_ms}ms); pass --force to override"
        );
    }
    Ok(threshold)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    meshflow::telemetry::init_tracing();

    let cli = Cli::parse();
    let pool = make_pool(&cli.database_url).await?;
    let ledger: DynLedger = Arc::new(JobsRepo::new(pool));

    match cli.command {
        Command::Counts => {
            let counts = ledger.count_by_state().await?;
            for state in JobState::ALL {
                println!("{:<11} {}", state.as_str(), counts.get(state));
            }
            println!("{:<11} {}", "total", counts.total());
        }
        Command::Show { id } => match ledger.get(id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => {
                eprintln!("job {id} not found");
                std::process::exit(1);
            }
        },
        Command::Stale { secs, limit } => {
            let cutoff = stale_cutoff(Duration::from_secs(secs));
            let jobs = ledger.list_stale(cutoff, limit).await?;
            if jobs.is_empty() {
                println!("no stale jobs");
            }
            for job in jobs {
                println!("{}  updated_at={}", job.id, job.updated_at.to_rfc3339());
            }
        }
        Command::Reap {
            secs,
            conversion_timeout_ms,
            force,
        } => {
            let threshold = reap_threshold(secs, conversion_timeout_ms, force)?;
            // nothing runs in this process, so every stale job is a candidate
            let watchdog = StaleJobWatchdog::new(ledger, TaskScheduler::new(), threshold);
            let reaped = watchdog.sweep().await?;
            println!("reaped {reaped} job(s)");
        }
    }

    Ok(())
}
