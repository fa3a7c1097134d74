pub mod ledger;
pub mod maintenance;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod repo;
pub mod resolver;
pub mod scheduler;

pub use ledger::{DynLedger, JobLedger, LedgerError, TransitionOutcome};
pub use maintenance::StaleJobWatchdog;
pub use memory::MemoryLedger;
pub use metrics::{Metrics, MetricsRepo};
pub use model::{Job, JobState, NewJob, StateCounts, Transition};
pub use pipeline::{ConversionPipeline, JobHandle, PipelineError};
pub use repo::JobsRepo;
pub use resolver::{ArtifactResponse, Asset, JobResolver, JobStatus, ResolveError};
pub use scheduler::TaskScheduler;
