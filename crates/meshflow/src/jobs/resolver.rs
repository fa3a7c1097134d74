use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::convert::GLTF_BINARY;
use crate::jobs::ledger::{DynLedger, LedgerError};
use crate::jobs::model::{Job, JobState};
use crate::storage::{BlobStore, StorageError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("blob `{key}` for job {id} is missing")]
    BlobMissing { id: Uuid, key: String },
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl ResolveError {
    /// Unknown job, or a ledger row pointing at a blob that is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::BlobMissing { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub state: JobState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatus {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub bytes: Bytes,
    pub content_type: String,
}

/// The state-dependent answer to a model fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactResponse {
    Ready(Asset),
    NotReady { state: JobState },
    Failed { error: String },
}

/// Read-only view over the ledger and blob store.
#[derive(Clone)]
pub struct JobResolver {
    ledger: DynLedger,
    blobs: BlobStore,
}

impl JobResolver {
    pub fn new(ledger: DynLedger, blobs: BlobStore) -> Self {
        Self { ledger, blobs }
    }

    async fn job(&self, id: Uuid) -> Result<Job, ResolveError> {
        self.ledger
            .get(id)
            .await?
            .ok_or(ResolveError::JobNotFound(id))
    }

    async fn blob(&self, id: Uuid, key: &str) -> Result<Bytes, ResolveError> {
        self.blobs.get(key).await.map_err(|e| match e {
            StorageError::NotFound { key } => {
                tracing::warn!(job_id = %id, %key, "ledger references a missing blob");
                ResolveError::BlobMissing { id, key }
            }
            other => ResolveError::Storage(other),
        })
    }

    pub async fn get_status(&self, id: Uuid) -> Result<JobStatus, ResolveError> {
        Ok(self.job(id).await?.into())
    }

    pub async fn get_image(&self, id: Uuid) -> Result<Asset, ResolveError> {
        let job = self.job(id).await?;
        let bytes = self.blob(id, &job.image_key).await?;
        Ok(Asset {
            bytes,
            content_type: job.image_content_type,
        })
    }

    pub async fn get_artifact(&self, id: Uuid) -> Result<ArtifactResponse, ResolveError> {
        let job = self.job(id).await?;
        match job.state {
            JobState::Pending | JobState::Processing => {
                Ok(ArtifactResponse::NotReady { state: job.state })
            }
            JobState::Failed => Ok(ArtifactResponse::Failed {
                error: job.error.unwrap_or_default(),
            }),
            JobState::Completed => {
                let Some(key) = job.model_key else {
                    tracing::warn!(job_id = %id, "completed job has no model key");
                    return Err(ResolveError::BlobMissing {
                        id,
                        key: String::new(),
                    });
                };
                let bytes = self.blob(id, &key).await?;
                Ok(ArtifactResponse::Ready(Asset {
                    bytes,
                    content_type: GLTF_BINARY.to_string(),
                }))
            }
        }
    }
}
