use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{JobState, JobStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub id: Uuid,
    pub status: JobState,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "modelUrl")]
    pub model_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "modelUrl")]
    pub model_url: String,
}

impl StatusResponse {
    pub fn new(status: JobStatus, links: Links) -> Self {
        Self {
            id: status.id,
            status: status.state,
            error: status.error,
            created_at: status.created_at,
            updated_at: status.updated_at,
            image_url: links.image_url,
            model_url: links.model_url,
        }
    }
}

/// Body of a `202` from `/model/{id}` while the job is still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotReadyResponse {
    pub id: Uuid,
    pub status: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusQuery {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Links {
    pub image_url: String,
    pub model_url: String,
}

impl Links {
    pub fn for_job(base: &str, id: Uuid) -> Self {
        Self {
            image_url: format!("{base}/image/{id}"),
            model_url: format!("{base}/model/{id}"),
        }
    }
}
