//! The pluggable image → model conversion step.
//!
//! The pipeline only relies on the [`Converter`] contract: raw bytes plus the
//! declared content type in, artifact bytes or a diagnostic out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

pub mod glb;
pub mod heightmap;

pub use heightmap::HeightmapConverter;

/// Content type of every artifact served back to clients.
pub const GLTF_BINARY: &str = "model/gltf-binary";

pub type DynConverter = Arc<dyn Converter>;

#[derive(Debug, Clone)]
pub struct ConversionInput {
    pub job_id: Uuid,
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Artifact {
    pub fn glb(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: GLTF_BINARY.to_string(),
        }
    }
}

/// Diagnostic reported by a converter that rejected its input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ConverterError {
    pub message: String,
}

impl ConverterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, input: ConversionInput) -> Result<Artifact, ConverterError>;
}

/// Why a guarded conversion produced no artifact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionFailure {
    #[error("{0}")]
    Rejected(#[from] ConverterError),
    #[error("conversion timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("converter is shutting down")]
    Shutdown,
}

#[derive(Clone, Debug, Default)]
pub struct ConverterOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl ConverterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

/// A converter wrapped with a concurrency limit and a per-call deadline.
#[derive(Clone)]
pub struct GuardedConverter {
    inner: DynConverter,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl GuardedConverter {
    pub fn new(inner: DynConverter, opts: ConverterOptions) -> Self {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            inner,
            semaphore,
            timeout: opts.timeout,
        }
    }

    pub fn unbounded(inner: DynConverter) -> Self {
        Self::new(inner, ConverterOptions::new())
    }

    /// Waits for a free conversion slot. Hold the permit for the whole
    /// conversion; `None` means the converter is unbounded.
    pub async fn slot(&self) -> Result<Option<OwnedSemaphorePermit>, ConversionFailure> {
        match &self.semaphore {
            Some(sem) => sem
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| ConversionFailure::Shutdown),
            None => Ok(None),
        }
    }

    /// Stops handing out slots; waiting conversions resolve to `Shutdown`.
    pub fn close(&self) {
        if let Some(sem) = &self.semaphore {
            sem.close();
        }
    }

    pub async fn convert(&self, input: ConversionInput) -> Result<Artifact, ConversionFailure> {
        let fut = self.inner.convert(input);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner.map_err(ConversionFailure::from),
                Err(_) => Err(ConversionFailure::TimedOut(dur)),
            },
            None => fut.await.map_err(ConversionFailure::from),
        }
    }
}
