#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::Semaphore;
use uuid::Uuid;

use meshflow::convert::{
    Artifact, ConversionInput, Converter, ConverterError, ConverterOptions, GuardedConverter,
};
use meshflow::jobs::{
    ConversionPipeline, DynLedger, JobResolver, JobState, JobStatus, MemoryLedger, TaskScheduler,
};
use meshflow::storage::BlobStore;

/// Connects to `TEST_DATABASE_URL`, migrates and empties the ledger.
/// Returns `None` when the variable is unset so the caller can skip.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE conversions")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

/// Returns the same bytes for every input.
pub struct StaticConverter(pub Bytes);

#[async_trait]
impl Converter for StaticConverter {
    async fn convert(&self, _input: ConversionInput) -> Result<Artifact, ConverterError> {
        Ok(Artifact::glb(self.0.clone()))
    }
}

/// Rejects every input with the same diagnostic.
pub struct FailingConverter(pub &'static str);

#[async_trait]
impl Converter for FailingConverter {
    async fn convert(&self, _input: ConversionInput) -> Result<Artifact, ConverterError> {
        Err(ConverterError::new(self.0))
    }
}

pub struct PanickingConverter;

#[async_trait]
impl Converter for PanickingConverter {
    async fn convert(&self, _input: ConversionInput) -> Result<Artifact, ConverterError> {
        panic!("converter blew up");
    }
}

/// Blocks every conversion until [`Gate::open`] is called.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
    entered: Arc<AtomicUsize>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open(&self) {
        self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Number of conversions that have reached the converter.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

pub struct GatedConverter {
    pub gate: Gate,
    pub output: Bytes,
}

#[async_trait]
impl Converter for GatedConverter {
    async fn convert(&self, _input: ConversionInput) -> Result<Artifact, ConverterError> {
        self.gate.entered.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .permits
            .acquire()
            .await
            .map_err(|_| ConverterError::new("gate closed"))?;
        Ok(Artifact::glb(self.output.clone()))
    }
}

pub struct Harness {
    pub ledger: DynLedger,
    pub blobs: BlobStore,
    pub scheduler: TaskScheduler,
    pub pipeline: ConversionPipeline,
    pub resolver: JobResolver,
}

pub fn harness(converter: impl Converter + 'static) -> Harness {
    harness_with(converter, ConverterOptions::new().max_concurrency(4))
}

pub fn harness_with(converter: impl Converter + 'static, opts: ConverterOptions) -> Harness {
    harness_over(
        Arc::new(MemoryLedger::new()),
        BlobStore::in_memory(),
        converter,
        opts,
    )
}

/// A fresh pipeline over existing state, as after a process restart.
pub fn harness_over(
    ledger: DynLedger,
    blobs: BlobStore,
    converter: impl Converter + 'static,
    opts: ConverterOptions,
) -> Harness {
    let scheduler = TaskScheduler::new();
    let pipeline = ConversionPipeline::new(
        ledger.clone(),
        blobs.clone(),
        GuardedConverter::new(Arc::new(converter), opts),
        scheduler.clone(),
    );
    let resolver = JobResolver::new(ledger.clone(), blobs.clone());

    Harness {
        ledger,
        blobs,
        scheduler,
        pipeline,
        resolver,
    }
}

pub fn fake_jpeg(len: usize) -> Bytes {
    let mut bytes = vec![0u8; len];
    bytes[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
    Bytes::from(bytes)
}

/// Polls until the job is completed or failed.
pub async fn wait_for_terminal(resolver: &JobResolver, id: Uuid) -> JobStatus {
    wait_for_state(resolver, id, |s| s.is_terminal()).await
}

pub async fn wait_for_state(
    resolver: &JobResolver,
    id: Uuid,
    pred: impl Fn(JobState) -> bool,
) -> JobStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = resolver.get_status(id).await.expect("status");
        if pred(status.state) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory object store whose writes fail for keys under `fail_prefix`.
#[derive(Debug)]
pub struct FaultyStore {
    inner: InMemory,
    fail_prefix: String,
}

impl FaultyStore {
    pub fn failing_writes_under(prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemory::new(),
            fail_prefix: prefix.to_string(),
        })
    }

    fn injected(&self, location: &ObjPath) -> object_store::Error {
        object_store::Error::Generic {
            store: "faulty",
            source: format!("injected write failure for {location}").into(),
        }
    }
}

impl std::fmt::Display for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaultyStore({})", self.fail_prefix)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_opts(
        &self,
        location: &ObjPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        if location.as_ref().starts_with(&self.fail_prefix) {
            return Err(self.injected(location));
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjPath,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        if location.as_ref().starts_with(&self.fail_prefix) {
            return Err(self.injected(location));
        }
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &ObjPath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjPath) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&ObjPath>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjPath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjPath, to: &ObjPath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &ObjPath, to: &ObjPath) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
