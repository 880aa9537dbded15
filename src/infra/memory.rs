//! In-memory adapters: the full persistence surface plus a stub engine that
//! emits genuine single-page PDFs. They exist so the pipeline can be exercised
//! end to end without Postgres or a browser, with the same transition
//! semantics as the production backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lopdf::{Document, Object, dictionary};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::blobs::{BlobError, BlobHead, BlobStore, StoredBlob};
use crate::application::engine::{EngineHandle, RenderContext, RenderEngine, RenderError};
use crate::application::queue::{
    EnqueueOutcome, QueueError, TASK_LEASE_TIMEOUT, TaskQueue, TaskSpec,
};
use crate::application::repos::{
    AccessGrantsRepo, DocumentsRepo, JobsRepo, NewDocumentParams, NewJobParams, RepoError,
    UpsertAccessGrantParams,
};
use crate::domain::entities::{
    AccessGrantRecord, DocumentRecord, JobRecord, LeasedTask, PageArtifact, TaskSnapshot,
};
use crate::domain::types::{JobStage, JobStatus, QueueName, TaskState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoState {
    jobs: HashMap<Uuid, JobRecord>,
    documents: HashMap<Uuid, DocumentRecord>,
    grants: HashMap<(String, Uuid), AccessGrantRecord>,
}

/// One shared store backing all three repository traits.
#[derive(Default)]
pub struct MemoryRepos {
    state: Mutex<RepoState>,
}

impl MemoryRepos {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test hook: overwrite a job's timestamps, e.g. to age it past the
    /// reconciler's staleness threshold.
    pub fn set_job_updated_at(&self, job_id: Uuid, updated_at: OffsetDateTime) {
        let mut state = lock(&self.state);
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.updated_at = updated_at;
        }
    }

    /// Test hook: drop artifacts for the given page indices, simulating a
    /// crash after the counter was bumped elsewhere.
    pub fn drop_artifacts(&self, job_id: Uuid, page_indices: &[i32]) {
        let mut state = lock(&self.state);
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.page_artifacts
                .retain(|artifact| !page_indices.contains(&artifact.page_index));
        }
    }
}

#[async_trait]
impl JobsRepo for MemoryRepos {
    async fn create_job(&self, params: NewJobParams) -> Result<JobRecord, RepoError> {
        let now = OffsetDateTime::now_utc();
        let job = JobRecord {
            id: Uuid::new_v4(),
            user_id: params.user_id,
            email: params.email,
            assigned_quota: params.assigned_quota,
            total_pages: params.layout_pages.len() as i32,
            completed_pages: 0,
            page_artifacts: Vec::new(),
            layout_pages: params.layout_pages,
            stage: JobStage::Pending,
            status: JobStatus::Pending,
            output_document_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        lock(&self.state).jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
        Ok(lock(&self.state).jobs.get(&id).cloned())
    }

    async fn record_page_artifact(
        &self,
        job_id: Uuid,
        artifact: PageArtifact,
    ) -> Result<JobRecord, RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        job.page_artifacts.push(artifact);
        job.completed_pages += 1;
        job.stage = JobStage::Rendering;
        job.status = JobStatus::Processing;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(job.clone())
    }

    async fn claim_merge_trigger(&self, job_id: Uuid) -> Result<bool, RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        let claimable = job.output_document_id.is_none()
            && matches!(job.stage, JobStage::Pending | JobStage::Rendering);
        if claimable {
            job.stage = JobStage::Merging;
            job.updated_at = OffsetDateTime::now_utc();
        }
        Ok(claimable)
    }

    async fn claim_merge_run(&self, job_id: Uuid) -> Result<bool, RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        let claimable =
            job.output_document_id.is_none() && job.stage != JobStage::Completed;
        if claimable {
            job.stage = JobStage::Merging;
            job.status = JobStatus::Processing;
            job.updated_at = OffsetDateTime::now_utc();
        }
        Ok(claimable)
    }

    async fn finalize_job(&self, job_id: Uuid, document_id: Uuid) -> Result<(), RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        job.stage = JobStage::Completed;
        job.status = JobStatus::Completed;
        job.output_document_id = Some(document_id);
        job.failure_reason = None;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<(), RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        job.stage = JobStage::Failed;
        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.to_string());
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn reset_job_stage(
        &self,
        job_id: Uuid,
        stage: JobStage,
        status: JobStatus,
    ) -> Result<(), RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        job.stage = stage;
        job.status = status;
        job.failure_reason = None;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn dedupe_page_artifacts(&self, job_id: Uuid) -> Result<JobRecord, RepoError> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&job_id).ok_or(RepoError::NotFound)?;
        let mut seen = std::collections::BTreeSet::new();
        job.page_artifacts
            .retain(|artifact| seen.insert(artifact.page_index));
        job.completed_pages = job.page_artifacts.len() as i32;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(job.clone())
    }
}

#[async_trait]
impl DocumentsRepo for MemoryRepos {
    async fn create_document(
        &self,
        params: NewDocumentParams,
    ) -> Result<DocumentRecord, RepoError> {
        let document = DocumentRecord {
            id: Uuid::new_v4(),
            storage_key: params.storage_key,
            total_prints: params.total_prints,
            created_at: OffsetDateTime::now_utc(),
        };
        lock(&self.state)
            .documents
            .insert(document.id, document.clone());
        Ok(document)
    }

    async fn find_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, RepoError> {
        Ok(lock(&self.state).documents.get(&id).cloned())
    }
}

#[async_trait]
impl AccessGrantsRepo for MemoryRepos {
    async fn upsert_access_grant(
        &self,
        params: UpsertAccessGrantParams,
    ) -> Result<AccessGrantRecord, RepoError> {
        let mut state = lock(&self.state);
        let now = OffsetDateTime::now_utc();
        let key = (params.user_id.clone(), params.document_id);
        let grant = state
            .grants
            .entry(key)
            .and_modify(|grant| {
                grant.session_token = params.session_token.clone();
                grant.prints_allowed = params.prints_allowed;
                grant.updated_at = now;
            })
            .or_insert_with(|| AccessGrantRecord {
                id: Uuid::new_v4(),
                user_id: params.user_id.clone(),
                document_id: params.document_id,
                session_token: params.session_token.clone(),
                prints_allowed: params.prints_allowed,
                prints_used: 0,
                created_at: now,
                updated_at: now,
            });
        Ok(grant.clone())
    }

    async fn find_access_grant(
        &self,
        user_id: &str,
        document_id: Uuid,
    ) -> Result<Option<AccessGrantRecord>, RepoError> {
        Ok(lock(&self.state)
            .grants
            .get(&(user_id.to_string(), document_id))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct TaskRow {
    queue: QueueName,
    state: TaskState,
    attempts: i32,
    max_attempts: i32,
    payload: serde_json::Value,
    enqueued_at: u64,
    leased_until: Option<Instant>,
    last_error: Option<String>,
}

impl TaskRow {
    fn lease_expired(&self, now: Instant) -> bool {
        self.state == TaskState::Active
            && self.leased_until.is_some_and(|until| until <= now)
    }

    fn is_runnable(&self, now: Instant) -> bool {
        self.state == TaskState::Pending || self.lease_expired(now)
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, TaskRow>,
    sequence: u64,
}

/// Identity-deduplicating in-memory queue with the same lease semantics as
/// the Postgres table.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test hook: number of tasks currently pending on a queue.
    pub fn pending_count(&self, queue: QueueName) -> usize {
        lock(&self.state)
            .tasks
            .values()
            .filter(|row| row.queue == queue && row.state == TaskState::Pending)
            .count()
    }

    /// Test hook: age a lease so an unacknowledged task becomes reclaimable,
    /// as if its worker crashed long ago.
    pub fn expire_lease(&self, task_id: &str) {
        let mut state = lock(&self.state);
        if let Some(row) = state.tasks.get_mut(task_id) {
            row.leased_until = Some(Instant::now() - Duration::from_secs(1));
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, spec: TaskSpec) -> Result<EnqueueOutcome, QueueError> {
        let mut state = lock(&self.state);
        if state.tasks.contains_key(&spec.task_id) {
            return Ok(EnqueueOutcome::Duplicate);
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state.tasks.insert(
            spec.task_id,
            TaskRow {
                queue: spec.queue,
                state: TaskState::Pending,
                attempts: 0,
                max_attempts: spec.max_attempts,
                payload: spec.payload,
                enqueued_at: sequence,
                leased_until: None,
                last_error: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<LeasedTask>, QueueError> {
        let mut state = lock(&self.state);
        let now = Instant::now();
        let next = state
            .tasks
            .iter()
            .filter(|(_, row)| row.queue == queue && row.is_runnable(now))
            .min_by_key(|(_, row)| row.enqueued_at)
            .map(|(task_id, _)| task_id.clone());
        let Some(task_id) = next else {
            return Ok(None);
        };
        let row = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| QueueError::backend("leased task vanished"))?;
        row.state = TaskState::Active;
        row.attempts += 1;
        row.leased_until = Some(now + TASK_LEASE_TIMEOUT);
        Ok(Some(LeasedTask {
            task_id,
            payload: row.payload.clone(),
            attempt: row.attempts,
        }))
    }

    async fn complete(&self, task_id: &str) -> Result<(), QueueError> {
        lock(&self.state).tasks.remove(task_id);
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        if let Some(row) = state.tasks.get_mut(task_id) {
            row.last_error = Some(error.to_string());
            row.leased_until = None;
            row.state = if row.attempts >= row.max_attempts {
                TaskState::Failed
            } else {
                TaskState::Pending
            };
        }
        Ok(())
    }

    async fn find_task(&self, task_id: &str) -> Result<Option<TaskSnapshot>, QueueError> {
        Ok(lock(&self.state).tasks.get(task_id).map(|row| TaskSnapshot {
            task_id: task_id.to_string(),
            state: row.state,
            attempts: row.attempts,
        }))
    }

    async fn retry(&self, task_id: &str) -> Result<bool, QueueError> {
        let mut state = lock(&self.state);
        let now = Instant::now();
        match state.tasks.get_mut(task_id) {
            Some(row) if row.state == TaskState::Failed || row.lease_expired(now) => {
                row.state = TaskState::Pending;
                row.attempts = 0;
                row.leased_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

/// Map-backed blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bytes: Bytes,
        _content_type: &str,
        prefix: &str,
    ) -> Result<StoredBlob, BlobError> {
        if bytes.is_empty() {
            return Err(BlobError::EmptyPayload);
        }
        let key = format!("{prefix}/{}", Uuid::new_v4());
        let size_bytes = i64::try_from(bytes.len()).map_err(|_| BlobError::SizeOverflow)?;
        let checksum = hex::encode(Sha256::digest(&bytes));
        lock(&self.blobs).insert(key.clone(), bytes);
        Ok(StoredBlob {
            url: format!("memory://{key}"),
            key,
            size_bytes,
            checksum,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        lock(&self.blobs)
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    async fn head(&self, key: &str) -> Result<BlobHead, BlobError> {
        let blobs = lock(&self.blobs);
        let bytes = blobs.get(key).ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })?;
        Ok(BlobHead {
            size_bytes: bytes.len() as i64,
        })
    }

    async fn download_url(
        &self,
        key: &str,
        _ttl: std::time::Duration,
    ) -> Result<String, BlobError> {
        self.head(key).await?;
        Ok(format!("memory://{key}"))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine stub producing real single-page PDFs. The loaded markup is stored
/// verbatim in a private `XLabel` key on the page, so merged outputs can be
/// inspected for page identity and order.
pub struct StubEngine {
    /// Remaining render attempts that should fail before succeeding.
    failures: Arc<AtomicUsize>,
    /// Remaining exports that should come back as zero bytes.
    empties: Arc<AtomicUsize>,
    launches: Arc<AtomicUsize>,
}

impl StubEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` loads fail with a generic engine error.
    pub fn fail_next_renders(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` exports return an empty byte buffer.
    pub fn emit_empty_renders(&self, count: usize) {
        self.empties.store(count, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self {
            failures: Arc::new(AtomicUsize::new(0)),
            empties: Arc::new(AtomicUsize::new(0)),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RenderEngine for StubEngine {
    async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubHandle {
            failures: Arc::clone(&self.failures),
            empties: Arc::clone(&self.empties),
        }))
    }
}

struct StubHandle {
    failures: Arc<AtomicUsize>,
    empties: Arc<AtomicUsize>,
}

#[async_trait]
impl EngineHandle for StubHandle {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        Ok(Box::new(StubContext {
            failures: Arc::clone(&self.failures),
            empties: Arc::clone(&self.empties),
            html: None,
        }))
    }
}

struct StubContext {
    failures: Arc<AtomicUsize>,
    empties: Arc<AtomicUsize>,
    html: Option<String>,
}

#[async_trait]
impl RenderContext for StubContext {
    async fn load(&mut self, html: &str) -> Result<(), RenderError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
        {
            return Err(RenderError::engine("scripted load failure"));
        }
        self.html = Some(html.to_string());
        Ok(())
    }

    async fn export_pdf(&mut self) -> Result<Bytes, RenderError> {
        let html = self
            .html
            .as_deref()
            .ok_or_else(|| RenderError::engine("export before load"))?;
        if self
            .empties
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
        {
            return Ok(Bytes::new());
        }
        Ok(single_page_pdf(html))
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        self.html = None;
        Ok(())
    }
}

/// Build a minimal but well-formed one-page PDF carrying `label` in a private
/// page key.
pub fn single_page_pdf(label: &str) -> Bytes {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let content_id = document.add_object(lopdf::Stream::new(dictionary! {}, Vec::new()));
    let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        "XLabel" => Object::string_literal(label),
    });
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    // Serializing an in-memory document we just built cannot fail.
    if document.save_to(&mut out).is_err() {
        return Bytes::new();
    }
    Bytes::from(out)
}

/// Read back the `XLabel` markers of a (possibly merged) PDF in page order.
pub fn page_labels(bytes: &Bytes) -> Result<Vec<String>, lopdf::Error> {
    let document = Document::load_mem(bytes)?;
    let mut labels = Vec::new();
    for page_id in document.get_pages().into_values() {
        let page = document.get_object(page_id)?.as_dict()?;
        let label = page.get(b"XLabel")?.as_str()?;
        labels.push(String::from_utf8_lossy(label).into_owned());
    }
    Ok(labels)
}
