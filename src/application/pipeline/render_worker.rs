//! Render-stage worker: turn one `RenderPageTask` into a stored page artifact
//! and, when the page set completes, hand the job over to the merge stage.

use uuid::Uuid;

use tracing::{debug, info, warn};

use crate::application::pipeline::{PipelineError, WorkerContext};
use crate::application::queue::{EnqueueOutcome, MergeDocumentTask, RenderPageTask, TaskSpec};
use crate::domain::entities::{JobRecord, PageArtifact};
use crate::domain::types::{JobStage, QueueName, merge_task_id};

pub const RENDER_TASK_MAX_ATTEMPTS: i32 = 3;
pub const MERGE_TASK_MAX_ATTEMPTS: i32 = 2;

/// Process a single page-render task.
///
/// Re-delivery of an already-satisfied task is a success: if the job has
/// moved past rendering, the task acknowledges without touching the engine.
/// A failure marks the job failed before the error propagates, so the task
/// attempt is recorded against the queue entry too.
pub async fn process_render_page_task(
    ctx: &WorkerContext,
    task: RenderPageTask,
) -> Result<(), PipelineError> {
    let Some(job) = ctx.jobs.find_job(task.job_id).await? else {
        warn!(
            target = "application::pipeline::render_worker",
            job_id = %task.job_id,
            page_index = task.page_index,
            "render task references a job that no longer exists"
        );
        return Ok(());
    };

    if job.output_document_id.is_some()
        || matches!(job.stage, JobStage::Merging | JobStage::Completed)
    {
        debug!(
            target = "application::pipeline::render_worker",
            job_id = %job.id,
            page_index = task.page_index,
            stage = job.stage.as_str(),
            "job already past rendering, acknowledging without work"
        );
        return Ok(());
    }

    match render_and_record(ctx, &job, task.page_index).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(mark_err) = ctx.jobs.mark_job_failed(job.id, &err.to_string()).await {
                warn!(
                    target = "application::pipeline::render_worker",
                    job_id = %job.id,
                    error = %mark_err,
                    "failed to record job failure"
                );
            }
            Err(err)
        }
    }
}

async fn render_and_record(
    ctx: &WorkerContext,
    job: &JobRecord,
    page_index: i32,
) -> Result<(), PipelineError> {
    let layout = job
        .layout_pages
        .get(page_index as usize)
        .ok_or_else(|| {
            PipelineError::inconsistent(format!(
                "job {} has no layout for page {page_index}",
                job.id
            ))
        })?;

    let bytes = ctx.renderer.render_page(layout).await?;
    let stored = ctx.blobs.put(bytes, "application/pdf", "pages").await?;

    let updated = ctx
        .jobs
        .record_page_artifact(
            job.id,
            PageArtifact {
                page_index,
                storage_key: stored.key.clone(),
            },
        )
        .await?;

    metrics::counter!("pressroom_pages_rendered_total").increment(1);
    info!(
        target = "application::pipeline::render_worker",
        job_id = %job.id,
        page_index,
        storage_key = %stored.key,
        completed_pages = updated.completed_pages,
        total_pages = updated.total_pages,
        "page artifact recorded"
    );

    if updated.completed_pages >= updated.total_pages {
        maybe_trigger_merge(ctx, job.id).await?;
    }

    Ok(())
}

/// Try to move the job into the merge stage. Exactly one caller wins the
/// conditional stage update; everyone else sees a lost race and succeeds as a
/// no-op. The deterministic merge task id makes the enqueue itself a second,
/// independent dedup point.
pub(crate) async fn maybe_trigger_merge(
    ctx: &WorkerContext,
    job_id: Uuid,
) -> Result<bool, PipelineError> {
    if !ctx.jobs.claim_merge_trigger(job_id).await? {
        debug!(
            target = "application::pipeline::render_worker",
            job_id = %job_id,
            "merge already triggered by a concurrent worker"
        );
        return Ok(false);
    }

    let spec = TaskSpec::new(
        QueueName::MergeDocument,
        merge_task_id(job_id),
        &MergeDocumentTask { job_id },
        MERGE_TASK_MAX_ATTEMPTS,
    )?;
    match ctx.queue.enqueue(spec).await? {
        EnqueueOutcome::Enqueued => {
            info!(
                target = "application::pipeline::render_worker",
                job_id = %job_id,
                "merge task enqueued"
            );
        }
        EnqueueOutcome::Duplicate => {
            debug!(
                target = "application::pipeline::render_worker",
                job_id = %job_id,
                "merge task already queued"
            );
        }
    }
    Ok(true)
}
