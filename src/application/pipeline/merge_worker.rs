//! Merge-stage worker: combine a job's page artifacts into one document,
//! register it, grant the requesting user access and finalize the job.

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::pipeline::{PipelineError, WorkerContext, pdf};
use crate::application::queue::MergeDocumentTask;
use crate::application::repos::{NewDocumentParams, UpsertAccessGrantParams};
use crate::domain::entities::JobRecord;

pub async fn process_merge_task(
    ctx: &WorkerContext,
    task: MergeDocumentTask,
) -> Result<(), PipelineError> {
    let Some(job) = ctx.jobs.find_job(task.job_id).await? else {
        warn!(
            target = "application::pipeline::merge_worker",
            job_id = %task.job_id,
            "merge task references a job that no longer exists"
        );
        return Ok(());
    };

    // Conditional claim: a redelivered or duplicate merge task loses here and
    // acknowledges without producing a second document.
    if !ctx.jobs.claim_merge_run(job.id).await? {
        debug!(
            target = "application::pipeline::merge_worker",
            job_id = %job.id,
            "merge already claimed or finished, acknowledging without work"
        );
        return Ok(());
    }

    match merge_and_finalize(ctx, &job).await {
        Ok(document_id) => {
            info!(
                target = "application::pipeline::merge_worker",
                job_id = %job.id,
                document_id = %document_id,
                "job finalized"
            );
            Ok(())
        }
        Err(err) => {
            if let Err(mark_err) = ctx.jobs.mark_job_failed(job.id, &err.to_string()).await {
                warn!(
                    target = "application::pipeline::merge_worker",
                    job_id = %job.id,
                    error = %mark_err,
                    "failed to record job failure"
                );
            }
            Err(err)
        }
    }
}

async fn merge_and_finalize(
    ctx: &WorkerContext,
    job: &JobRecord,
) -> Result<Uuid, PipelineError> {
    let started_at = std::time::Instant::now();

    // Sort by page index and drop duplicates; a page rendered twice under
    // races keeps its first recorded artifact.
    let mut artifacts = job.page_artifacts.clone();
    artifacts.sort_by_key(|artifact| artifact.page_index);
    artifacts.dedup_by_key(|artifact| artifact.page_index);

    if artifacts.len() < job.total_pages as usize {
        return Err(PipelineError::inconsistent(format!(
            "job {} entered merge with {} of {} page artifacts",
            job.id,
            artifacts.len(),
            job.total_pages,
        )));
    }

    let mut pages = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let bytes = ctx.blobs.get(&artifact.storage_key).await?;
        pages.push((artifact.page_index, bytes));
    }

    let merged = pdf::concat_pages(pages).await?;
    let stored = ctx.blobs.put(merged, "application/pdf", "documents").await?;

    let total_prints = coerce_total_prints(job.assigned_quota);
    let document = ctx
        .documents
        .create_document(NewDocumentParams {
            storage_key: stored.key.clone(),
            total_prints,
        })
        .await?;

    ctx.access_grants
        .upsert_access_grant(UpsertAccessGrantParams {
            user_id: job.user_id.clone(),
            document_id: document.id,
            session_token: new_session_token(),
            prints_allowed: total_prints,
        })
        .await?;

    ctx.jobs.finalize_job(job.id, document.id).await?;

    metrics::counter!("pressroom_merges_total").increment(1);
    metrics::histogram!("pressroom_merge_ms")
        .record(started_at.elapsed().as_millis() as f64);
    info!(
        target = "application::pipeline::merge_worker",
        job_id = %job.id,
        document_id = %document.id,
        pages = artifacts.len(),
        total_prints,
        storage_key = %stored.key,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "document merged and stored"
    );

    Ok(document.id)
}

/// Print quotas arrive as untrusted floats; anything non-finite or negative
/// collapses to zero rather than failing the merge.
pub(crate) fn coerce_total_prints(assigned_quota: Option<f64>) -> i32 {
    match assigned_quota {
        Some(value) if value.is_finite() && value >= 0.0 => value.min(i32::MAX as f64) as i32,
        _ => 0,
    }
}

fn new_session_token() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_coercion_handles_untrusted_values() {
        assert_eq!(coerce_total_prints(None), 0);
        assert_eq!(coerce_total_prints(Some(f64::NAN)), 0);
        assert_eq!(coerce_total_prints(Some(f64::INFINITY)), 0);
        assert_eq!(coerce_total_prints(Some(-3.0)), 0);
        assert_eq!(coerce_total_prints(Some(0.0)), 0);
        assert_eq!(coerce_total_prints(Some(4.9)), 4);
        assert_eq!(coerce_total_prints(Some(12.0)), 12);
    }

    #[test]
    fn session_tokens_are_unique_hex() {
        let a = new_session_token();
        let b = new_session_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
