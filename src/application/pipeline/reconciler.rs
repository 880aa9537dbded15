//! Drift repair for jobs whose tasks were lost, crashed mid-flight or
//! exhausted their attempts.
//!
//! Healing is best-effort and rate-limited per job: repair paths remember
//! when they last acted on a job and stay quiet inside the cooldown window,
//! so frequent status polling cannot amplify into task floods.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::pipeline::render_worker::{
    MERGE_TASK_MAX_ATTEMPTS, RENDER_TASK_MAX_ATTEMPTS,
};
use crate::application::pipeline::{PipelineError, WorkerContext};
use crate::application::queue::{
    EnqueueOutcome, MergeDocumentTask, RenderPageTask, TaskSpec,
};
use crate::domain::types::{
    JobStage, JobStatus, QueueName, TaskState, merge_task_id, render_task_id,
};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// What a reconciliation pass concluded about one job.
#[derive(Debug, PartialEq, Eq)]
pub enum HealOutcome {
    /// The job was repaired recently; nothing was inspected.
    Cooldown,
    /// The job does not exist.
    NotFound,
    /// Nothing to repair: finished, healthy, or still making progress.
    Converged,
    /// All pages were present but no merge had landed; the merge was reissued.
    MergeRepaired,
    /// The job was stale with missing pages; render tasks were reissued.
    RenderRepaired { pages: Vec<i32> },
    /// Repair was attempted but a backend call failed. Logged, not raised.
    Errored,
}

pub struct Reconciler {
    stale_after: Duration,
    cooldown: Duration,
    merge_heals: DashMap<Uuid, Instant>,
    render_heals: DashMap<Uuid, Instant>,
}

impl Reconciler {
    pub fn new(stale_after: Duration, cooldown: Duration) -> Self {
        Self {
            stale_after,
            cooldown,
            merge_heals: DashMap::new(),
            render_heals: DashMap::new(),
        }
    }

    /// Inspect one job and repair whatever drift is visible. Errors from the
    /// backends are logged and reported as [`HealOutcome::Errored`]; healing
    /// rides on read paths and must never fail them.
    pub async fn heal(&self, ctx: &WorkerContext, job_id: Uuid) -> HealOutcome {
        match self.try_heal(ctx, job_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    target = "application::pipeline::Reconciler",
                    job_id = %job_id,
                    error = %err,
                    "reconciliation pass failed"
                );
                HealOutcome::Errored
            }
        }
    }

    async fn try_heal(
        &self,
        ctx: &WorkerContext,
        job_id: Uuid,
    ) -> Result<HealOutcome, PipelineError> {
        let Some(job) = ctx.jobs.find_job(job_id).await? else {
            return Ok(HealOutcome::NotFound);
        };

        if job.output_document_id.is_some() || job.stage == JobStage::Completed {
            return Ok(HealOutcome::Converged);
        }

        // Case one: every page artifact exists but no document ever landed.
        // The merge trigger was lost somewhere between stages.
        if job.all_pages_rendered() {
            if self.on_cooldown(&self.merge_heals, job_id) {
                return Ok(HealOutcome::Cooldown);
            }

            ctx.jobs.dedupe_page_artifacts(job_id).await?;
            ctx.jobs
                .reset_job_stage(job_id, JobStage::Merging, JobStatus::Processing)
                .await?;
            let spec = TaskSpec::new(
                QueueName::MergeDocument,
                merge_task_id(job_id),
                &MergeDocumentTask { job_id },
                MERGE_TASK_MAX_ATTEMPTS,
            )?;
            if !reissue(ctx, spec).await? {
                debug!(
                    target = "application::pipeline::Reconciler",
                    job_id = %job_id,
                    "merge task still leased by a live worker, leaving it alone"
                );
                return Ok(HealOutcome::Converged);
            }
            self.merge_heals.insert(job_id, Instant::now());

            metrics::counter!("pressroom_reconciler_merge_repairs_total").increment(1);
            info!(
                target = "application::pipeline::Reconciler",
                job_id = %job_id,
                "all pages rendered but no document, merge reissued"
            );
            return Ok(HealOutcome::MergeRepaired);
        }

        // Case two: pages are missing. Only act once the job has sat
        // unmodified past the staleness threshold; anything younger is
        // presumed to still be in flight.
        let age = OffsetDateTime::now_utc() - job.updated_at;
        if age < self.stale_after {
            debug!(
                target = "application::pipeline::Reconciler",
                job_id = %job_id,
                age_secs = age.whole_seconds(),
                "job recently updated, leaving it alone"
            );
            return Ok(HealOutcome::Converged);
        }

        let missing = job.missing_page_indices();
        if missing.is_empty() {
            return Ok(HealOutcome::Converged);
        }

        if self.on_cooldown(&self.render_heals, job_id) {
            return Ok(HealOutcome::Cooldown);
        }

        // A failed job comes back to life: missing pages are retryable.
        if job.status == JobStatus::Failed || job.stage == JobStage::Failed {
            ctx.jobs
                .reset_job_stage(job_id, JobStage::Rendering, JobStatus::Processing)
                .await?;
        }

        let mut reissued = Vec::new();
        for &page_index in &missing {
            let spec = TaskSpec::new(
                QueueName::RenderPage,
                render_task_id(job_id, page_index),
                &RenderPageTask { job_id, page_index },
                RENDER_TASK_MAX_ATTEMPTS,
            )?;
            if reissue(ctx, spec).await? {
                reissued.push(page_index);
            }
        }
        if reissued.is_empty() {
            debug!(
                target = "application::pipeline::Reconciler",
                job_id = %job_id,
                missing = missing.len(),
                "missing pages still leased by live workers, leaving them alone"
            );
            return Ok(HealOutcome::Converged);
        }
        self.render_heals.insert(job_id, Instant::now());

        metrics::counter!("pressroom_reconciler_render_repairs_total").increment(1);
        info!(
            target = "application::pipeline::Reconciler",
            job_id = %job_id,
            reissued = reissued.len(),
            age_secs = age.whole_seconds(),
            "stale job revived, render tasks reissued"
        );
        Ok(HealOutcome::RenderRepaired { pages: reissued })
    }

    fn on_cooldown(&self, heals: &DashMap<Uuid, Instant>, job_id: Uuid) -> bool {
        heals
            .get(&job_id)
            .map(|healed_at| healed_at.elapsed() < self.cooldown)
            .unwrap_or(false)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER, DEFAULT_COOLDOWN)
    }
}

/// Put a task back in front of a worker. A missing identity is enqueued
/// fresh; a parked or lease-expired duplicate is flipped back to `pending` in
/// place so it keeps its identity. Returns whether the task ends up runnable;
/// a duplicate still leased by a live worker stays untouched and reads false.
async fn reissue(ctx: &WorkerContext, spec: TaskSpec) -> Result<bool, PipelineError> {
    let task_id = spec.task_id.clone();
    match ctx.queue.enqueue(spec).await? {
        EnqueueOutcome::Enqueued => Ok(true),
        EnqueueOutcome::Duplicate => {
            let Some(snapshot) = ctx.queue.find_task(&task_id).await? else {
                // Completed between the enqueue and the lookup.
                return Ok(false);
            };
            match snapshot.state {
                TaskState::Pending => Ok(true),
                TaskState::Failed | TaskState::Active => {
                    let retried = ctx.queue.retry(&task_id).await?;
                    debug!(
                        target = "application::pipeline::Reconciler",
                        task_id = %task_id,
                        state = snapshot.state.as_str(),
                        retried,
                        "duplicate task flipped back to pending in place"
                    );
                    Ok(retried)
                }
            }
        }
    }
}
