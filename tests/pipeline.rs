//! End-to-end pipeline tests over the in-memory backends: real task payloads,
//! real state transitions, real PDFs out of the stub engine.

use std::sync::Arc;
use std::time::Duration;

use pressroom::application::blobs::BlobStore;
use pressroom::application::engine::{EnginePool, RenderEngine};
use pressroom::application::pipeline::{
    HealOutcome, Reconciler, WorkerContext, job_status, process_merge_task,
    process_render_page_task, submit_job,
};
use pressroom::application::queue::{
    EnqueueOutcome, MergeDocumentTask, RenderPageTask, TaskSpec,
};
use pressroom::application::render::{HttpImageFetcher, ImageResolver, PageRenderer};
use pressroom::application::repos::NewJobParams;
use pressroom::domain::entities::{JobRecord, PageArtifact};
use pressroom::domain::layout::{LayoutItem, PageLayout, TextItem};
use pressroom::domain::types::{
    JobStage, JobStatus, QueueName, TaskState, merge_task_id, render_task_id,
};
use pressroom::infra::memory::{
    MemoryBlobStore, MemoryQueue, MemoryRepos, StubEngine, page_labels,
};
use time::OffsetDateTime;

struct Harness {
    ctx: WorkerContext,
    repos: Arc<MemoryRepos>,
    queue: Arc<MemoryQueue>,
    blobs: Arc<MemoryBlobStore>,
    engine: Arc<StubEngine>,
}

fn harness() -> Harness {
    let repos = MemoryRepos::new();
    let queue = MemoryQueue::new();
    let blobs = MemoryBlobStore::new();
    let engine = StubEngine::new();

    let pool = Arc::new(EnginePool::new(
        Arc::clone(&engine) as Arc<dyn RenderEngine>
    ));
    let resolver = ImageResolver::new(Box::new(HttpImageFetcher::new()), "https://ipfs.io");
    let renderer = Arc::new(PageRenderer::new(pool, resolver));

    let ctx = WorkerContext {
        jobs: repos.clone(),
        documents: repos.clone(),
        access_grants: repos.clone(),
        queue: queue.clone(),
        blobs: blobs.clone(),
        renderer,
    };

    Harness {
        ctx,
        repos,
        queue,
        blobs,
        engine,
    }
}

fn text_page(content: &str) -> PageLayout {
    PageLayout {
        width_mm: 210.0,
        height_mm: 297.0,
        items: vec![LayoutItem::Text(TextItem {
            content: content.to_string(),
            font_size_mm: 5.0,
            x_mm: 10.0,
            y_mm: 10.0,
            letter: None,
        })],
    }
}

fn job_params(pages: usize, quota: Option<f64>) -> NewJobParams {
    NewJobParams {
        user_id: "user-42".to_string(),
        email: Some("user@example.test".to_string()),
        assigned_quota: quota,
        layout_pages: (0..pages).map(|i| text_page(&format!("page-{i}"))).collect(),
    }
}

/// Drain one queue, acknowledging like the runner does.
async fn drain(harness: &Harness, queue: QueueName) {
    while let Some(task) = harness.ctx.queue.dequeue(queue).await.expect("dequeue") {
        let result = match queue {
            QueueName::RenderPage => {
                let payload: RenderPageTask =
                    serde_json::from_value(task.payload).expect("render payload");
                process_render_page_task(&harness.ctx, payload)
                    .await
                    .map_err(|err| err.to_string())
            }
            QueueName::MergeDocument => {
                let payload: MergeDocumentTask =
                    serde_json::from_value(task.payload).expect("merge payload");
                process_merge_task(&harness.ctx, payload)
                    .await
                    .map_err(|err| err.to_string())
            }
        };
        match result {
            Ok(()) => harness
                .ctx
                .queue
                .complete(&task.task_id)
                .await
                .expect("complete"),
            Err(reason) => harness
                .ctx
                .queue
                .fail(&task.task_id, &reason)
                .await
                .expect("fail"),
        }
    }
}

async fn run_to_completion(harness: &Harness, job: &JobRecord) -> JobRecord {
    drain(harness, QueueName::RenderPage).await;
    drain(harness, QueueName::MergeDocument).await;
    harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("job exists")
}

#[tokio::test]
async fn full_pipeline_produces_one_ordered_document() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(3, Some(5.0)))
        .await
        .expect("submitted");

    assert_eq!(harness.queue.pending_count(QueueName::RenderPage), 3);
    assert_eq!(job.stage, JobStage::Pending);

    let finished = run_to_completion(&harness, &job).await;
    assert_eq!(finished.stage, JobStage::Completed);
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.completed_pages, 3);
    assert_eq!(harness.engine.launch_count(), 1, "one shared engine launch");
    let document_id = finished.output_document_id.expect("document linked");

    let document = harness
        .ctx
        .documents
        .find_document(document_id)
        .await
        .expect("lookup")
        .expect("document exists");
    assert_eq!(document.total_prints, 5);

    // Merged output has the pages in index order.
    let merged = harness
        .blobs
        .get(&document.storage_key)
        .await
        .expect("merged bytes");
    let labels = page_labels(&merged).expect("labels");
    assert_eq!(labels.len(), 3);
    for (index, label) in labels.iter().enumerate() {
        assert!(
            label.contains(&format!("page-{index}")),
            "page {index} out of order: {label}"
        );
    }

    // Finalization granted the requesting user access to the document.
    let grant = harness
        .ctx
        .access_grants
        .find_access_grant("user-42", document_id)
        .await
        .expect("lookup")
        .expect("grant exists");
    assert_eq!(grant.prints_allowed, 5);
    assert_eq!(grant.prints_used, 0);
    assert_eq!(grant.session_token.len(), 64);
}

#[tokio::test]
async fn undefined_quota_collapses_to_zero_prints() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(1, None))
        .await
        .expect("submitted");

    let finished = run_to_completion(&harness, &job).await;
    let document = harness
        .ctx
        .documents
        .find_document(finished.output_document_id.expect("document"))
        .await
        .expect("lookup")
        .expect("document exists");
    assert_eq!(document.total_prints, 0);
}

#[tokio::test]
async fn duplicate_submission_of_tasks_is_deduplicated() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(2, None))
        .await
        .expect("submitted");

    // A second fan-out of the same job enqueues nothing: the deterministic
    // task identities already exist.
    for page_index in 0..job.total_pages {
        let spec = TaskSpec::new(
            QueueName::RenderPage,
            render_task_id(job.id, page_index),
            &RenderPageTask {
                job_id: job.id,
                page_index,
            },
            3,
        )
        .expect("spec");
        let outcome = harness.ctx.queue.enqueue(spec).await.expect("enqueue");
        assert_eq!(outcome, EnqueueOutcome::Duplicate);
    }
    assert_eq!(harness.queue.pending_count(QueueName::RenderPage), 2);
}

#[tokio::test]
async fn redelivered_render_task_after_completion_is_a_noop() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(2, None))
        .await
        .expect("submitted");
    let finished = run_to_completion(&harness, &job).await;
    assert_eq!(finished.completed_pages, 2);

    // Replay page 0 as a queue redelivery would.
    process_render_page_task(
        &harness.ctx,
        RenderPageTask {
            job_id: job.id,
            page_index: 0,
        },
    )
    .await
    .expect("redelivery succeeds");

    let after = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(after.completed_pages, 2, "no artifact was appended");
    assert_eq!(after.output_document_id, finished.output_document_id);
}

#[tokio::test]
async fn redelivered_merge_task_never_creates_a_second_document() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(2, None))
        .await
        .expect("submitted");
    let finished = run_to_completion(&harness, &job).await;
    let first_document = finished.output_document_id.expect("document");

    process_merge_task(&harness.ctx, MergeDocumentTask { job_id: job.id })
        .await
        .expect("redelivery succeeds");

    let after = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(after.output_document_id, Some(first_document));
}

#[tokio::test]
async fn concurrent_page_completions_keep_the_counter_exact() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(8, None))
        .await
        .expect("submitted");

    let mut recorders = Vec::new();
    for page_index in 0..8 {
        let jobs = Arc::clone(&harness.ctx.jobs);
        let job_id = job.id;
        recorders.push(tokio::spawn(async move {
            jobs.record_page_artifact(
                job_id,
                PageArtifact {
                    page_index,
                    storage_key: format!("pages/{page_index}"),
                },
            )
            .await
        }));
    }
    for recorder in recorders {
        recorder.await.expect("join").expect("recorded");
    }

    let after = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(after.completed_pages, 8);
    assert_eq!(after.covered_page_indices().len(), 8);
}

#[tokio::test]
async fn racing_threshold_observers_claim_exactly_one_merge() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(2, None))
        .await
        .expect("submitted");

    let mut claims = Vec::new();
    for _ in 0..8 {
        let jobs = Arc::clone(&harness.ctx.jobs);
        let job_id = job.id;
        claims.push(tokio::spawn(
            async move { jobs.claim_merge_trigger(job_id).await },
        ));
    }
    let mut granted = 0;
    for claim in claims {
        if claim.await.expect("join").expect("claim") {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn empty_engine_output_fails_the_render_without_an_artifact() {
    let harness = harness();
    harness.engine.emit_empty_renders(10);

    let job = submit_job(&harness.ctx, job_params(1, None))
        .await
        .expect("submitted");
    drain(&harness, QueueName::RenderPage).await;

    let failed = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.completed_pages, 0, "no empty artifact was recorded");
    assert!(
        failed
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("empty")
    );
}

#[tokio::test]
async fn failed_render_marks_the_job_and_parks_the_task() {
    let harness = harness();
    harness.engine.fail_next_renders(10);

    let job = submit_job(&harness.ctx, job_params(1, None))
        .await
        .expect("submitted");
    drain(&harness, QueueName::RenderPage).await;

    let failed = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.failure_reason.is_some());

    let snapshot = harness
        .ctx
        .queue
        .find_task(&render_task_id(job.id, 0))
        .await
        .expect("find task")
        .expect("task parked");
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempts, 3);
}

#[tokio::test]
async fn reconciler_reissues_a_lost_merge() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(2, Some(1.0)))
        .await
        .expect("submitted");
    drain(&harness, QueueName::RenderPage).await;

    // Simulate losing the merge task before any worker saw it.
    harness
        .ctx
        .queue
        .complete(&merge_task_id(job.id))
        .await
        .expect("drop merge task");
    assert_eq!(harness.queue.pending_count(QueueName::MergeDocument), 0);

    let reconciler = Reconciler::new(Duration::from_secs(30), Duration::from_secs(60));
    let outcome = reconciler.heal(&harness.ctx, job.id).await;
    assert_eq!(outcome, HealOutcome::MergeRepaired);
    assert_eq!(harness.queue.pending_count(QueueName::MergeDocument), 1);

    drain(&harness, QueueName::MergeDocument).await;
    let finished = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(finished.stage, JobStage::Completed);
    assert!(finished.output_document_id.is_some());
}

#[tokio::test]
async fn reconciler_revives_a_stale_failed_job() {
    let harness = harness();
    harness.engine.fail_next_renders(3);

    let job = submit_job(&harness.ctx, job_params(2, None))
        .await
        .expect("submitted");
    drain(&harness, QueueName::RenderPage).await;

    // One page exhausted its attempts and parked; the other rendered fine,
    // leaving the job stuck mid-render with a gap.
    let stuck = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert!(stuck.output_document_id.is_none());
    let missing = stuck.missing_page_indices();
    assert_eq!(missing.len(), 1);

    // Age the job past the staleness threshold, then heal.
    harness
        .repos
        .set_job_updated_at(job.id, OffsetDateTime::now_utc() - time::Duration::minutes(5));
    let reconciler = Reconciler::new(Duration::from_secs(30), Duration::from_secs(60));
    let outcome = reconciler.heal(&harness.ctx, job.id).await;
    assert_eq!(
        outcome,
        HealOutcome::RenderRepaired {
            pages: missing.clone()
        }
    );

    // The parked task was flipped back to pending in place and now succeeds.
    drain(&harness, QueueName::RenderPage).await;
    drain(&harness, QueueName::MergeDocument).await;
    let finished = harness
        .ctx
        .jobs
        .find_job(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(finished.stage, JobStage::Completed);
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
async fn a_task_abandoned_by_a_crashed_worker_is_reclaimed() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(1, None))
        .await
        .expect("submitted");

    // Lease the only render task and never acknowledge it, the way a worker
    // that crashed mid-render would.
    let leased = harness
        .ctx
        .queue
        .dequeue(QueueName::RenderPage)
        .await
        .expect("dequeue")
        .expect("task leased");
    assert_eq!(harness.queue.pending_count(QueueName::RenderPage), 0);

    // While the lease is live the reconciler must not report a repair it
    // cannot perform.
    harness.repos.set_job_updated_at(
        job.id,
        OffsetDateTime::now_utc() - time::Duration::minutes(10),
    );
    let reconciler = Reconciler::new(Duration::from_secs(30), Duration::from_secs(60));
    assert_eq!(
        reconciler.heal(&harness.ctx, job.id).await,
        HealOutcome::Converged
    );
    assert_eq!(harness.queue.pending_count(QueueName::RenderPage), 0);

    // Once the lease runs out the same pass flips the task back to pending
    // in place, keeping its identity, and the job can finish.
    harness.queue.expire_lease(&leased.task_id);
    assert_eq!(
        reconciler.heal(&harness.ctx, job.id).await,
        HealOutcome::RenderRepaired { pages: vec![0] }
    );
    let finished = run_to_completion(&harness, &job).await;
    assert_eq!(finished.stage, JobStage::Completed);
}

#[tokio::test]
async fn reconciler_backs_off_inside_the_cooldown_window() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(1, None))
        .await
        .expect("submitted");
    drain(&harness, QueueName::RenderPage).await;
    harness
        .ctx
        .queue
        .complete(&merge_task_id(job.id))
        .await
        .expect("drop merge task");

    let reconciler = Reconciler::new(Duration::from_secs(30), Duration::from_secs(60));
    assert_eq!(
        reconciler.heal(&harness.ctx, job.id).await,
        HealOutcome::MergeRepaired
    );
    // Drop the reissued task again; the second pass must stay quiet.
    harness
        .ctx
        .queue
        .complete(&merge_task_id(job.id))
        .await
        .expect("drop again");
    assert_eq!(
        reconciler.heal(&harness.ctx, job.id).await,
        HealOutcome::Cooldown
    );
    assert_eq!(harness.queue.pending_count(QueueName::MergeDocument), 0);
}

#[tokio::test]
async fn healthy_and_finished_jobs_are_left_alone() {
    let harness = harness();
    let reconciler = Reconciler::new(Duration::from_secs(30), Duration::from_secs(60));

    let job = submit_job(&harness.ctx, job_params(2, None))
        .await
        .expect("submitted");
    // Freshly submitted, nothing rendered yet: still presumed in flight.
    assert_eq!(
        reconciler.heal(&harness.ctx, job.id).await,
        HealOutcome::Converged
    );

    let finished = run_to_completion(&harness, &job).await;
    assert!(finished.output_document_id.is_some());
    assert_eq!(
        reconciler.heal(&harness.ctx, job.id).await,
        HealOutcome::Converged
    );

    assert_eq!(
        reconciler.heal(&harness.ctx, uuid::Uuid::new_v4()).await,
        HealOutcome::NotFound
    );
}

#[tokio::test]
async fn status_reads_repair_a_lost_merge_on_the_way_out() {
    let harness = harness();
    let job = submit_job(&harness.ctx, job_params(1, None))
        .await
        .expect("submitted");
    drain(&harness, QueueName::RenderPage).await;
    harness
        .ctx
        .queue
        .complete(&merge_task_id(job.id))
        .await
        .expect("drop merge task");

    let reconciler = Reconciler::new(Duration::from_secs(30), Duration::from_secs(60));
    let polled = job_status(&harness.ctx, &reconciler, job.id)
        .await
        .expect("status read")
        .expect("exists");
    assert_eq!(polled.stage, JobStage::Merging);
    assert_eq!(harness.queue.pending_count(QueueName::MergeDocument), 1);

    drain(&harness, QueueName::MergeDocument).await;
    let finished = job_status(&harness.ctx, &reconciler, job.id)
        .await
        .expect("status read")
        .expect("exists");
    assert_eq!(finished.stage, JobStage::Completed);
}

#[tokio::test]
async fn empty_job_submissions_are_rejected() {
    let harness = harness();
    let err = submit_job(&harness.ctx, job_params(0, None))
        .await
        .expect_err("rejected");
    assert!(err.to_string().contains("at least one page"));
}
