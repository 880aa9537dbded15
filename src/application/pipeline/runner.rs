//! Worker pools draining the two queues.
//!
//! Rendering is parallel, merging is serialized: a single merge consumer
//! removes intra-process races from the finalization path entirely, leaving
//! the conditional stage claims to cover multi-instance deployments.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::pipeline::{
    WorkerContext, merge_worker, render_worker,
};
use crate::application::queue::{MergeDocumentTask, RenderPageTask};
use crate::domain::types::QueueName;

pub const DEFAULT_RENDER_CONCURRENCY: usize = 4;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub render_concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            render_concurrency: DEFAULT_RENDER_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct PipelineRunner;

impl PipelineRunner {
    /// Spawn the render pool and the single merge consumer. The returned
    /// handle stops all consumers on [`RunnerHandle::shutdown`]; in-flight
    /// tasks finish first.
    pub fn spawn(ctx: WorkerContext, config: RunnerConfig) -> RunnerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(config.render_concurrency + 1);

        for worker in 0..config.render_concurrency.max(1) {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let poll_interval = config.poll_interval;
            handles.push(tokio::spawn(async move {
                consume_loop(ctx, QueueName::RenderPage, worker, shutdown_rx, poll_interval)
                    .await;
            }));
        }

        let merge_ctx = ctx.clone();
        let merge_shutdown = shutdown_rx.clone();
        let poll_interval = config.poll_interval;
        handles.push(tokio::spawn(async move {
            consume_loop(merge_ctx, QueueName::MergeDocument, 0, merge_shutdown, poll_interval)
                .await;
        }));

        info!(
            target = "application::pipeline::PipelineRunner",
            render_workers = config.render_concurrency.max(1),
            merge_workers = 1usize,
            "pipeline consumers started"
        );

        RunnerHandle {
            shutdown: shutdown_tx,
            handles,
        }
    }
}

pub struct RunnerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!(
            target = "application::pipeline::PipelineRunner",
            "pipeline consumers stopped"
        );
    }
}

async fn consume_loop(
    ctx: WorkerContext,
    queue: QueueName,
    worker: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match ctx.queue.dequeue(queue).await {
            Ok(Some(task)) => {
                dispatch(&ctx, queue, task.task_id, task.payload).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "application::pipeline::PipelineRunner",
                    queue = queue.as_str(),
                    worker,
                    error = %err,
                    "dequeue failed"
                );
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

async fn dispatch(
    ctx: &WorkerContext,
    queue: QueueName,
    task_id: String,
    payload: serde_json::Value,
) {
    let result = match queue {
        QueueName::RenderPage => match serde_json::from_value::<RenderPageTask>(payload) {
            Ok(task) => render_worker::process_render_page_task(ctx, task)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("undecodable render payload: {err}")),
        },
        QueueName::MergeDocument => match serde_json::from_value::<MergeDocumentTask>(payload) {
            Ok(task) => merge_worker::process_merge_task(ctx, task)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("undecodable merge payload: {err}")),
        },
    };

    let ack = match &result {
        Ok(()) => ctx.queue.complete(&task_id).await,
        Err(reason) => {
            warn!(
                target = "application::pipeline::PipelineRunner",
                queue = queue.as_str(),
                task_id = %task_id,
                error = %reason,
                "task attempt failed"
            );
            metrics::counter!("pressroom_task_failures_total").increment(1);
            ctx.queue.fail(&task_id, reason).await
        }
    };

    if let Err(err) = ack {
        warn!(
            target = "application::pipeline::PipelineRunner",
            queue = queue.as_str(),
            task_id = %task_id,
            error = %err,
            "task acknowledgement failed"
        );
    }
}
