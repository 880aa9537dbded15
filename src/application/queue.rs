//! Task queue abstraction: at-least-once delivery with deterministic task
//! identities.
//!
//! The queue is the transport, not the source of truth; effectively-once side
//! effects come from the idempotent job transitions layered on top. The one
//! guarantee the pipeline leans on is identity dedup: enqueueing a task id
//! that already exists is a no-op reported as [`EnqueueOutcome::Duplicate`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    entities::{LeasedTask, TaskSnapshot},
    types::QueueName,
};

/// How long a dequeued task stays leased to its worker. A worker that crashes
/// without acknowledging leaves its task active; once the lease runs out the
/// task becomes eligible for dequeue and for an in-place retry again, so a
/// crash never burns a deterministic identity for good.
pub const TASK_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("task payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),
}

impl QueueError {
    pub fn backend(message: impl std::fmt::Display) -> Self {
        Self::Backend(message.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A task with the same identity already exists; treated as success by
    /// every caller.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub queue: QueueName,
    pub task_id: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

impl TaskSpec {
    pub fn new<P: serde::Serialize>(
        queue: QueueName,
        task_id: String,
        payload: &P,
        max_attempts: i32,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            queue,
            task_id,
            payload: serde_json::to_value(payload)?,
            max_attempts,
        })
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Insert a task unless its identity already exists.
    async fn enqueue(&self, spec: TaskSpec) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the oldest eligible task on the queue, marking it active for
    /// [`TASK_LEASE_TIMEOUT`] and counting the attempt. Eligible means pending
    /// or active with an expired lease, so delivery stays at-least-once
    /// across worker crashes.
    async fn dequeue(&self, queue: QueueName) -> Result<Option<LeasedTask>, QueueError>;

    /// Acknowledge success; completed tasks are removed so the identity can
    /// be reused by a later reconciliation epoch.
    async fn complete(&self, task_id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt. The task returns to pending until its attempt
    /// budget is exhausted, then parks as failed for the reconciler.
    async fn fail(&self, task_id: &str, error: &str) -> Result<(), QueueError>;

    async fn find_task(&self, task_id: &str) -> Result<Option<TaskSnapshot>, QueueError>;

    /// Flip a failed task, or an active task whose lease has expired, back to
    /// pending in place with a fresh attempt budget, preserving its identity.
    /// Returns whether such a task was found; a task still leased by a live
    /// worker is left untouched.
    async fn retry(&self, task_id: &str) -> Result<bool, QueueError>;
}

/// Payload of one per-page render task. The layout itself is read back from
/// the job record so re-deliveries and healed re-issues always observe the
/// authoritative input.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RenderPageTask {
    pub job_id: uuid::Uuid,
    pub page_index: i32,
}

/// Payload of the single merge task per job.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MergeDocumentTask {
    pub job_id: uuid::Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payloads_round_trip_as_json() {
        let task = RenderPageTask {
            job_id: uuid::Uuid::new_v4(),
            page_index: 7,
        };
        let spec = TaskSpec::new(QueueName::RenderPage, "t-1".into(), &task, 3)
            .expect("payload serializes");
        let decoded: RenderPageTask =
            serde_json::from_value(spec.payload).expect("payload deserializes");
        assert_eq!(decoded, task);
    }
}
