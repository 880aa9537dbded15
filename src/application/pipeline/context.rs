use std::sync::Arc;

use crate::application::{
    blobs::BlobStore,
    queue::TaskQueue,
    render::PageRenderer,
    repos::{AccessGrantsRepo, DocumentsRepo, JobsRepo},
};

/// Shared context passed to pipeline workers so they can reach persistence,
/// the queue, blob storage and the renderer.
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: Arc<dyn JobsRepo>,
    pub documents: Arc<dyn DocumentsRepo>,
    pub access_grants: Arc<dyn AccessGrantsRepo>,
    pub queue: Arc<dyn TaskQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub renderer: Arc<PageRenderer>,
}
