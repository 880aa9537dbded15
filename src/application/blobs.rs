//! Blob store abstraction for page artifacts and merged documents.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid storage key")]
    InvalidKey,
    #[error("blob not found: {key}")]
    NotFound { key: String },
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload size exceeds supported range")]
    SizeOverflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("blob backend error: {0}")]
    Backend(String),
}

/// Result of storing a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub url: String,
    pub size_bytes: i64,
    pub checksum: String,
}

/// Metadata returned by a head lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHead {
    pub size_bytes: i64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the payload under a fresh key beneath `prefix`. Empty payloads
    /// are rejected; a zero-length artifact is never representable.
    async fn put(
        &self,
        bytes: Bytes,
        content_type: &str,
        prefix: &str,
    ) -> Result<StoredBlob, BlobError>;

    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    async fn head(&self, key: &str) -> Result<BlobHead, BlobError>;

    /// Produce a short-lived download URL for the stored payload.
    async fn download_url(&self, key: &str, ttl: Duration) -> Result<String, BlobError>;
}
