//! Filesystem-backed blob storage for page artifacts and merged documents.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::application::blobs::{BlobError, BlobHead, BlobStore, StoredBlob};

/// Blob store rooted at a local directory. Keys are relative paths of the form
/// `{prefix}/{yyyy}/{mm}/{dd}/{uuid}.{ext}`.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Initialise storage rooted at the provided directory, creating it if
    /// necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve a key to an absolute path, rejecting traversal outside the
    /// root.
    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(BlobError::InvalidKey);
        }

        Ok(self.root.join(relative))
    }

    fn build_key(&self, prefix: &str, content_type: &str) -> String {
        let (year, month, day) = time::OffsetDateTime::now_utc().to_calendar_date();
        let identifier = Uuid::new_v4();
        let extension = extension_for(content_type);
        format!(
            "{prefix}/{year}/{:02}/{:02}/{identifier}.{extension}",
            month as u8, day
        )
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "application/pdf" => "pdf",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "text/html" => "html",
        _ => "bin",
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        bytes: Bytes,
        content_type: &str,
        prefix: &str,
    ) -> Result<StoredBlob, BlobError> {
        if bytes.is_empty() {
            return Err(BlobError::EmptyPayload);
        }

        let key = self.build_key(prefix, content_type);
        let absolute = self.resolve(&key)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let size_bytes =
            i64::try_from(bytes.len()).map_err(|_| BlobError::SizeOverflow)?;
        let checksum = hex::encode(Sha256::digest(&bytes));

        fs::write(&absolute, &bytes).await?;

        Ok(StoredBlob {
            url: format!("file://{}", absolute.display()),
            key,
            size_bytes,
            checksum,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let absolute = self.resolve(key)?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn head(&self, key: &str) -> Result<BlobHead, BlobError> {
        let absolute = self.resolve(key)?;
        match fs::metadata(&absolute).await {
            Ok(metadata) => Ok(BlobHead {
                size_bytes: i64::try_from(metadata.len())
                    .map_err(|_| BlobError::SizeOverflow)?,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Local files have no expiring links; the ttl is accepted for interface
    /// parity and ignored.
    async fn download_url(&self, key: &str, _ttl: Duration) -> Result<String, BlobError> {
        let absolute = self.resolve(key)?;
        self.head(key).await?;
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_reads_back_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf()).expect("store");

        let stored = store
            .put(Bytes::from_static(b"%PDF-page"), "application/pdf", "pages")
            .await
            .expect("stored");
        assert!(stored.key.starts_with("pages/"));
        assert!(stored.key.ends_with(".pdf"));
        assert_eq!(stored.size_bytes, 9);
        assert_eq!(stored.checksum.len(), 64);

        let read = store.get(&stored.key).await.expect("read back");
        assert_eq!(read, Bytes::from_static(b"%PDF-page"));
        assert_eq!(store.head(&stored.key).await.expect("head").size_bytes, 9);

        let url = store
            .download_url(&stored.key, Duration::from_secs(60))
            .await
            .expect("url");
        assert!(url.starts_with("file://"));
    }

    #[tokio::test]
    async fn empty_payloads_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf()).expect("store");

        let result = store.put(Bytes::new(), "application/pdf", "pages").await;
        assert!(matches!(result, Err(BlobError::EmptyPayload)));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf()).expect("store");

        assert!(matches!(
            store.get("../outside").await,
            Err(BlobError::InvalidKey)
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(BlobError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn missing_keys_report_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf()).expect("store");

        let result = store.get("pages/2026/01/01/missing.pdf").await;
        assert!(matches!(result, Err(BlobError::NotFound { .. })));
    }
}
