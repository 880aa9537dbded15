//! Resolution of content-addressed image references to inline data.
//!
//! Engines cannot fetch `ipfs://` sources themselves, so the resolver inlines
//! them as data URIs before markup generation. Resolution is memoized per
//! invocation: a source referenced by several items on the same page is
//! fetched once. Pages without content-addressed sources skip resolution
//! entirely.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use tracing::debug;

use crate::application::engine::RenderError;
use crate::domain::layout::{LayoutItem, PageLayout};

pub const IPFS_SCHEME: &str = "ipfs://";

const DEFAULT_IMAGE_CONTENT_TYPE: &str = "image/png";

/// Fetch seam so resolution can be exercised without a network.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the bytes behind a gateway URL, returning the payload and the
    /// content type reported by the server, if any.
    async fn fetch(&self, url: &str) -> Result<(Bytes, Option<String>), RenderError>;
}

/// HTTP-backed fetcher used in production.
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<(Bytes, Option<String>), RenderError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| RenderError::ImageResolve {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(RenderError::ImageResolve {
                url: url.to_string(),
                reason: format!("gateway returned {}", response.status()),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|err| RenderError::ImageResolve {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        Ok((bytes, content_type))
    }
}

/// Resolves content-addressed image sources through a configured gateway.
pub struct ImageResolver {
    fetcher: Box<dyn ImageFetcher>,
    gateway_base: String,
}

impl ImageResolver {
    pub fn new(fetcher: Box<dyn ImageFetcher>, gateway_base: impl Into<String>) -> Self {
        let gateway_base = gateway_base.into();
        Self {
            gateway_base: gateway_base.trim_end_matches('/').to_string(),
            fetcher,
        }
    }

    /// Resolve every `ipfs://` source on the page into a data URI. Returns a
    /// source → data-URI map; an empty map means nothing needed resolving and
    /// no fetch was attempted.
    pub async fn resolve(
        &self,
        layout: &PageLayout,
    ) -> Result<HashMap<String, String>, RenderError> {
        let mut resolved: HashMap<String, String> = HashMap::new();

        for item in &layout.items {
            let LayoutItem::Image(image) = item else {
                continue;
            };
            let Some(cid) = image.source.strip_prefix(IPFS_SCHEME) else {
                continue;
            };
            if resolved.contains_key(&image.source) {
                continue;
            }

            let url = format!("{}/ipfs/{cid}", self.gateway_base);
            let (bytes, content_type) = self.fetcher.fetch(&url).await?;
            let content_type =
                content_type.unwrap_or_else(|| DEFAULT_IMAGE_CONTENT_TYPE.to_string());
            debug!(
                target = "application::render::ImageResolver",
                source = %image.source,
                bytes = bytes.len(),
                "inlined content-addressed image"
            );
            resolved.insert(
                image.source.clone(),
                format!("data:{content_type};base64,{}", BASE64.encode(&bytes)),
            );
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::layout::ImageItem;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ImageFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Result<(Bytes, Option<String>), RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                Bytes::from_static(b"imagebytes"),
                Some("image/jpeg".to_string()),
            ))
        }
    }

    fn layout_with_sources(sources: &[&str]) -> PageLayout {
        PageLayout {
            width_mm: 100.0,
            height_mm: 100.0,
            items: sources
                .iter()
                .map(|&source| {
                    LayoutItem::Image(ImageItem {
                        source: source.to_string(),
                        x_mm: 0.0,
                        y_mm: 0.0,
                        width_mm: 10.0,
                        height_mm: 10.0,
                    })
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn repeated_sources_are_fetched_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = ImageResolver::new(
            Box::new(CountingFetcher {
                calls: Arc::clone(&calls),
            }),
            "https://gateway.test",
        );
        let layout =
            layout_with_sources(&["ipfs://bafyone", "ipfs://bafyone", "ipfs://bafytwo"]);

        let resolved = resolver.resolve(&layout).await.expect("resolves");
        assert_eq!(resolved.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let uri = &resolved["ipfs://bafyone"];
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        assert_eq!(
            uri.trim_start_matches("data:image/jpeg;base64,"),
            BASE64.encode(b"imagebytes"),
        );
    }

    #[tokio::test]
    async fn pages_without_addressed_sources_skip_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = ImageResolver::new(
            Box::new(CountingFetcher {
                calls: Arc::clone(&calls),
            }),
            "https://gateway.test",
        );
        let layout = layout_with_sources(&["https://example.test/logo.png", "data:image/png;base64,AA=="]);

        let resolved = resolver.resolve(&layout).await.expect("resolves");
        assert!(resolved.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "fast path fetches nothing");
    }
}
