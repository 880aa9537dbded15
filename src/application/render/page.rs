//! The page renderer: one layout descriptor in, one page of PDF bytes out.

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::application::engine::{EnginePool, RenderError};
use crate::application::render::{ImageResolver, html};
use crate::domain::layout::PageLayout;

pub struct PageRenderer {
    pool: Arc<EnginePool>,
    resolver: ImageResolver,
}

impl PageRenderer {
    pub fn new(pool: Arc<EnginePool>, resolver: ImageResolver) -> Self {
        Self { pool, resolver }
    }

    /// Render a single page layout to PDF bytes. A zero-length export is a
    /// hard failure even though the engine call itself succeeded.
    pub async fn render_page(&self, layout: &PageLayout) -> Result<Bytes, RenderError> {
        let started_at = std::time::Instant::now();

        let resolved = self.resolver.resolve(layout).await?;
        let markup = html::page_markup(layout, &resolved);
        let bytes = self.pool.render(&markup).await?;

        if bytes.is_empty() {
            return Err(RenderError::EmptyOutput);
        }

        metrics::histogram!("pressroom_render_ms")
            .record(started_at.elapsed().as_millis() as f64);
        info!(
            target = "application::render::PageRenderer",
            items = layout.items.len(),
            inlined_images = resolved.len(),
            bytes = bytes.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "page rendered"
        );

        Ok(bytes)
    }
}
