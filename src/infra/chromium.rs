//! Chromium-backed rendering engine.
//!
//! The `headless_chrome` client is synchronous, so every protocol interaction
//! hops onto the blocking thread pool. Markup is delivered through a base64
//! `data:` URL and exported with `prefer_css_page_size`, so the `@page` rule
//! in the markup dictates the physical dimensions of the output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::info;

use crate::application::engine::{EngineHandle, RenderContext, RenderEngine, RenderError};

#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    /// Explicit browser binary; `None` lets the client discover one.
    pub binary_path: Option<PathBuf>,
    pub sandbox: bool,
    /// How long the browser may sit idle before the client tears it down.
    pub idle_timeout: Duration,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            binary_path: None,
            sandbox: true,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub struct ChromiumEngine {
    options: ChromiumOptions,
}

impl ChromiumEngine {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError> {
        let options = self.options.clone();
        let browser = tokio::task::spawn_blocking(move || {
            let launch = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(options.sandbox)
                .path(options.binary_path)
                .idle_browser_timeout(options.idle_timeout)
                .build()
                .map_err(RenderError::engine)?;
            Browser::new(launch).map_err(classify)
        })
        .await
        .map_err(RenderError::engine)??;

        info!(
            target = "infra::chromium::ChromiumEngine",
            "browser launched"
        );
        Ok(Arc::new(ChromiumHandle {
            browser: Arc::new(browser),
        }))
    }
}

struct ChromiumHandle {
    browser: Arc<Browser>,
}

#[async_trait]
impl EngineHandle for ChromiumHandle {
    async fn is_connected(&self) -> bool {
        let browser = Arc::clone(&self.browser);
        tokio::task::spawn_blocking(move || browser.get_version().is_ok())
            .await
            .unwrap_or(false)
    }

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        let browser = Arc::clone(&self.browser);
        let tab = tokio::task::spawn_blocking(move || browser.new_tab().map_err(classify))
            .await
            .map_err(RenderError::engine)??;
        Ok(Box::new(ChromiumContext { tab }))
    }
}

struct ChromiumContext {
    tab: Arc<Tab>,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn load(&mut self, html: &str) -> Result<(), RenderError> {
        let tab = Arc::clone(&self.tab);
        let url = format!("data:text/html;base64,{}", BASE64.encode(html));
        tokio::task::spawn_blocking(move || {
            tab.navigate_to(&url).map_err(classify)?;
            tab.wait_until_navigated().map_err(classify)?;
            Ok(())
        })
        .await
        .map_err(RenderError::engine)?
    }

    async fn export_pdf(&mut self) -> Result<Bytes, RenderError> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || {
            let options = PrintToPdfOptions {
                print_background: Some(true),
                prefer_css_page_size: Some(true),
                margin_top: Some(0.0),
                margin_bottom: Some(0.0),
                margin_left: Some(0.0),
                margin_right: Some(0.0),
                ..Default::default()
            };
            tab.print_to_pdf(Some(options))
                .map(Bytes::from)
                .map_err(classify)
        })
        .await
        .map_err(RenderError::engine)?
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || {
            tab.close(false).map(|_| ()).map_err(classify)
        })
        .await
        .map_err(RenderError::engine)?
    }
}

/// Split protocol failures into the relaunchable connection-closed class and
/// everything else.
fn classify(err: anyhow::Error) -> RenderError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("connection")
        || lowered.contains("websocket")
        || lowered.contains("channel")
        || lowered.contains("target closed")
    {
        RenderError::disconnected(message)
    } else {
        RenderError::engine(message)
    }
}
