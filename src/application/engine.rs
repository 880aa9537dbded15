//! Rendering engine seam and the pool that owns the singleton instance.
//!
//! Launching a headless engine is the expensive operation in the pipeline, so
//! one instance is shared by every render worker. The pool launches it lazily
//! behind an async mutex: concurrent acquirers during a (re)launch all await
//! the same in-flight attempt instead of racing duplicate launches. A handle
//! that reports itself disconnected is replaced before any context is handed
//! out, and an acquisition that still fails with a connection-closed class of
//! error resets the cached handle and retries exactly once.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Load,
    Export,
}

impl std::fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderPhase::Load => f.write_str("content load"),
            RenderPhase::Export => f.write_str("page export"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render {phase} timed out after {timeout:?}")]
    Timeout {
        phase: RenderPhase,
        timeout: Duration,
    },
    #[error("rendering produced an empty document")]
    EmptyOutput,
    #[error("rendering engine disconnected: {0}")]
    EngineDisconnected(String),
    #[error("rendering engine failure: {0}")]
    Engine(String),
    #[error("image source `{url}` could not be resolved: {reason}")]
    ImageResolve { url: String, reason: String },
}

impl RenderError {
    pub fn engine(message: impl std::fmt::Display) -> Self {
        Self::Engine(message.to_string())
    }

    pub fn disconnected(message: impl std::fmt::Display) -> Self {
        Self::EngineDisconnected(message.to_string())
    }

    /// Connection-closed class of failure, recoverable by relaunching.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::EngineDisconnected(_))
    }
}

/// An isolated rendering context bound to a live engine instance. Physical
/// page size is controlled by mm directives inside the markup, never by the
/// context viewport.
#[async_trait]
pub trait RenderContext: Send {
    /// Load the markup and wait for the content to settle.
    async fn load(&mut self, html: &str) -> Result<(), RenderError>;

    /// Export the loaded content as page-sized PDF bytes.
    async fn export_pdf(&mut self) -> Result<Bytes, RenderError>;

    /// Release the context. Called on every exit path.
    async fn close(&mut self) -> Result<(), RenderError>;
}

/// A running engine instance.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError>;
}

/// Launchable engine: the opaque "headless browser" capability.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError>;
}

/// Owns the lazily-launched singleton engine handle and applies the per-phase
/// render timeouts.
pub struct EnginePool {
    engine: Arc<dyn RenderEngine>,
    handle: Mutex<Option<Arc<dyn EngineHandle>>>,
    load_timeout: Duration,
    export_timeout: Duration,
}

impl EnginePool {
    pub fn new(engine: Arc<dyn RenderEngine>) -> Self {
        Self::with_timeouts(engine, DEFAULT_LOAD_TIMEOUT, DEFAULT_EXPORT_TIMEOUT)
    }

    pub fn with_timeouts(
        engine: Arc<dyn RenderEngine>,
        load_timeout: Duration,
        export_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            handle: Mutex::new(None),
            load_timeout,
            export_timeout,
        }
    }

    /// Acquire an isolated context, relaunching the engine if the cached
    /// handle is dead. One transparent retry on a connection-closed failure.
    pub async fn acquire_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        match self.try_acquire().await {
            Ok(context) => Ok(context),
            Err(err) if err.is_disconnect() => {
                warn!(
                    target = "application::engine::EnginePool",
                    error = %err,
                    "engine connection lost during context acquisition; relaunching once"
                );
                self.reset().await;
                self.try_acquire().await
            }
            Err(err) => Err(err),
        }
    }

    async fn try_acquire(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        // Holding the slot lock across launch makes concurrent acquirers
        // await the same in-flight attempt.
        let handle = {
            let mut slot = self.handle.lock().await;
            match slot.as_ref() {
                Some(handle) if handle.is_connected().await => Arc::clone(handle),
                _ => {
                    info!(
                        target = "application::engine::EnginePool",
                        "launching rendering engine"
                    );
                    let handle = self.engine.launch().await?;
                    *slot = Some(Arc::clone(&handle));
                    handle
                }
            }
        };

        handle.new_context().await
    }

    /// Drop the cached handle so the next acquisition relaunches.
    pub async fn reset(&self) {
        let mut slot = self.handle.lock().await;
        *slot = None;
    }

    /// Render markup to PDF bytes inside a fresh context. The content-load and
    /// export phases race independent wall-clock timeouts; the context is
    /// closed on every exit path, with close failures logged and swallowed so
    /// they never mask the render outcome.
    pub async fn render(&self, html: &str) -> Result<Bytes, RenderError> {
        let mut context = self.acquire_context().await?;

        let result = async {
            timeout(self.load_timeout, context.load(html))
                .await
                .map_err(|_| RenderError::Timeout {
                    phase: RenderPhase::Load,
                    timeout: self.load_timeout,
                })??;

            timeout(self.export_timeout, context.export_pdf())
                .await
                .map_err(|_| RenderError::Timeout {
                    phase: RenderPhase::Export,
                    timeout: self.export_timeout,
                })?
        }
        .await;

        if let Err(err) = context.close().await {
            debug!(
                target = "application::engine::EnginePool",
                error = %err,
                "failed to close rendering context"
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedContext {
        bytes: Bytes,
        load_delay: Option<Duration>,
        fail_load_with_disconnect: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RenderContext for ScriptedContext {
        async fn load(&mut self, _html: &str) -> Result<(), RenderError> {
            if self.fail_load_with_disconnect {
                return Err(RenderError::disconnected("target closed"));
            }
            if let Some(delay) = self.load_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn export_pdf(&mut self) -> Result<Bytes, RenderError> {
            Ok(self.bytes.clone())
        }

        async fn close(&mut self) -> Result<(), RenderError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedHandle {
        connected: Arc<AtomicBool>,
        context_failures: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        load_delay: Option<Duration>,
    }

    #[async_trait]
    impl EngineHandle for ScriptedHandle {
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
            if self.context_failures.load(Ordering::SeqCst) > 0 {
                self.context_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(RenderError::disconnected("connection closed"));
            }
            Ok(Box::new(ScriptedContext {
                bytes: Bytes::from_static(b"%PDF-stub"),
                load_delay: self.load_delay,
                fail_load_with_disconnect: false,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    struct ScriptedEngine {
        launches: Arc<AtomicUsize>,
        launch_delay: Option<Duration>,
        connected: Arc<AtomicBool>,
        context_failures: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        load_delay: Option<Duration>,
    }

    impl ScriptedEngine {
        fn healthy() -> Self {
            Self {
                launches: Arc::new(AtomicUsize::new(0)),
                launch_delay: None,
                connected: Arc::new(AtomicBool::new(true)),
                context_failures: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
                load_delay: None,
            }
        }
    }

    #[async_trait]
    impl RenderEngine for ScriptedEngine {
        async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.launch_delay {
                tokio::time::sleep(delay).await;
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(Arc::new(ScriptedHandle {
                connected: Arc::clone(&self.connected),
                context_failures: Arc::clone(&self.context_failures),
                closed: Arc::clone(&self.closed),
                load_delay: self.load_delay,
            }))
        }
    }

    #[tokio::test]
    async fn concurrent_acquirers_share_one_launch() {
        let engine = ScriptedEngine {
            launch_delay: Some(Duration::from_millis(50)),
            ..ScriptedEngine::healthy()
        };
        let launches = Arc::clone(&engine.launches);
        let pool = Arc::new(EnginePool::new(Arc::new(engine)));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire_context().await.map(drop) })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("context acquired");
        }

        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_handle_is_relaunched_before_handing_out_contexts() {
        let engine = ScriptedEngine::healthy();
        let launches = Arc::clone(&engine.launches);
        let connected = Arc::clone(&engine.connected);
        let pool = EnginePool::new(Arc::new(engine));

        pool.acquire_context().await.expect("first context");
        connected.store(false, Ordering::SeqCst);
        pool.acquire_context().await.expect("context after crash");

        assert_eq!(launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connection_closed_acquisition_retries_exactly_once() {
        let engine = ScriptedEngine::healthy();
        engine.context_failures.store(1, Ordering::SeqCst);
        let launches = Arc::clone(&engine.launches);
        let pool = EnginePool::new(Arc::new(engine));

        pool.acquire_context().await.expect("retry succeeds");
        assert_eq!(launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn two_consecutive_disconnects_surface_the_error() {
        let engine = ScriptedEngine::healthy();
        engine.context_failures.store(2, Ordering::SeqCst);
        let pool = EnginePool::new(Arc::new(engine));

        let err = pool
            .acquire_context()
            .await
            .map(drop)
            .expect_err("retry exhausted");
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn slow_content_load_times_out_and_context_is_closed() {
        let engine = ScriptedEngine {
            load_delay: Some(Duration::from_secs(5)),
            ..ScriptedEngine::healthy()
        };
        let closed = Arc::clone(&engine.closed);
        let pool = EnginePool::with_timeouts(
            Arc::new(engine),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        let err = pool.render("<html></html>").await.expect_err("timeout");
        assert!(matches!(
            err,
            RenderError::Timeout {
                phase: RenderPhase::Load,
                ..
            }
        ));
        assert!(closed.load(Ordering::SeqCst), "context closed on error path");
    }

    #[tokio::test]
    async fn successful_render_closes_the_context() {
        let engine = ScriptedEngine::healthy();
        let closed = Arc::clone(&engine.closed);
        let pool = EnginePool::new(Arc::new(engine));

        let bytes = pool.render("<html></html>").await.expect("render");
        assert!(!bytes.is_empty());
        assert!(closed.load(Ordering::SeqCst));
    }
}
