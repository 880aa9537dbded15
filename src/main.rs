use std::{process, sync::Arc};

use pressroom::{
    application::{
        engine::EnginePool,
        error::AppError,
        pipeline::{PipelineRunner, Reconciler, RunnerConfig, WorkerContext},
        render::{HttpImageFetcher, ImageResolver, PageRenderer},
    },
    config,
    infra::{
        chromium::{ChromiumEngine, ChromiumOptions},
        db::PostgresRepositories,
        error::InfraError,
        fs_blobs::FsBlobStore,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Run(Box::<config::RunArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Run(_) => run_pipeline(settings).await,
        config::Command::Heal(args) => run_heal(settings, args).await,
    }
}

async fn run_pipeline(settings: config::Settings) -> Result<(), AppError> {
    let ctx = build_worker_context(&settings).await?;

    let handle = PipelineRunner::spawn(
        ctx,
        RunnerConfig {
            render_concurrency: settings.pipeline.render_concurrency.get() as usize,
            poll_interval: settings.pipeline.poll_interval,
        },
    );

    info!(target = "pressroom::main", "pipeline running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(InfraError::Io)
        .map_err(AppError::from)?;

    info!(target = "pressroom::main", "shutdown requested");
    handle.shutdown().await;
    Ok(())
}

async fn run_heal(settings: config::Settings, args: config::HealArgs) -> Result<(), AppError> {
    let ctx = build_worker_context(&settings).await?;
    let reconciler = Reconciler::new(
        settings.pipeline.stale_after,
        settings.pipeline.heal_cooldown,
    );

    let outcome = reconciler.heal(&ctx, args.job_id).await;
    info!(
        target = "pressroom::main",
        job_id = %args.job_id,
        outcome = ?outcome,
        "reconciliation pass finished"
    );
    Ok(())
}

async fn build_worker_context(settings: &config::Settings) -> Result<WorkerContext, AppError> {
    let url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| AppError::validation("database.url must be configured"))?;

    let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    let repositories = Arc::new(PostgresRepositories::new(pool));

    let blobs = Arc::new(
        FsBlobStore::new(settings.blobs.directory.clone()).map_err(InfraError::Io)?,
    );

    let engine = Arc::new(ChromiumEngine::new(ChromiumOptions {
        binary_path: settings.engine.browser_path.clone(),
        sandbox: settings.engine.sandbox,
        ..ChromiumOptions::default()
    }));
    let engine_pool = Arc::new(EnginePool::with_timeouts(
        engine,
        settings.engine.load_timeout,
        settings.engine.export_timeout,
    ));
    let resolver = ImageResolver::new(
        Box::new(HttpImageFetcher::new()),
        settings.engine.ipfs_gateway.clone(),
    );
    let renderer = Arc::new(PageRenderer::new(engine_pool, resolver));

    Ok(WorkerContext {
        jobs: repositories.clone(),
        documents: repositories.clone(),
        access_grants: repositories.clone(),
        queue: repositories.clone(),
        blobs,
        renderer,
    })
}
