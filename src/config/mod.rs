//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pressroom";
const DEFAULT_BLOB_DIR: &str = "blobs";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_IPFS_GATEWAY: &str = "https://ipfs.io";
const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXPORT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RENDER_CONCURRENCY: u32 = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_STALE_AFTER_SECS: u64 = 30;
const DEFAULT_HEAL_COOLDOWN_SECS: u64 = 60;

/// Command-line arguments for the Pressroom binary.
#[derive(Debug, Parser)]
#[command(name = "pressroom", version, about = "Pressroom document pipeline")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PRESSROOM_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the pipeline workers.
    Run(Box<RunArgs>),
    /// Run one reconciliation pass over a single job.
    #[command(name = "heal")]
    Heal(HealArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct HealArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Job to inspect and repair.
    #[arg(value_name = "JOB_ID")]
    pub job_id: Uuid,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the blob storage directory.
    #[arg(long = "blobs-directory", value_name = "PATH")]
    pub blobs_directory: Option<PathBuf>,

    /// Override the browser binary path.
    #[arg(long = "engine-browser-path", value_name = "PATH")]
    pub engine_browser_path: Option<PathBuf>,

    /// Toggle the browser sandbox.
    #[arg(
        long = "engine-sandbox",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub engine_sandbox: Option<bool>,

    /// Override the gateway used to resolve content-addressed images.
    #[arg(long = "engine-ipfs-gateway", value_name = "URL")]
    pub engine_ipfs_gateway: Option<String>,

    /// Override the content-load timeout.
    #[arg(long = "engine-load-timeout-seconds", value_name = "SECONDS")]
    pub engine_load_timeout_seconds: Option<u64>,

    /// Override the PDF-export timeout.
    #[arg(long = "engine-export-timeout-seconds", value_name = "SECONDS")]
    pub engine_export_timeout_seconds: Option<u64>,

    /// Override the render worker concurrency.
    #[arg(long = "pipeline-render-concurrency", value_name = "COUNT")]
    pub pipeline_render_concurrency: Option<u32>,

    /// Override the queue poll interval.
    #[arg(long = "pipeline-poll-interval-ms", value_name = "MILLISECONDS")]
    pub pipeline_poll_interval_ms: Option<u64>,

    /// Override the job staleness threshold used by the reconciler.
    #[arg(long = "pipeline-stale-after-seconds", value_name = "SECONDS")]
    pub pipeline_stale_after_seconds: Option<u64>,

    /// Override the per-job reconciliation cooldown.
    #[arg(long = "pipeline-heal-cooldown-seconds", value_name = "SECONDS")]
    pub pipeline_heal_cooldown_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub blobs: BlobSettings,
    pub engine: EngineSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub browser_path: Option<PathBuf>,
    pub sandbox: bool,
    pub ipfs_gateway: String,
    pub load_timeout: Duration,
    pub export_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub render_concurrency: NonZeroU32,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub heal_cooldown: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse command-line arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PRESSROOM").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Run(args)) => raw.apply_run_overrides(&args.overrides),
        Some(Command::Heal(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_run_overrides(&RunOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    blobs: RawBlobSettings,
    engine: RawEngineSettings,
    pipeline: RawPipelineSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBlobSettings {
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    browser_path: Option<PathBuf>,
    sandbox: Option<bool>,
    ipfs_gateway: Option<String>,
    load_timeout_seconds: Option<u64>,
    export_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPipelineSettings {
    render_concurrency: Option<u32>,
    poll_interval_ms: Option<u64>,
    stale_after_seconds: Option<u64>,
    heal_cooldown_seconds: Option<u64>,
}

impl RawSettings {
    fn apply_run_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(directory) = overrides.blobs_directory.as_ref() {
            self.blobs.directory = Some(directory.clone());
        }
        if let Some(path) = overrides.engine_browser_path.as_ref() {
            self.engine.browser_path = Some(path.clone());
        }
        if let Some(sandbox) = overrides.engine_sandbox {
            self.engine.sandbox = Some(sandbox);
        }
        if let Some(gateway) = overrides.engine_ipfs_gateway.as_ref() {
            self.engine.ipfs_gateway = Some(gateway.clone());
        }
        if let Some(seconds) = overrides.engine_load_timeout_seconds {
            self.engine.load_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.engine_export_timeout_seconds {
            self.engine.export_timeout_seconds = Some(seconds);
        }
        if let Some(value) = overrides.pipeline_render_concurrency {
            self.pipeline.render_concurrency = Some(value);
        }
        if let Some(value) = overrides.pipeline_poll_interval_ms {
            self.pipeline.poll_interval_ms = Some(value);
        }
        if let Some(value) = overrides.pipeline_stale_after_seconds {
            self.pipeline.stale_after_seconds = Some(value);
        }
        if let Some(value) = overrides.pipeline_heal_cooldown_seconds {
            self.pipeline.heal_cooldown_seconds = Some(value);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            blobs,
            engine,
            pipeline,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            blobs: build_blob_settings(blobs),
            engine: build_engine_settings(engine)?,
            pipeline: build_pipeline_settings(pipeline)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max_value)
        .ok_or_else(|| LoadError::invalid("database.max_connections", "must be greater than zero"))?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_blob_settings(blobs: RawBlobSettings) -> BlobSettings {
    BlobSettings {
        directory: blobs
            .directory
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOB_DIR)),
    }
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let ipfs_gateway = engine
        .ipfs_gateway
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_IPFS_GATEWAY.to_string());

    let load_secs = engine
        .load_timeout_seconds
        .unwrap_or(DEFAULT_LOAD_TIMEOUT_SECS);
    if load_secs == 0 {
        return Err(LoadError::invalid(
            "engine.load_timeout_seconds",
            "must be greater than zero",
        ));
    }
    let export_secs = engine
        .export_timeout_seconds
        .unwrap_or(DEFAULT_EXPORT_TIMEOUT_SECS);
    if export_secs == 0 {
        return Err(LoadError::invalid(
            "engine.export_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(EngineSettings {
        browser_path: engine.browser_path,
        sandbox: engine.sandbox.unwrap_or(true),
        ipfs_gateway,
        load_timeout: Duration::from_secs(load_secs),
        export_timeout: Duration::from_secs(export_secs),
    })
}

fn build_pipeline_settings(pipeline: RawPipelineSettings) -> Result<PipelineSettings, LoadError> {
    let concurrency_value = pipeline
        .render_concurrency
        .unwrap_or(DEFAULT_RENDER_CONCURRENCY);
    let render_concurrency = NonZeroU32::new(concurrency_value).ok_or_else(|| {
        LoadError::invalid("pipeline.render_concurrency", "must be greater than zero")
    })?;

    let poll_ms = pipeline.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_ms == 0 {
        return Err(LoadError::invalid(
            "pipeline.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    let stale_secs = pipeline
        .stale_after_seconds
        .unwrap_or(DEFAULT_STALE_AFTER_SECS);
    let cooldown_secs = pipeline
        .heal_cooldown_seconds
        .unwrap_or(DEFAULT_HEAL_COOLDOWN_SECS);

    Ok(PipelineSettings {
        render_concurrency,
        poll_interval: Duration::from_millis(poll_ms),
        stale_after: Duration::from_secs(stale_secs),
        heal_cooldown: Duration::from_secs(cooldown_secs),
    })
}
