use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pressroom_jobs_submitted_total",
            Unit::Count,
            "Total number of document jobs accepted."
        );
        describe_counter!(
            "pressroom_pages_rendered_total",
            Unit::Count,
            "Total number of page artifacts produced."
        );
        describe_counter!(
            "pressroom_merges_total",
            Unit::Count,
            "Total number of documents assembled from page artifacts."
        );
        describe_counter!(
            "pressroom_task_failures_total",
            Unit::Count,
            "Total number of failed task attempts across both queues."
        );
        describe_counter!(
            "pressroom_reconciler_merge_repairs_total",
            Unit::Count,
            "Total number of merge tasks reissued by the reconciler."
        );
        describe_counter!(
            "pressroom_reconciler_render_repairs_total",
            Unit::Count,
            "Total number of jobs whose render tasks were reissued by the reconciler."
        );
        describe_histogram!(
            "pressroom_render_ms",
            Unit::Milliseconds,
            "Single-page render latency in milliseconds."
        );
        describe_histogram!(
            "pressroom_merge_ms",
            Unit::Milliseconds,
            "Merge-and-finalize latency in milliseconds."
        );
    });
}
