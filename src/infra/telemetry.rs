use std::sync::Once;

use metrics::{Unit, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::engine::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_STORE_ERROR, METRIC_UPSTREAM_ERROR,
    METRIC_WRITE_SKIPPED,
};
use crate::config::{LogFormat, LoggingSettings};
use crate::infra::http::METRIC_HTTP_REQUESTS;

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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

/// Install the global Prometheus recorder and return the render handle.
pub fn install_metrics() -> Result<PrometheusHandle, InfraError> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|err| {
        InfraError::telemetry(format!("failed to install metrics recorder: {err}"))
    })?;
    describe_metrics();
    Ok(handle)
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HTTP_REQUESTS,
            Unit::Count,
            "Number of HTTP requests handled, by method and endpoint."
        );
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of requests answered from the cache."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of cache lookups that found no entry."
        );
        describe_counter!(
            METRIC_STORE_ERROR,
            Unit::Count,
            "Total number of failed cache store operations, by operation."
        );
        describe_counter!(
            METRIC_WRITE_SKIPPED,
            Unit::Count,
            "Total number of upstream responses not written to the cache, by reason."
        );
        describe_counter!(
            METRIC_UPSTREAM_ERROR,
            Unit::Count,
            "Total number of requests that failed to reach the upstream."
        );
    });
}
