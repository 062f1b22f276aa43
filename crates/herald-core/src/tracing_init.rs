//! Shared tracing/logging initialization.
//!
//! Both herald-poller and herald use the same pattern for setting up
//! `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"herald_poller=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Guard returned by [`init_tracing_with_metrics`].
///
/// Without the `metrics` feature this is a unit placeholder so callers can
/// hold it unconditionally.
#[cfg(feature = "metrics")]
pub type TelemetryGuard = Option<crate::metrics::MetricsGuard>;
#[cfg(not(feature = "metrics"))]
pub type TelemetryGuard = ();

/// Initialise tracing and, when the `metrics` feature is enabled and an
/// endpoint is given, the OTLP export pipeline.
///
/// Falls back to plain [`init_tracing`] when the pipeline cannot be built.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> TelemetryGuard {
    use opentelemetry::trace::TracerProvider as _;

    let Some(endpoint) = endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };

    let guard = match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, "OTLP pipeline unavailable, metrics disabled");
            return None;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(guard.tracer_provider().tracer("herald"));
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(otel_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(otel_layer)
            .init();
    }
    Some(guard)
}

/// Initialise tracing; the metrics endpoint is ignored without the
/// `metrics` feature.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    _endpoint: Option<&str>,
) -> TelemetryGuard {
    init_tracing(default_filter, log_json);
}
