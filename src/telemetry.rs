use crate::config::ObservabilityConfig;
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize structured logging.
/// RUST_LOG wins over the configured level when set.
pub fn init_telemetry(settings: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))?;

    if settings.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(filter)
            .try_init()?;
    }

    tracing::info!("merge-steward telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking the records of one resolution cycle
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span carrying the cluster a pipeline run works on
pub fn create_resolution_span(
    operation: &str,
    cluster_id: Option<&str>,
    wave: Option<usize>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "resolution",
        operation = operation,
        cluster.id = cluster_id,
        wave = wave,
        correlation.id = correlation_id,
    )
}

/// Create the span wrapping one coordinator cycle
pub fn create_cycle_span(correlation_id: &str) -> tracing::Span {
    tracing::info_span!("cycle", correlation.id = correlation_id)
}

pub fn shutdown_telemetry() {
    tracing::info!("merge-steward telemetry shutdown complete");
}
