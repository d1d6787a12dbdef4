//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use stepflow_types::config::{LogFormat, TracingConfig};
//!
//! let config = TracingConfig {
//!     format: LogFormat::Json,
//!     filter: Some("stepflow_core=debug".into()),
//!     otel_stdout: false,
//! };
//! stepflow_observe::tracing_setup::init_tracing(&config).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use stepflow_types::config::{LogFormat, TracingConfig};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use std::sync::OnceLock;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Default directive when neither the config nor `RUST_LOG` sets one.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer in the configured format with span close timing.
/// - When `otel_stdout` is set, additionally bridges spans to OpenTelemetry
///   using a stdout exporter.
/// - Filter: `config.filter`, else `RUST_LOG`, else [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global
/// subscriber has already been set.
pub fn init_tracing(config: &TracingConfig) -> Result<(), BoxError> {
    let env_filter = build_filter(config)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![match config.format {
        LogFormat::Pretty => fmt_layer.pretty().boxed(),
        LogFormat::Compact => fmt_layer.compact().boxed(),
        LogFormat::Json => fmt_layer.json().boxed(),
    }];

    let provider = if config.otel_stdout {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepflow");
        layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
        Some(provider)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    // Only register the provider once this subscriber actually owns the
    // global slot.
    if let Some(provider) = provider {
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    }

    Ok(())
}

/// Build the level filter for `config`.
pub fn build_filter(config: &TracingConfig) -> Result<EnvFilter, BoxError> {
    match config.filter.as_deref() {
        Some(directive) => Ok(EnvFilter::try_new(directive)?),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Safe to call even when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_from_config() {
        let config = TracingConfig {
            filter: Some("stepflow_core=debug,warn".to_string()),
            ..TracingConfig::default()
        };
        let filter = build_filter(&config).unwrap();
        assert!(filter.to_string().contains("stepflow_core=debug"));
    }

    #[test]
    fn test_build_filter_rejects_invalid_directive() {
        let config = TracingConfig {
            filter: Some("stepflow_core=notalevel".to_string()),
            ..TracingConfig::default()
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig {
            format: LogFormat::Compact,
            filter: Some("warn".to_string()),
            otel_stdout: false,
        };
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
        shutdown_tracing();
    }
}
