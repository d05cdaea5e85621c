//! Subscriber installation for processes embedding the engine.
//!
//! The `[tracing]` section of `EngineConfig` picks the default filter, span
//! close logging and the OpenTelemetry bridge. `RUST_LOG` wins over the
//! configured filter when set.
//!
//! ```no_run
//! use weft_types::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str("[tracing]\nfilter = \"weft_core=debug\"\n").unwrap();
//! weft_observe::tracing_setup::init_tracing(&config.tracing).unwrap();
//! // ... run workflows ...
//! weft_observe::tracing_setup::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use weft_types::config::TracingConfig;

/// Tracer name reported to OpenTelemetry.
pub const TRACER_NAME: &str = "weft";

/// Filter used by [`init_test_tracing`] when `RUST_LOG` is unset.
pub const TEST_FILTER: &str = "weft_core=debug";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

fn env_or(default: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Fails when the configured filter does not parse or a global subscriber
/// is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = env_or(&config.filter)?;
    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(span_events);

    if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Route engine logs through the test harness' captured output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let Ok(env_filter) = env_or(TEST_FILTER) else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Flush and shut down the OpenTelemetry provider, if one was installed.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
