//! Tracing subscriber setup for the `kanflow` binary.
//!
//! Log lines always go to stderr so `--json` command output on stdout stays
//! parseable. Spans can additionally be exported through OpenTelemetry
//! (stdout exporter), which is enough for local inspection of a run's
//! step timings.
//!
//! ```no_run
//! use kanflow_observe::tracing_setup::{init_tracing, TracingOptions};
//!
//! let _guard = init_tracing(&TracingOptions { verbose: 1, ..Default::default() })?;
//! tracing::info!(run_id = "0191...", "run started");
//! # Ok::<(), tracing_subscriber::util::TryInitError>(())
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// How the binary wants its diagnostics.
#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    /// `-v` count.
    pub verbose: u8,
    /// Only errors.
    pub quiet: bool,
    /// Emit log lines as JSON objects instead of human-readable text.
    pub json_logs: bool,
    /// Bridge spans to OpenTelemetry.
    pub otel: bool,
}

/// Default filter directive for a verbosity level. `-v` wins over `--quiet`.
pub fn verbosity_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,kanflow_core=debug,kanflow_infra=debug",
        _ => "trace",
    }
}

/// `RUST_LOG` when set and valid, otherwise `default_filter`.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Flushes the OpenTelemetry provider when dropped.
#[must_use = "dropping the guard immediately shuts down span export"]
#[derive(Debug, Default)]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Whether spans are being exported.
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("warning: failed to flush trace exporter: {e}");
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(options: &TracingOptions) -> Result<TracingGuard, TryInitError> {
    let filter = env_filter(verbosity_filter(options.verbose, options.quiet));

    let provider = options.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());
        provider
    });
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("kanflow")));

    let (text_layer, json_layer) = if options.json_logs {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true);
        (None, Some(layer))
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(options.verbose > 1)
            .with_span_events(FmtSpan::CLOSE);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(text_layer)
        .with(json_layer)
        .try_init()?;

    Ok(TracingGuard { provider })
}
