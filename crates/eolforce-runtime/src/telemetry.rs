//! Tracing pipeline of a test station.
//!
//! [`init_tracing`] installs the global subscriber once per process: a
//! console layer (compact or JSON) and, when a collector is configured, an
//! OTLP/HTTP span exporter.  Exported spans carry the station they ran on
//! as the `station.id` resource attribute, so the `eol_test` span of every
//! test (test id, serial, profile) and its phase spans can be grouped per
//! station in the collector.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). |
//! | `RUST_LOG` | `EnvFilter` directives (default `"info"`). |
//! | `EOLFORCE_LOG_FORMAT=json` | Newline-delimited JSON on the console. |
//!
//! # Example
//!
//! ```rust,no_run
//! use eolforce_runtime::telemetry::{TelemetryOptions, init_tracing};
//!
//! // Hold the guard until the process exits.
//! let _guard = init_tracing("EOL-01", &TelemetryOptions::from_env());
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `service.name` of every exported span.
pub const SERVICE_NAME: &str = "eolforce";
/// Environment variable selecting the console format.
pub const LOG_FORMAT_ENV: &str = "EOLFORCE_LOG_FORMAT";
/// Environment variable naming the OTLP collector.
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

const DEFAULT_FILTER: &str = "info";

/// How a station process logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// `EnvFilter` directives.
    pub filter: String,
    /// JSON lines instead of the compact console format.
    pub json: bool,
    /// OTLP/HTTP collector base URL; no export when `None`.
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
            otlp_endpoint: None,
        }
    }
}

impl TelemetryOptions {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Read the options through `var`; blank values count as unset.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let set = |name: &str| var(name).filter(|value| !value.trim().is_empty());
        Self {
            filter: set("RUST_LOG").unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            json: set(LOG_FORMAT_ENV).is_some_and(|f| f.eq_ignore_ascii_case("json")),
            otlp_endpoint: set(OTLP_ENDPOINT_ENV),
        }
    }
}

/// Install the global `tracing` subscriber for station `station_id`.
///
/// Call before the Tokio runtime is built.  The returned
/// [`TracerProviderGuard`] must be held until the process exits; dropping
/// it flushes pending spans.
pub fn init_tracing(station_id: &str, options: &TelemetryOptions) -> TracerProviderGuard {
    let filter = EnvFilter::try_new(&options.filter).unwrap_or_else(|e| {
        eprintln!("[{SERVICE_NAME}] invalid log filter '{}': {e}", options.filter);
        EnvFilter::new(DEFAULT_FILTER)
    });
    let provider = options
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(endpoint, station_id));
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("eolforce-runtime")));
    let console = if options.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().compact().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(console)
        .init();

    TracerProviderGuard(provider)
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts the OTel [`SdkTracerProvider`] down on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[{SERVICE_NAME}] span export shutdown failed: {e}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

fn station_resource(station_id: &str) -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attributes([
            KeyValue::new("station.id", station_id.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build()
}

/// `None` when the exporter cannot be built; the error goes to stderr
/// because no subscriber exists yet.
fn build_provider(endpoint: &str, station_id: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[{SERVICE_NAME}] OTLP exporter for {endpoint} failed: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_resource(station_resource(station_id))
            // Runs on the thread that closes the span; no runtime needed.
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        assert_eq!(TelemetryOptions::from_vars(vars(&[])), TelemetryOptions::default());
    }

    #[test]
    fn variables_select_filter_format_and_collector() {
        let options = TelemetryOptions::from_vars(vars(&[
            ("RUST_LOG", "eolforce_runtime=debug"),
            (LOG_FORMAT_ENV, "JSON"),
            (OTLP_ENDPOINT_ENV, "http://collector:4318"),
        ]));
        assert_eq!(options.filter, "eolforce_runtime=debug");
        assert!(options.json);
        assert_eq!(options.otlp_endpoint.as_deref(), Some("http://collector:4318"));
    }

    #[test]
    fn blank_variables_count_as_unset() {
        let options = TelemetryOptions::from_vars(vars(&[
            ("RUST_LOG", " "),
            (LOG_FORMAT_ENV, "compact"),
            (OTLP_ENDPOINT_ENV, ""),
        ]));
        assert_eq!(options, TelemetryOptions::default());
    }

    #[test]
    fn resource_names_the_station() {
        let resource = station_resource("EOL-07");
        let attribute = |key: &'static str| {
            resource
                .get(&opentelemetry::Key::new(key))
                .map(|value| value.to_string())
        };
        assert_eq!(attribute("station.id").as_deref(), Some("EOL-07"));
        assert_eq!(attribute("service.name").as_deref(), Some(SERVICE_NAME));
    }

    #[test]
    fn guard_without_provider_drops_cleanly() {
        let guard = TracerProviderGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }
}
