use std::env;

use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter,
};

const SAMPLING_RATE_ENV: &str = "POSTBOX_OTEL_SAMPLING_RATE";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Flushes pending spans when dropped at the end of `main`.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs console logging plus, when sampling is enabled, an OTLP exporter.
/// Exporter failures downgrade to console-only logging.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_RATE_ENV).ok().as_deref());

    let (otel_layer, otel_error) = match build_otel_layer(service_name, sampling_rate) {
        Ok(layer) => (layer, None),
        Err(error) => (None, Some(error)),
    };
    let guard = TelemetryGuard {
        tracer_installed: otel_layer.is_some(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }
    info!(service_name, sampling_rate, "telemetry configured");

    Ok(guard)
}

fn build_otel_layer<S>(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<S, trace::Tracer>>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Some(endpoint) = otlp_endpoint(env::var(OTLP_ENDPOINT_ENV).ok().as_deref()) {
        exporter = exporter.with_endpoint(endpoint);
    }
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)
        .context("installing OTLP batch exporter")?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Blank values fall back to the exporter's default collector address.
fn otlp_endpoint(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Reads the trace sampling ratio. Returns the rate to use and an optional
/// warning to log once the subscriber is up.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some(format!("{SAMPLING_RATE_ENV} is empty; defaulting to 1.0")),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if parsed.is_nan() => (
            1.0,
            Some(format!(
                "{SAMPLING_RATE_ENV}='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_RATE_ENV}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "{SAMPLING_RATE_ENV}='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::{otlp_endpoint, parse_sampling_rate};

    #[test]
    fn otlp_endpoint_ignores_blank_values() {
        assert_eq!(otlp_endpoint(None), None);
        assert_eq!(otlp_endpoint(Some("  ")), None);
        assert_eq!(
            otlp_endpoint(Some(" http://collector:4317 ")).as_deref(),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn defaults_to_full_sampling() {
        assert_eq!(parse_sampling_rate(None), (1.0, None));
    }

    #[test]
    fn accepts_rates_in_range() {
        assert_eq!(parse_sampling_rate(Some("0.25")), (0.25, None));
        assert_eq!(parse_sampling_rate(Some(" 0 ")), (0.0, None));
    }

    #[test]
    fn clamps_out_of_range_rates() {
        let (rate, warning) = parse_sampling_rate(Some("1.5"));
        assert_eq!(rate, 1.0);
        assert!(warning
            .unwrap()
            .contains("POSTBOX_OTEL_SAMPLING_RATE=1.5 outside 0.0..=1.0"));

        let (rate, warning) = parse_sampling_rate(Some("-0.3"));
        assert_eq!(rate, 0.0);
        assert!(warning.is_some());
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["abc", "NaN", "   "] {
            let (rate, warning) = parse_sampling_rate(Some(raw));
            assert_eq!(rate, 1.0, "{raw}");
            assert!(warning.is_some(), "{raw}");
        }
    }
}
