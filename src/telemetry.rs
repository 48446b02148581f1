//! Tracing setup and optional OTLP export.
//!
//! `ORCHARD_LOG` sets the filter (default `warn` for the CLI, `info` for
//! daemons). `ORCHARD_LOG_FORMAT=json` switches stderr output to JSON lines.
//! With the `otel` feature and `OTEL_EXPORTER_OTLP_ENDPOINT` set, traces, logs
//! and metrics are also exported over OTLP/HTTP.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV: &str = "ORCHARD_LOG";
pub const LOG_FORMAT_ENV: &str = "ORCHARD_LOG_FORMAT";

/// Flushes exporters on drop. Keep it alive for the life of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    providers: Option<otel::Providers>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(providers) = self.providers.take() {
            providers.shutdown();
        }
    }
}

/// Install the global subscriber. Safe to call once per process; later calls
/// are ignored.
pub fn init(default_level: &str) -> TelemetryGuard {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{default_level},opentelemetry=off,reqwest=off,hyper_util=off"
        ))
    });

    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    #[cfg(feature = "otel")]
    {
        let providers = otel::Providers::from_env();
        let trace_layer = providers.as_ref().map(|p| {
            use opentelemetry::trace::TracerProvider as _;
            tracing_opentelemetry::layer().with_tracer(p.tracer.tracer("orchard"))
        });
        let log_layer = providers.as_ref().map(|p| {
            opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logger)
        });
        let _ = registry
            .with(trace_layer)
            .with(log_layer)
            .with(filter)
            .try_init();
        TelemetryGuard { providers }
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = registry.with(filter).try_init();
        TelemetryGuard::default()
    }
}

/// Count one finished agent turn.
pub fn record_turn(profile: &str, ok: bool) {
    #[cfg(feature = "otel")]
    otel::counter("orchard.turns", profile, ok);
    #[cfg(not(feature = "otel"))]
    let _ = (profile, ok);
}

/// Count one spawn decision.
pub fn record_spawn(profile: &str, accepted: bool) {
    #[cfg(feature = "otel")]
    otel::counter("orchard.spawns", profile, accepted);
    #[cfg(not(feature = "otel"))]
    let _ = (profile, accepted);
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    pub struct Providers {
        pub tracer: SdkTracerProvider,
        pub logger: SdkLoggerProvider,
        pub meter: SdkMeterProvider,
    }

    impl Providers {
        /// Build exporters when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
        pub fn from_env() -> Option<Self> {
            let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
            if endpoint.trim().is_empty() {
                return None;
            }
            match Self::build() {
                Ok(p) => Some(p),
                Err(e) => {
                    eprintln!("warning: OTLP export disabled: {e:#}");
                    None
                }
            }
        }

        fn build() -> anyhow::Result<Self> {
            let resource = Resource::builder().with_service_name("orchard").build();

            let spans = SpanExporter::builder().with_http().build()?;
            let tracer = SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build();

            let logs = LogExporter::builder().with_http().build()?;
            let logger = SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource.clone())
                .build();

            let metrics = MetricExporter::builder().with_http().build()?;
            let meter = SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource)
                .build();
            opentelemetry::global::set_meter_provider(meter.clone());

            Ok(Self {
                tracer,
                logger,
                meter,
            })
        }

        pub fn shutdown(self) {
            let _ = self.tracer.shutdown();
            let _ = self.logger.shutdown();
            let _ = self.meter.shutdown();
        }
    }

    pub fn counter(name: &'static str, profile: &str, ok: bool) {
        let counter = opentelemetry::global::meter("orchard")
            .u64_counter(name)
            .build();
        counter.add(
            1,
            &[
                KeyValue::new("profile", profile.to_string()),
                KeyValue::new("ok", ok),
            ],
        );
    }
}
