//! Metric export through the OpenTelemetry SDK.
//!
//! [`MeterPipeline`] turns every registry instrument into an observable
//! instrument on an `SdkMeterProvider`. A `PeriodicReader` collects on the
//! export interval and hands the result to a push exporter: OTLP/HTTP JSON
//! in production (feature `otlp`), `InMemoryMetricExporter` in tests.
//!
//! ```text
//! PeriodicReader ──tick──▶ callbacks ──▶ SharedRefresh ──▶ GaugeRegistry
//!        │                                                      │
//!        ◀──────────────── observations ◀───────────────────────┘
//!        │
//!        ▼
//!  PushMetricExporter (OTLP/HTTP)
//! ```

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use tracing::debug;

use crate::reader::SharedRefresh;
use crate::registry::{Instrument, InstrumentKind, Observation};

/// Instrumentation scope of every exported metric.
pub const SCOPE_NAME: &str = "gpu-metrics";

/// Path appended to the configured endpoint.
pub const METRICS_PATH: &str = "/v1/metrics";

/// Upper bound for the final refresh and export after cancellation.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ExportError {
    /// Exporter could not be constructed from the configuration.
    Config(String),
    /// Final flush or provider shutdown failed.
    Shutdown(String),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Config(msg) => write!(f, "invalid exporter configuration: {}", msg),
            ExportError::Shutdown(msg) => write!(f, "exporter shutdown failed: {}", msg),
        }
    }
}

impl std::error::Error for ExportError {}

/// Full URL the exporter posts to.
pub fn metrics_url(endpoint: &str) -> String {
    format!("{}{}", endpoint.trim_end_matches('/'), METRICS_PATH)
}

fn is_header_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Builds the OTLP/HTTP JSON exporter for `config`.
///
/// The SDK drops headers it cannot encode, so the auth header is checked
/// here instead.
#[cfg(feature = "otlp")]
pub fn otlp_exporter(
    config: &crate::config::ExportConfig,
) -> Result<opentelemetry_otlp::MetricExporter, ExportError> {
    use std::collections::HashMap;

    use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};

    let mut headers = HashMap::new();
    if let Some(key) = &config.api_key {
        if !is_header_token(&config.auth_header) {
            return Err(ExportError::Config(format!(
                "auth header '{}' is not a valid header name",
                config.auth_header
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ExportError::Config("API key is not a valid header value".into()));
        }
        headers.insert(config.auth_header.to_ascii_lowercase(), key.clone());
    }

    opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpJson)
        .with_endpoint(metrics_url(&config.endpoint))
        .with_timeout(config.request_timeout)
        .with_headers(headers)
        .build()
        .map_err(|e| ExportError::Config(e.to_string()))
}

/// Meter provider wired to the gauge registry.
pub struct MeterPipeline {
    provider: SdkMeterProvider,
    refresh: Arc<SharedRefresh>,
}

impl MeterPipeline {
    /// Registers one observable instrument per registry instrument and
    /// starts exporting every `interval`. The first export happens one
    /// interval after start.
    pub fn start<E: PushMetricExporter>(
        exporter: E,
        refresh: Arc<SharedRefresh>,
        interval: Duration,
        service_name: &str,
    ) -> Self {
        let reader = PeriodicReader::builder(exporter)
            .with_interval(interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(
                Resource::builder()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .build();

        let meter = provider.meter_with_scope(
            InstrumentationScope::builder(SCOPE_NAME)
                .with_version(crate::VERSION)
                .build(),
        );
        let instruments = refresh.instruments();
        for instrument in &instruments {
            observe_with(&meter, *instrument, refresh.clone());
        }
        debug!(instruments = instruments.len(), "meter pipeline started");

        Self { provider, refresh }
    }

    /// Runs one last refresh and export, then shuts the provider down.
    ///
    /// Bounded by [`FLUSH_TIMEOUT`]; on timeout the provider is left to
    /// finish on its own thread.
    pub async fn shutdown(self) -> Result<(), ExportError> {
        self.refresh.prepare_final(FLUSH_TIMEOUT / 2);

        let provider = self.provider;
        let task = tokio::task::spawn_blocking(move || provider.shutdown());
        match tokio::time::timeout(FLUSH_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExportError::Shutdown(e.to_string())),
            Ok(Err(e)) => Err(ExportError::Shutdown(e.to_string())),
            Err(_) => Err(ExportError::Shutdown(format!(
                "timed out after {:?}",
                FLUSH_TIMEOUT
            ))),
        }
    }
}

fn attributes(obs: &Observation) -> Vec<KeyValue> {
    obs.attributes
        .iter()
        .map(|(k, v)| KeyValue::new(*k, v.clone()))
        .collect()
}

fn for_each_point(refresh: &SharedRefresh, name: &str, mut f: impl FnMut(&Observation, &[KeyValue])) {
    for obs in refresh.observations().iter().filter(|o| o.instrument == name) {
        f(obs, &attributes(obs));
    }
}

fn observe_with(meter: &Meter, instrument: Instrument, refresh: Arc<SharedRefresh>) {
    let name = instrument.name;
    match instrument.kind {
        InstrumentKind::IntGauge => {
            meter
                .i64_observable_gauge(name)
                .with_description(instrument.description)
                .with_unit(instrument.unit)
                .with_callback(move |observer| {
                    for_each_point(&refresh, name, |obs, attrs| {
                        observer.observe(obs.value.as_i64(), attrs)
                    })
                })
                .build();
        }
        InstrumentKind::DoubleGauge => {
            meter
                .f64_observable_gauge(name)
                .with_description(instrument.description)
                .with_unit(instrument.unit)
                .with_callback(move |observer| {
                    for_each_point(&refresh, name, |obs, attrs| {
                        observer.observe(obs.value.as_f64(), attrs)
                    })
                })
                .build();
        }
        InstrumentKind::Counter => {
            meter
                .u64_observable_counter(name)
                .with_description(instrument.description)
                .with_unit(instrument.unit)
                .with_callback(move |observer| {
                    for_each_point(&refresh, name, |obs, attrs| {
                        observer.observe(obs.value.as_i64().max(0) as u64, attrs)
                    })
                })
                .build();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::FakeCollector;
    use crate::registry::{
        ATTR_COLLECTOR, ATTR_GPU_ID, CONVERSION_ERRORS, GaugeRegistry, MEMORY_USED_BYTES,
        UTILIZATION_PERCENT,
    };
    use crate::reading::GpuReading;
    use opentelemetry::Key;
    use opentelemetry_sdk::metrics::InMemoryMetricExporter;
    use opentelemetry_sdk::metrics::data::{AggregatedMetrics, Metric, MetricData, ResourceMetrics};
    use tokio::runtime::Handle;

    fn pipeline_for(
        collector: FakeCollector,
        exporter: InMemoryMetricExporter,
        interval: Duration,
    ) -> MeterPipeline {
        let mut registry = GaugeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(collector)).unwrap();
        let refresh = Arc::new(SharedRefresh::new(
            Arc::new(registry),
            Handle::current(),
            interval,
        ));
        MeterPipeline::start(exporter, refresh, interval, "gpu-mon-test")
    }

    fn metrics_named<'a>(exported: &'a [ResourceMetrics], name: &str) -> Vec<&'a Metric> {
        exported
            .iter()
            .flat_map(|rm| rm.scope_metrics())
            .flat_map(|sm| sm.metrics())
            .filter(|m| m.name() == name)
            .collect()
    }

    fn attr(attrs: Vec<&KeyValue>, key: &str) -> Option<String> {
        attrs
            .into_iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str().into_owned())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pipeline_exports_registry_observations() {
        let exporter = InMemoryMetricExporter::default();
        let pipeline = pipeline_for(
            FakeCollector::two_devices(),
            exporter.clone(),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        pipeline.shutdown().await.unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        assert!(exported.len() >= 2, "got {} exports", exported.len());

        let resource = exported[0].resource();
        assert_eq!(
            resource.get(&Key::new("service.name")).map(|v| v.to_string()),
            Some("gpu-mon-test".to_string())
        );
        let scope = exported[0].scope_metrics().next().unwrap().scope();
        assert_eq!(scope.name(), SCOPE_NAME);

        let memory = metrics_named(&exported, MEMORY_USED_BYTES.name);
        let last = memory.last().unwrap();
        assert_eq!(last.unit(), "By");
        let AggregatedMetrics::I64(MetricData::Gauge(gauge)) = last.data() else {
            panic!("memory is not an integer gauge");
        };
        let mut points: Vec<(String, i64)> = gauge
            .data_points()
            .map(|p| (attr(p.attributes().collect(), ATTR_GPU_ID).unwrap(), p.value()))
            .collect();
        points.sort();
        assert_eq!(
            points,
            vec![
                ("0".to_string(), 1024 * 1024 * 1024),
                ("1".to_string(), 512 * 1024 * 1024),
            ]
        );

        let util = metrics_named(&exported, UTILIZATION_PERCENT.name);
        let AggregatedMetrics::F64(MetricData::Gauge(gauge)) = util.last().unwrap().data() else {
            panic!("utilization is not a double gauge");
        };
        assert_eq!(gauge.data_points().count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conversion_errors_is_monotonic_counter() {
        let reading = GpuReading::new("0", "gpu", 1, 1.0).with_conversion_errors(3);
        let exporter = InMemoryMetricExporter::default();
        let pipeline = pipeline_for(
            FakeCollector::new("flaky", vec![reading]),
            exporter.clone(),
            Duration::from_millis(60),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.shutdown().await.unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        let mut totals = Vec::new();
        for metric in metrics_named(&exported, CONVERSION_ERRORS.name) {
            let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() else {
                panic!("conversion errors is not a u64 sum");
            };
            assert!(sum.is_monotonic());
            let point = sum.data_points().next().unwrap();
            assert_eq!(
                attr(point.attributes().collect(), ATTR_COLLECTOR).as_deref(),
                Some("flaky")
            );
            totals.push(point.value());
        }

        assert!(totals.len() >= 2);
        assert!(totals.windows(2).all(|w| w[0] <= w[1]), "{totals:?}");
        assert_eq!(totals[0] % 3, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_cycle_exports_no_points() {
        let collector = FakeCollector::two_devices();
        collector.fail_next(crate::collector::CollectError::StreamEnded);
        let exporter = InMemoryMetricExporter::default();
        let pipeline = pipeline_for(collector, exporter.clone(), Duration::from_secs(60));

        // Nothing before the first interval; shutdown performs the only export,
        // which sees the queued failure.
        pipeline.shutdown().await.unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        for metric in metrics_named(&exported, MEMORY_USED_BYTES.name) {
            let AggregatedMetrics::I64(MetricData::Gauge(gauge)) = metric.data() else {
                panic!("memory is not an integer gauge");
            };
            assert_eq!(gauge.data_points().count(), 0);
        }
    }

    #[test]
    fn test_metrics_url() {
        assert_eq!(metrics_url("https://api.honeycomb.io"), "https://api.honeycomb.io/v1/metrics");
        assert_eq!(metrics_url("http://127.0.0.1:4318/"), "http://127.0.0.1:4318/v1/metrics");
    }

    #[test]
    fn test_header_token() {
        assert!(is_header_token("x-honeycomb-team"));
        assert!(!is_header_token("bad header"));
        assert!(!is_header_token(""));
    }

    #[cfg(feature = "otlp")]
    #[test]
    fn test_otlp_exporter_rejects_bad_header() {
        use crate::config::ExportConfig;

        let bad = ExportConfig {
            auth_header: "bad header".to_string(),
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        assert!(matches!(otlp_exporter(&bad), Err(ExportError::Config(_))));

        let bad_key = ExportConfig {
            api_key: Some("line\nbreak".to_string()),
            ..Default::default()
        };
        assert!(matches!(otlp_exporter(&bad_key), Err(ExportError::Config(_))));
    }

    /// Minimal HTTP/1.1 receiver: answers every request with 200 and
    /// forwards `(head, body)` on the channel.
    #[cfg(feature = "otlp")]
    async fn serve_otlp(
        listener: tokio::net::TcpListener,
        requests: tokio::sync::mpsc::UnboundedSender<(String, String)>,
    ) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let head_end = loop {
                let n = socket.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break Some(pos + 4);
                }
            };
            let Some(head_end) = head_end else { continue };

            let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < head_end + length {
                let n = socket.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();

            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
            let _ = socket.shutdown().await;
            let _ = requests.send((head, body));
        }
    }

    #[cfg(feature = "otlp")]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_otlp_push_reaches_metrics_path_with_auth_header() {
        use crate::config::ExportConfig;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(serve_otlp(listener, tx));

        let config = ExportConfig {
            endpoint: format!("http://{}/", addr),
            api_key: Some("test-key".to_string()),
            interval: Duration::from_millis(100),
            ..Default::default()
        };
        let exporter = otlp_exporter(&config).unwrap();

        let mut registry = GaugeRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(FakeCollector::two_devices())).unwrap();
        let refresh = Arc::new(SharedRefresh::new(
            Arc::new(registry),
            Handle::current(),
            config.interval,
        ));
        let pipeline = MeterPipeline::start(exporter, refresh, config.interval, "gpu-mon");

        let (head, body) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no export within 10s")
            .unwrap();
        pipeline.shutdown().await.unwrap();

        assert!(head.starts_with("post /v1/metrics http/1.1"), "{head}");
        assert!(head.contains("x-honeycomb-team: test-key"), "{head}");
        assert!(head.contains("content-type: application/json"), "{head}");
        assert!(body.contains("gpu.memory_used_bytes"), "{body}");
        assert!(body.contains("gpu.utilization_percent"), "{body}");
        assert!(body.contains("gpu_id"), "{body}");
        assert!(body.contains("Test-GPU-B"), "{body}");
        assert!(body.contains(SCOPE_NAME), "{body}");
    }
}
