//! Built-in reachability exporter.
//!
//! Construction requires one seed of the target to accept a TCP connection.
//! Every scrape re-probes all seeds and renders a per-target registry in
//! OpenMetrics text format.

use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::exporter::{ConstructionError, Exporter, ExporterFactory, ExporterOptions};

/// Content type of the rendered registry.
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SeedLabels {
    seed: String,
}

/// Factory for [`ProbeExporter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeExporterFactory;

impl ExporterFactory for ProbeExporterFactory {
    type Exporter = ProbeExporter;

    async fn construct(&self, options: ExporterOptions) -> Result<ProbeExporter, ConstructionError> {
        debug!(
            target_id = %options.target,
            uri = %options.redacted_uri(),
            "Constructing probe exporter"
        );

        let mut reachable = false;
        let mut last_error = None;
        for seed in options.target.seeds() {
            match probe(seed, options.connect_timeout).await {
                Ok(elapsed) => {
                    debug!(seed, ?elapsed, "Seed reachable");
                    reachable = true;
                    break;
                }
                Err(e) => {
                    debug!(seed, error = %e, "Seed unreachable");
                    last_error = Some(e);
                }
            }
        }

        if reachable {
            return Ok(ProbeExporter::new(options));
        }

        Err(last_error.unwrap_or_else(|| {
            ConstructionError::InvalidOptions(format!("target {} has no seeds", options.target))
        }))
    }
}

/// Exporter reporting reachability of one target's seeds.
#[derive(Debug)]
pub struct ProbeExporter {
    options: ExporterOptions,
    registry: Registry,
    up: Gauge,
    seed_up: Family<SeedLabels, Gauge>,
    probe_duration: Family<SeedLabels, Gauge<f64, AtomicU64>>,
    scrapes: Counter,
}

impl ProbeExporter {
    /// Create an exporter and register its metrics.
    pub fn new(options: ExporterOptions) -> Self {
        let mut registry = Registry::default();

        let up = Gauge::default();
        registry.register("mongodb_up", "Whether any seed of the target is reachable", up.clone());

        let seed_up = Family::<SeedLabels, Gauge>::default();
        registry.register(
            "mongodb_seed_up",
            "Whether the seed accepted a TCP connection",
            seed_up.clone(),
        );

        let probe_duration = Family::<SeedLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "mongodb_probe_duration_seconds",
            "Time taken to connect to the seed",
            probe_duration.clone(),
        );

        let scrapes = Counter::default();
        registry.register(
            "mongodb_scrapes",
            "Scrapes served for this target",
            scrapes.clone(),
        );

        let info = Info::new(vec![
            ("target".to_string(), options.target.to_string()),
            ("replica_set".to_string(), options.replica_set.clone()),
            ("collectors".to_string(), options.collectors.enabled().join(",")),
            ("compatible_mode".to_string(), options.compatible_mode.to_string()),
            ("discovering_mode".to_string(), options.discovering_mode.to_string()),
            ("global_conn_pool".to_string(), options.global_conn_pool.to_string()),
            ("direct_connect".to_string(), options.direct_connect.to_string()),
        ]);
        registry.register("mongodb_exporter", "Exporter configuration", info);

        Self {
            options,
            registry,
            up,
            seed_up,
            probe_duration,
            scrapes,
        }
    }

    /// The options this exporter was built with.
    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    async fn collect(&self) {
        let mut any_up = false;

        for seed in self.options.target.seeds() {
            let labels = SeedLabels {
                seed: seed.to_string(),
            };
            match probe(seed, self.options.connect_timeout).await {
                Ok(elapsed) => {
                    any_up = true;
                    self.seed_up.get_or_create(&labels).set(1);
                    self.probe_duration
                        .get_or_create(&labels)
                        .set(elapsed.as_secs_f64());
                }
                Err(e) => {
                    debug!(seed, error = %e, "Probe failed");
                    self.seed_up.get_or_create(&labels).set(0);
                    self.probe_duration.get_or_create(&labels).set(0.0);
                }
            }
        }

        self.up.set(i64::from(any_up));
        self.scrapes.inc();
    }

    /// Render the registry in OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

impl Exporter for ProbeExporter {
    async fn serve(&self, _request: Request<Body>) -> Response {
        self.collect().await;

        match self.render() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => {
                warn!(target_id = %self.options.target, error = %e, "Failed to encode metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n").into_response()
            }
        }
    }
}

/// Open and immediately close a TCP connection to `seed`.
async fn probe(seed: &str, timeout: Duration) -> Result<Duration, ConstructionError> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(seed)).await {
        Ok(Ok(_stream)) => Ok(started.elapsed()),
        Ok(Err(source)) => Err(ConstructionError::Unreachable {
            address: seed.to_string(),
            source,
        }),
        Err(_) => Err(ConstructionError::Timeout {
            address: seed.to_string(),
            after: timeout,
        }),
    }
}
