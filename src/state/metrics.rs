use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Cache metrics
    pub refresh_sweeps_total: IntCounter,
    pub refresh_sweeps_coalesced: IntCounter,
    pub manifest_fetch_failures: IntCounter,
    pub cached_plugins: IntGauge,

    // Proxy metrics
    pub asset_requests_total: IntCounter,
    pub asset_requests_failed: IntCounter,
    pub asset_request_duration: Histogram,
    pub tap_ingests_total: IntCounter,
    pub tap_failures_total: IntCounter,

    // Counter metrics
    pub installs_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let refresh_sweeps_total = IntCounter::new(
            "plugin_proxy_refresh_sweeps_total",
            "Total number of completed cache refresh sweeps",
        )
        .expect("metric creation failed");
        let refresh_sweeps_coalesced = IntCounter::new(
            "plugin_proxy_refresh_sweeps_coalesced_total",
            "Refresh requests satisfied by a concurrent sweep",
        )
        .expect("metric creation failed");
        let manifest_fetch_failures = IntCounter::new(
            "plugin_proxy_manifest_fetch_failures_total",
            "Manifest fetches that fell back to registry defaults",
        )
        .expect("metric creation failed");
        let cached_plugins = IntGauge::new(
            "plugin_proxy_cached_plugins",
            "Number of plugin records in the direct cache",
        )
        .expect("metric creation failed");

        let asset_requests_total = IntCounter::new(
            "plugin_proxy_asset_requests_total",
            "Total number of proxied asset requests",
        )
        .expect("metric creation failed");
        let asset_requests_failed = IntCounter::new(
            "plugin_proxy_asset_requests_failed",
            "Proxied asset requests that could not reach the origin",
        )
        .expect("metric creation failed");
        let asset_request_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "plugin_proxy_asset_request_duration_seconds",
            "Time until origin response headers were received",
        ))
        .expect("metric creation failed");
        let tap_ingests_total = IntCounter::new(
            "plugin_proxy_tap_ingests_total",
            "Manifest bodies captured from proxied responses",
        )
        .expect("metric creation failed");
        let tap_failures_total = IntCounter::new(
            "plugin_proxy_tap_failures_total",
            "Captured manifest bodies that could not be ingested",
        )
        .expect("metric creation failed");

        let installs_total = IntCounter::new(
            "plugin_proxy_installs_total",
            "Install reports accepted",
        )
        .expect("metric creation failed");

        // Register all metrics
        registry
            .register(Box::new(refresh_sweeps_total.clone()))
            .unwrap();
        registry
            .register(Box::new(refresh_sweeps_coalesced.clone()))
            .unwrap();
        registry
            .register(Box::new(manifest_fetch_failures.clone()))
            .unwrap();
        registry.register(Box::new(cached_plugins.clone())).unwrap();
        registry
            .register(Box::new(asset_requests_total.clone()))
            .unwrap();
        registry
            .register(Box::new(asset_requests_failed.clone()))
            .unwrap();
        registry
            .register(Box::new(asset_request_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(tap_ingests_total.clone()))
            .unwrap();
        registry
            .register(Box::new(tap_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(installs_total.clone())).unwrap();

        Self {
            registry,
            refresh_sweeps_total,
            refresh_sweeps_coalesced,
            manifest_fetch_failures,
            cached_plugins,
            asset_requests_total,
            asset_requests_failed,
            asset_request_duration,
            tap_ingests_total,
            tap_failures_total,
            installs_total,
        }
    }

    pub fn record_refresh_sweep(&self, cached: usize) {
        self.refresh_sweeps_total.inc();
        self.cached_plugins.set(cached as i64);
    }

    pub fn record_coalesced_refresh(&self) {
        self.refresh_sweeps_coalesced.inc();
    }

    pub fn record_fetch_failure(&self) {
        self.manifest_fetch_failures.inc();
    }

    pub fn record_tap(&self, success: bool) {
        self.tap_ingests_total.inc();
        if !success {
            self.tap_failures_total.inc();
        }
    }

    pub fn record_install(&self) {
        self.installs_total.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Times one proxied asset request from routing until origin headers arrive.
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.asset_requests_total.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.metrics
            .asset_request_duration
            .observe(duration.as_secs_f64());
    }

    pub fn fail(self) {
        let duration = self.start.elapsed();
        self.metrics
            .asset_request_duration
            .observe(duration.as_secs_f64());
        self.metrics.asset_requests_failed.inc();
    }
}
