//! Prometheus metrics
//!
//! A single lazily-initialized [`Metrics`] struct owns its registry.
//! Registration failures are logged and the collector keeps working
//! unregistered, so metric calls never fail at the call site.

use std::sync::OnceLock;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    /// Completed runs by outcome (`succeeded`, `failed`, `cancelled`).
    pub runs_total: IntCounterVec,
    /// Wall time of completed runs.
    pub run_duration_seconds: Histogram,
    /// Objects fully handled per kind.
    pub objects_published_total: IntCounterVec,
    /// Live rows in the dirty queue, sampled on status requests.
    pub queue_entries: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        // constant definitions, construction can only fail on bad names
        let runs_total = IntCounterVec::new(
            Opts::new("pressline_runs_total", "Completed publish runs by outcome"),
            &["outcome"],
        )
        .expect("metric definition");
        let run_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "pressline_run_duration_seconds",
            "Wall time of completed publish runs",
        ))
        .expect("metric definition");
        let objects_published_total = IntCounterVec::new(
            Opts::new(
                "pressline_objects_published_total",
                "Objects fully handled per kind",
            ),
            &["kind"],
        )
        .expect("metric definition");
        let queue_entries = IntGauge::new("pressline_queue_entries", "Live rows in the dirty queue")
            .expect("metric definition");

        for collector in [
            Box::new(runs_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(run_duration_seconds.clone()),
            Box::new(objects_published_total.clone()),
            Box::new(queue_entries.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                tracing::warn!(error = %e, "failed to register metric");
            }
        }

        Self {
            registry,
            runs_total,
            run_duration_seconds,
            objects_published_total,
            queue_entries,
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Process-wide metrics handle.
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
