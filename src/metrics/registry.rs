use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`) can be used anywhere in the codebase. The `PrometheusHandle` is
/// retained solely for rendering the scrape endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup before any `counter!` /
    /// `gauge!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        // probing
        describe_counter!(
            "numprobe_probe_total",
            Unit::Count,
            "Probe classifications by outcome"
        );

        // proxy pool
        describe_counter!(
            "numprobe_vendor_fetch_total",
            Unit::Count,
            "Vendor fetch attempts by result"
        );
        describe_counter!(
            "numprobe_pool_refill_endpoints_total",
            Unit::Count,
            "Endpoints appended to pools by refills"
        );
        describe_gauge!(
            "numprobe_pool_size",
            Unit::Count,
            "Endpoints currently held per pool"
        );

        // tasks
        describe_counter!(
            "numprobe_tasks_total",
            Unit::Count,
            "Tasks finished by terminal status"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
