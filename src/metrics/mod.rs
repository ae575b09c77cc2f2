//! Prometheus metrics for the farm.
//!
//! Metrics are optional at runtime: components report through the helper
//! functions below, which are no-ops until [`init_metrics`] has run. This
//! keeps the orchestration engine usable from tests and library callers
//! without global setup.

use std::sync::OnceLock;

use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Global Prometheus registry for all docfarm metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total batches dispatched to workers.
pub static BATCHES_DISPATCHED: OnceLock<Counter> = OnceLock::new();

/// Total per-batch results collected from workers.
pub static RESULTS_COLLECTED: OnceLock<Counter> = OnceLock::new();

/// Total completed client reports published.
pub static REPORTS_PUBLISHED: OnceLock<Counter> = OnceLock::new();

/// Current global demand (in-flight batches).
pub static GLOBAL_DEMAND: OnceLock<Gauge> = OnceLock::new();

/// Current worker pool size.
pub static POOL_SIZE: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at process startup. Calling again is a no-op for the statics
/// that are already set.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let batches_dispatched = Counter::with_opts(Opts::new(
        "docfarm_batches_dispatched_total",
        "Total batches dispatched to workers",
    ))?;

    let results_collected = Counter::with_opts(Opts::new(
        "docfarm_results_collected_total",
        "Total per-batch results collected from workers",
    ))?;

    let reports_published = Counter::with_opts(Opts::new(
        "docfarm_reports_published_total",
        "Total completed client reports published",
    ))?;

    let global_demand = Gauge::new("docfarm_global_demand", "In-flight batches across clients")?;

    let pool_size = Gauge::new("docfarm_pool_size", "Current worker pool size")?;

    registry.register(Box::new(batches_dispatched.clone()))?;
    registry.register(Box::new(results_collected.clone()))?;
    registry.register(Box::new(reports_published.clone()))?;
    registry.register(Box::new(global_demand.clone()))?;
    registry.register(Box::new(pool_size.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = BATCHES_DISPATCHED.set(batches_dispatched);
    let _ = RESULTS_COLLECTED.set(results_collected);
    let _ = REPORTS_PUBLISHED.set(reports_published);
    let _ = GLOBAL_DEMAND.set(global_demand);
    let _ = POOL_SIZE.set(pool_size);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Records `n` dispatched batches.
pub fn record_batches_dispatched(n: usize) {
    if let Some(counter) = BATCHES_DISPATCHED.get() {
        counter.inc_by(n as f64);
    }
}

/// Records one collected batch result.
pub fn record_result_collected() {
    if let Some(counter) = RESULTS_COLLECTED.get() {
        counter.inc();
    }
}

/// Records one published client report.
pub fn record_report_published() {
    if let Some(counter) = REPORTS_PUBLISHED.get() {
        counter.inc();
    }
}

/// Updates the global demand gauge.
pub fn set_demand(demand: i64) {
    if let Some(gauge) = GLOBAL_DEMAND.get() {
        gauge.set(demand as f64);
    }
}

/// Updates the worker pool size gauge.
pub fn set_pool_size(size: usize) {
    if let Some(gauge) = POOL_SIZE.get() {
        gauge.set(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_safe_before_init() {
        // Must not panic when metrics were never initialized.
        record_batches_dispatched(3);
        record_result_collected();
        record_report_published();
        set_demand(5);
        set_pool_size(2);
    }

    #[test]
    fn test_init_and_export() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());

        let exported = export_metrics();
        assert!(!exported.is_empty());
        assert!(!exported.starts_with("# Error"));
    }
}
