//! Metrics Export Port
//!
//! Flat key-value view of a component's counters for an external collector.

/// Component whose counters can be scraped by an exposition formatter.
///
/// Names are dotted (`cache.hits`, `lb.backend.api-1.connections`); the
/// formatter owns any renaming to its own conventions.
pub trait MetricsExport {
    fn export_metrics(&self) -> Vec<(String, f64)>;
}
