mod metrics_export;
mod metrics_store;

pub use metrics_export::MetricsExport;
pub use metrics_store::{MetricsStore, MetricsSummary};
