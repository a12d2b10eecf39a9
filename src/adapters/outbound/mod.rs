pub mod ring_buffer_metrics_store;

pub use ring_buffer_metrics_store::{MetricsConfig, RingBufferMetricsStore};
