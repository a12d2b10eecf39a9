//! edge-resilience Library
//!
//! In-process resilience layer: a two-tier cache, a load balancer, named
//! circuit breakers, a metric store with threshold alerting, and a façade
//! that composes them around a downstream operation.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use adapters::outbound::{MetricsConfig, RingBufferMetricsStore};
pub use application::{Optimizer, OptimizerError};
pub use config::{load_config, Config, ConfigError};
pub use domain::entities::{Alert, AlertRule, BackendNode, Labels};
pub use domain::ports::{MetricsExport, MetricsStore};
pub use domain::value_objects::{AlertSeverity, CacheTier, CircuitState, Comparison, Expiry, Strategy};
pub use infrastructure::{
    AlertConfig, AlertEngine, CacheConfig, CircuitBreakerConfig, CircuitRegistry, LoadBalancer,
    LoadBalancerConfig, ShutdownController, TieredCache,
};
