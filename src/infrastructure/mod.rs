//! Infrastructure Layer
//!
//! Stateful resilience components and the background task lifecycle.

pub mod alert_engine;
pub mod circuit_breaker;
pub mod circuit_registry;
pub mod load_balancer;
pub mod shutdown;
pub mod tiered_cache;

pub use alert_engine::{AlertConfig, AlertEngine, AlertHandler, AlertStats};
pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics};
pub use circuit_registry::{CircuitRegistry, RegistrySummary};
pub use load_balancer::{
    BackendHealth, LoadBalancer, LoadBalancerConfig, LoadBalancerError, LoadBalancerStats,
};
pub use shutdown::{shutdown_signal, ShutdownController};
pub use tiered_cache::{CacheConfig, CacheStats, TieredCache};
