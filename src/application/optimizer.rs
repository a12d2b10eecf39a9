//! Optimizer - Main application use case
//!
//! Composes the cache, circuit breakers, load balancer, metric store and
//! alert engine into one entry point for running a downstream operation:
//!
//! 1. Reject early if the scope's circuit is open
//! 2. Serve from cache on a hit
//! 3. Otherwise run the operation on a selected backend under breaker protection
//! 4. Cache the result and record latency

use crate::adapters::outbound::RingBufferMetricsStore;
use crate::domain::entities::{Alert, BackendNode, Labels};
use crate::domain::ports::{MetricsExport, MetricsStore, MetricsSummary};
use crate::domain::value_objects::{CacheTier, Expiry};
use crate::infrastructure::alert_engine::{AlertEngine, AlertStats};
use crate::infrastructure::circuit_breaker::{BreakerError, CircuitMetrics};
use crate::infrastructure::circuit_registry::{CircuitRegistry, RegistrySummary};
use crate::infrastructure::load_balancer::{LoadBalancer, LoadBalancerError, LoadBalancerStats};
use crate::infrastructure::shutdown::ShutdownController;
use crate::infrastructure::tiered_cache::{CacheStats, TieredCache};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error returned by [`Optimizer::execute`].
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError<E> {
    /// The scope's circuit is open; nothing was run
    #[error("circuit '{circuit}' is open")]
    CircuitOpen { circuit: String },
    #[error("circuit '{circuit}' call timed out after {after:?}")]
    Timeout { circuit: String, after: Duration },
    #[error("no backend available")]
    NoBackendAvailable,
    #[error("connection limit exceeded for backend '{backend_id}'")]
    ConnectionLimitExceeded { backend_id: String },
    /// The operation's own error, passed through unchanged
    #[error("{0}")]
    Operation(E),
}

impl<E> OptimizerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The downstream error, if the operation itself failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<LoadBalancerError<E>> for OptimizerError<E> {
    fn from(err: LoadBalancerError<E>) -> Self {
        match err {
            LoadBalancerError::NoBackendAvailable => Self::NoBackendAvailable,
            LoadBalancerError::ConnectionLimitExceeded { backend_id } => {
                Self::ConnectionLimitExceeded { backend_id }
            }
            LoadBalancerError::Operation(e) => Self::Operation(e),
        }
    }
}

impl<E> From<BreakerError<LoadBalancerError<E>>> for OptimizerError<E> {
    fn from(err: BreakerError<LoadBalancerError<E>>) -> Self {
        match err {
            BreakerError::Open { name } => Self::CircuitOpen { circuit: name },
            BreakerError::Timeout { name, after } => Self::Timeout {
                circuit: name,
                after,
            },
            BreakerError::Operation(inner) => inner.into(),
        }
    }
}

/// Serialisable snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStatus {
    pub cache: CacheStats,
    pub load_balancer: LoadBalancerStats,
    pub circuits: RegistrySummary,
    pub circuit_metrics: Vec<CircuitMetrics>,
    pub metrics: MetricsSummary,
    pub alerts: AlertStats,
}

/// Overall health for an external health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Serving, but some backend is unhealthy or some circuit is not closed
    Degraded,
    /// Backends are configured and none is healthy
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub healthy_backends: usize,
    pub total_backends: usize,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
    pub active_alerts: usize,
}

/// Builder for [`Optimizer`]. Omitted stages use default components.
pub struct OptimizerBuilder<V> {
    cache: Option<Arc<TieredCache<V>>>,
    breakers: Option<Arc<CircuitRegistry>>,
    load_balancer: Option<Arc<LoadBalancer>>,
    metrics: Option<Arc<dyn MetricsStore>>,
    alerts: Option<Arc<AlertEngine>>,
}

impl<V: Clone> OptimizerBuilder<V> {
    pub fn cache(mut self, cache: impl Into<Arc<TieredCache<V>>>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn breakers(mut self, breakers: impl Into<Arc<CircuitRegistry>>) -> Self {
        self.breakers = Some(breakers.into());
        self
    }

    pub fn load_balancer(mut self, load_balancer: impl Into<Arc<LoadBalancer>>) -> Self {
        self.load_balancer = Some(load_balancer.into());
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn alerts(mut self, alerts: impl Into<Arc<AlertEngine>>) -> Self {
        self.alerts = Some(alerts.into());
        self
    }

    pub fn build(self) -> Optimizer<V> {
        Optimizer {
            cache: self.cache.unwrap_or_default(),
            breakers: self.breakers.unwrap_or_default(),
            load_balancer: self.load_balancer.unwrap_or_default(),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(RingBufferMetricsStore::default())),
            alerts: self.alerts.unwrap_or_default(),
        }
    }
}

/// Cache + circuit breaker + load balancer around a downstream operation.
///
/// Components are shared through `Arc`, so the same load balancer or
/// registry can back several optimizers.
pub struct Optimizer<V> {
    cache: Arc<TieredCache<V>>,
    breakers: Arc<CircuitRegistry>,
    load_balancer: Arc<LoadBalancer>,
    metrics: Arc<dyn MetricsStore>,
    alerts: Arc<AlertEngine>,
}

impl<V: Clone> Optimizer<V> {
    pub fn builder() -> OptimizerBuilder<V> {
        OptimizerBuilder {
            cache: None,
            breakers: None,
            load_balancer: None,
            metrics: None,
            alerts: None,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache<V>> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitRegistry> {
        &self.breakers
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsStore> {
        &self.metrics
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    /// Run `op` for `key` within `scope`.
    ///
    /// `scope` names the circuit breaker and prefixes the recorded metrics;
    /// results are cached under [`Optimizer::cache_key`] with the default
    /// TTL. A cache hit returns without selecting a backend. Downstream
    /// errors are returned as `Operation(E)` after bookkeeping; only those
    /// count toward opening the breaker, running out of backends or
    /// connection slots does not.
    pub async fn execute<E, F, Fut>(
        &self,
        scope: &str,
        key: &str,
        op: F,
    ) -> Result<V, OptimizerError<E>>
    where
        F: FnOnce(BackendNode) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let breaker = self.breakers.get_or_create(scope);
        if !breaker.allows_request() {
            self.count(scope, "rejected");
            tracing::debug!(circuit = %scope, "request rejected before cache lookup");
            return Err(OptimizerError::CircuitOpen {
                circuit: scope.to_string(),
            });
        }

        let cache_key = Self::cache_key(scope, key);
        if let Some(hit) = self.cache.get(&cache_key) {
            self.count(scope, "cache_hit");
            return Ok(hit);
        }

        let started = Instant::now();
        let result = breaker
            .call_async_classified(
                || self.load_balancer.execute(op),
                |e| matches!(e, LoadBalancerError::Operation(_)),
            )
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(value) => {
                self.cache
                    .set(cache_key, value.clone(), Expiry::Default, CacheTier::L1);
                self.metrics
                    .record(&format!("{}.success", scope), elapsed_ms, Labels::new());
                Ok(value)
            }
            Err(e) => {
                if e.is_open() {
                    self.count(scope, "rejected");
                } else {
                    self.metrics
                        .record(&format!("{}.error", scope), elapsed_ms, Labels::new());
                }
                Err(e.into())
            }
        }
    }

    /// Drop a cached result so the next `execute` reaches a backend.
    pub fn invalidate(&self, scope: &str, key: &str) -> bool {
        self.cache.delete(&Self::cache_key(scope, key))
    }

    /// Cache key of a scoped result: `"{len(scope)}:{scope}:{key}"`.
    ///
    /// The length prefix keeps pairs like `("a:b", "c")` and `("a", "b:c")`
    /// apart.
    pub fn cache_key(scope: &str, key: &str) -> String {
        format!("{}:{}:{}", scope.len(), scope, key)
    }

    /// One maintenance pass: backend health check, component gauges, alert
    /// evaluation. Returns the alerts raised by this pass.
    pub fn observe(&self) -> Vec<Alert> {
        let changed = self
            .load_balancer
            .health_check()
            .into_iter()
            .filter(|h| h.changed)
            .count();
        if changed > 0 {
            tracing::debug!(changed, "backend health changed");
        }

        let cache = self.cache.stats();
        let circuits = self.breakers.summary();
        let gauges = [
            ("cache.hit_ratio", cache.hit_ratio),
            ("cache.l1_size", cache.l1_size as f64),
            ("cache.l2_size", cache.l2_size as f64),
            ("lb.healthy_backends", self.load_balancer.healthy_count() as f64),
            ("circuits.open", circuits.open_circuits as f64),
        ];
        for (name, value) in gauges {
            self.metrics.record(name, value, Labels::new());
        }

        self.alerts.evaluate(self.metrics.as_ref())
    }

    pub fn status(&self) -> OptimizerStatus {
        OptimizerStatus {
            cache: self.cache.stats(),
            load_balancer: self.load_balancer.stats(),
            circuits: self.breakers.summary(),
            circuit_metrics: self.breakers.all_metrics(),
            metrics: self.metrics.summary(),
            alerts: self.alerts.stats(),
        }
    }

    pub fn status_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.status())
    }

    pub fn health(&self) -> HealthReport {
        let total_backends = self.load_balancer.backends().len();
        let healthy_backends = self.load_balancer.healthy_count();
        let circuits = self.breakers.summary();

        let state = if total_backends > 0 && healthy_backends == 0 {
            HealthState::Unhealthy
        } else if healthy_backends < total_backends
            || circuits.open_circuits > 0
            || circuits.half_open_circuits > 0
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthReport {
            state,
            healthy_backends,
            total_backends,
            open_circuits: circuits.open_circuits,
            half_open_circuits: circuits.half_open_circuits,
            active_alerts: self.alerts.stats().active_alerts,
        }
    }

    fn count(&self, scope: &str, event: &str) {
        self.metrics
            .record(&format!("{}.{}", scope, event), 1.0, Labels::new());
    }
}

impl<V: Clone + Send + Sync + 'static> Optimizer<V> {
    /// Spawn the cache sweep and the periodic [`observe`](Self::observe)
    /// pass at the alert evaluation interval.
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownController) {
        self.cache.start_sweeper(shutdown);

        let optimizer = Arc::clone(self);
        let interval = self.alerts.config().evaluation_interval;
        shutdown.spawn_periodic("optimizer-observer", interval, move || {
            let optimizer = optimizer.clone();
            async move {
                optimizer.observe();
                Ok(())
            }
        });
    }
}

impl<V: Clone> MetricsExport for Optimizer<V> {
    fn export_metrics(&self) -> Vec<(String, f64)> {
        let summary = self.metrics.summary();
        let mut out = self.cache.export_metrics();
        out.extend(self.load_balancer.export_metrics());
        out.extend(self.breakers.export_metrics());
        out.extend(self.alerts.export_metrics());
        out.push(("metrics.total_metrics".to_string(), summary.total_metrics as f64));
        out.push(("metrics.total_samples".to_string(), summary.total_samples as f64));
        out
    }
}
