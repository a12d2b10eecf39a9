//! Load Balancer
//!
//! Backend pool with strategy-based selection, exact connection accounting
//! and per-backend health metrics.

use crate::config::ConfigError;
use crate::domain::entities::BackendNode;
use crate::domain::ports::MetricsExport;
use crate::domain::services::{BackendSelector, SelectionParams};
use crate::domain::value_objects::Strategy;
use parking_lot::Mutex;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::time::Instant;

/// Load balancer configuration.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub strategy: Strategy,
    /// Response time at or above which a backend fails the health check
    pub response_time_threshold_ms: f64,
    /// Error rate at or above which a backend fails the health check
    pub error_rate_threshold: f64,
    /// Health score a backend must exceed to pass the health check
    pub min_health_score: f64,
    /// Weight nudge of the adaptive strategy
    pub adaptive_weight_step: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Adaptive,
            response_time_threshold_ms: 1000.0,
            error_rate_threshold: 0.1,
            min_health_score: 0.5,
            adaptive_weight_step: 0.1,
        }
    }
}

impl LoadBalancerConfig {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn response_time_threshold_ms(mut self, threshold: f64) -> Self {
        self.response_time_threshold_ms = threshold;
        self
    }

    pub fn error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    pub fn min_health_score(mut self, score: f64) -> Self {
        self.min_health_score = score;
        self
    }

    pub fn adaptive_weight_step(mut self, step: f64) -> Self {
        self.adaptive_weight_step = step;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.response_time_threshold_ms > 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "response_time_threshold_ms",
                value: self.response_time_threshold_ms,
            });
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "error_rate_threshold",
                value: self.error_rate_threshold,
            });
        }
        if !(0.0..=1.0).contains(&self.min_health_score) {
            return Err(ConfigError::OutOfRange {
                field: "min_health_score",
                value: self.min_health_score,
            });
        }
        if !(self.adaptive_weight_step >= 0.0 && self.adaptive_weight_step.is_finite()) {
            return Err(ConfigError::OutOfRange {
                field: "adaptive_weight_step",
                value: self.adaptive_weight_step,
            });
        }
        Ok(())
    }

    fn selection_params(&self) -> SelectionParams {
        SelectionParams {
            response_time_threshold_ms: self.response_time_threshold_ms,
            adaptive_weight_step: self.adaptive_weight_step,
        }
    }
}

/// Load balancer errors.
#[derive(Debug, thiserror::Error)]
pub enum LoadBalancerError<E = Infallible> {
    #[error("no backend available")]
    NoBackendAvailable,
    #[error("connection limit exceeded for backend '{backend_id}'")]
    ConnectionLimitExceeded { backend_id: String },
    /// The operation's own error, passed through unchanged
    #[error("{0}")]
    Operation(E),
}

impl<E> LoadBalancerError<E> {
    /// The downstream error, if the operation itself failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl LoadBalancerError<Infallible> {
    /// Widen a selection error into any operation error type.
    pub fn widen<E>(self) -> LoadBalancerError<E> {
        match self {
            Self::NoBackendAvailable => LoadBalancerError::NoBackendAvailable,
            Self::ConnectionLimitExceeded { backend_id } => {
                LoadBalancerError::ConnectionLimitExceeded { backend_id }
            }
            Self::Operation(never) => match never {},
        }
    }
}

/// Health check result for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub id: String,
    pub healthy: bool,
    /// Whether this check flipped the healthy flag
    pub changed: bool,
    pub health_score: f64,
    pub error_rate: f64,
    pub response_time_ms: f64,
}

/// Pool-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub strategy: Strategy,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Successful / total, 0 before the first request
    pub success_rate: f64,
    /// Mean over successful requests only, 0 before the first success
    pub average_response_time_ms: f64,
    pub backends: Vec<BackendNode>,
}

struct PoolState {
    backends: Vec<BackendNode>,
    /// Rotation state of the round-robin strategies
    counter: u64,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    average_response_time_ms: f64,
}

impl PoolState {
    fn new() -> Self {
        Self {
            backends: Vec::new(),
            counter: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time_ms: 0.0,
        }
    }
}

/// Load balancer over a pool of backends.
///
/// Selection, slot reservation and slot release all happen under the pool
/// lock; the wrapped operation runs outside it.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    params: SelectionParams,
    pool: Mutex<PoolState>,
}

impl LoadBalancer {
    /// Create a new load balancer.
    pub fn new(config: LoadBalancerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            params: config.selection_params(),
            config,
            pool: Mutex::new(PoolState::new()),
        })
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.config.strategy
    }

    /// Add a backend. Returns false if the id is already in the pool.
    pub fn add_backend(&self, node: BackendNode) -> bool {
        let mut pool = self.pool.lock();
        if pool.backends.iter().any(|b| b.id == node.id) {
            tracing::warn!(backend = %node.id, "backend already registered");
            return false;
        }
        tracing::info!(backend = %node.id, name = %node.name, weight = node.weight, "backend added");
        pool.backends.push(node);
        true
    }

    /// Remove a backend. In-flight calls on it finish without bookkeeping.
    pub fn remove_backend(&self, id: &str) -> bool {
        let mut pool = self.pool.lock();
        let before = pool.backends.len();
        pool.backends.retain(|b| b.id != id);
        let removed = pool.backends.len() != before;
        if removed {
            tracing::info!(backend = %id, "backend removed");
        }
        removed
    }

    /// Operator override of a backend's healthy flag.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> bool {
        let mut pool = self.pool.lock();
        match pool.backends.iter_mut().find(|b| b.id == id) {
            Some(backend) => {
                backend.healthy = healthy;
                true
            }
            None => false,
        }
    }

    /// Snapshot of one backend.
    pub fn get(&self, id: &str) -> Option<BackendNode> {
        self.pool.lock().backends.iter().find(|b| b.id == id).cloned()
    }

    /// Snapshot of every backend, in insertion order.
    pub fn backends(&self) -> Vec<BackendNode> {
        self.pool.lock().backends.clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.pool.lock().backends.iter().filter(|b| b.healthy).count()
    }

    /// Select a healthy backend according to the configured strategy.
    pub fn select_backend(&self) -> Result<BackendNode, LoadBalancerError> {
        let mut guard = self.pool.lock();
        let pool = &mut *guard;
        let index = BackendSelector::select(
            self.config.strategy,
            &mut pool.backends,
            &mut pool.counter,
            &self.params,
        )
        .ok_or(LoadBalancerError::NoBackendAvailable)?;
        Ok(pool.backends[index].clone())
    }

    /// Select a backend and run `op` against it.
    ///
    /// The connection slot is released and the outcome recorded when the
    /// operation completes, fails, or the returned future is dropped (which
    /// counts as a failed request).
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, LoadBalancerError<E>>
    where
        F: FnOnce(BackendNode) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (node, slot) = self.reserve().map_err(LoadBalancerError::widen)?;
        let result = op(node).await;
        slot.finish(result.is_ok());
        result.map_err(LoadBalancerError::Operation)
    }

    /// Blocking form of [`execute`](Self::execute).
    pub fn execute_blocking<T, E, F>(&self, op: F) -> Result<T, LoadBalancerError<E>>
    where
        F: FnOnce(BackendNode) -> Result<T, E>,
    {
        let (node, slot) = self.reserve().map_err(LoadBalancerError::widen)?;
        let result = op(node);
        slot.finish(result.is_ok());
        result.map_err(LoadBalancerError::Operation)
    }

    /// Recompute every backend's healthy flag from its metrics.
    pub fn health_check(&self) -> Vec<BackendHealth> {
        let now = Instant::now();
        let mut pool = self.pool.lock();
        let mut report = Vec::with_capacity(pool.backends.len());

        for backend in pool.backends.iter_mut() {
            let healthy = backend.error_rate < self.config.error_rate_threshold
                && backend.response_time_ms < self.config.response_time_threshold_ms
                && backend.health_score > self.config.min_health_score;

            let changed = healthy != backend.healthy;
            backend.healthy = healthy;
            backend.last_health_check = Some(now);

            if !healthy {
                tracing::warn!(
                    backend = %backend.id,
                    score = backend.health_score,
                    error_rate = backend.error_rate,
                    response_time_ms = backend.response_time_ms,
                    "backend unhealthy"
                );
            } else if changed {
                tracing::info!(backend = %backend.id, "backend recovered");
            }

            report.push(BackendHealth {
                id: backend.id.clone(),
                healthy,
                changed,
                health_score: backend.health_score,
                error_rate: backend.error_rate,
                response_time_ms: backend.response_time_ms,
            });
        }

        report
    }

    /// Adaptive scores of the healthy backends (for diagnostics).
    pub fn adaptive_scores(&self) -> Vec<(String, f64)> {
        let pool = self.pool.lock();
        BackendSelector::calculate_all_scores(&pool.backends, &self.params)
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let pool = self.pool.lock();
        LoadBalancerStats {
            strategy: self.config.strategy,
            total_backends: pool.backends.len(),
            healthy_backends: pool.backends.iter().filter(|b| b.healthy).count(),
            total_requests: pool.total_requests,
            successful_requests: pool.successful_requests,
            failed_requests: pool.failed_requests,
            success_rate: if pool.total_requests == 0 {
                0.0
            } else {
                pool.successful_requests as f64 / pool.total_requests as f64
            },
            average_response_time_ms: pool.average_response_time_ms,
            backends: pool.backends.clone(),
        }
    }

    /// Select a backend and reserve one of its slots in one critical section.
    fn reserve(&self) -> Result<(BackendNode, SlotGuard<'_>), LoadBalancerError> {
        let mut guard = self.pool.lock();
        let pool = &mut *guard;
        let index = BackendSelector::select(
            self.config.strategy,
            &mut pool.backends,
            &mut pool.counter,
            &self.params,
        )
        .ok_or(LoadBalancerError::NoBackendAvailable)?;

        let backend = &mut pool.backends[index];
        if !backend.try_reserve() {
            tracing::warn!(
                backend = %backend.id,
                max = backend.max_connections,
                "connection limit exceeded"
            );
            return Err(LoadBalancerError::ConnectionLimitExceeded {
                backend_id: backend.id.clone(),
            });
        }

        let node = backend.clone();
        Ok((
            node.clone(),
            SlotGuard {
                lb: self,
                backend_id: node.id,
                started: Instant::now(),
                finished: false,
            },
        ))
    }

    fn complete(&self, backend_id: &str, response_time_ms: f64, success: bool) {
        let mut pool = self.pool.lock();

        pool.total_requests += 1;
        if success {
            pool.successful_requests += 1;
            let n = pool.successful_requests as f64;
            pool.average_response_time_ms += (response_time_ms - pool.average_response_time_ms) / n;
        } else {
            pool.failed_requests += 1;
        }

        if let Some(backend) = pool.backends.iter_mut().find(|b| b.id == backend_id) {
            backend.release();
            backend.record_outcome(response_time_ms, success);
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        let config = LoadBalancerConfig::default();
        Self {
            params: config.selection_params(),
            config,
            pool: Mutex::new(PoolState::new()),
        }
    }
}

impl MetricsExport for LoadBalancer {
    fn export_metrics(&self) -> Vec<(String, f64)> {
        let stats = self.stats();
        let mut out = vec![
            ("lb.total_backends".to_string(), stats.total_backends as f64),
            ("lb.healthy_backends".to_string(), stats.healthy_backends as f64),
            ("lb.total_requests".to_string(), stats.total_requests as f64),
            ("lb.failed_requests".to_string(), stats.failed_requests as f64),
            ("lb.success_rate".to_string(), stats.success_rate),
            ("lb.average_response_time_ms".to_string(), stats.average_response_time_ms),
        ];
        for b in &stats.backends {
            let prefix = format!("lb.backend.{}", b.id);
            out.push((format!("{}.connections", prefix), b.current_connections as f64));
            out.push((format!("{}.response_time_ms", prefix), b.response_time_ms));
            out.push((format!("{}.error_rate", prefix), b.error_rate));
            out.push((format!("{}.health_score", prefix), b.health_score));
            out.push((format!("{}.weight", prefix), b.weight));
            out.push((format!("{}.healthy", prefix), if b.healthy { 1.0 } else { 0.0 }));
        }
        out
    }
}

/// RAII guard for a reserved connection slot.
///
/// Releases the slot exactly once; dropping it unfinished records a failure.
struct SlotGuard<'a> {
    lb: &'a LoadBalancer,
    backend_id: String,
    started: Instant,
    finished: bool,
}

impl SlotGuard<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.lb.complete(&self.backend_id, elapsed_ms, success);
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            tracing::debug!(backend = %self.backend_id, "request dropped before completion");
            self.lb.complete(&self.backend_id, elapsed_ms, false);
        }
    }
}
