//! Circuit Registry
//!
//! Named circuit breakers, created on first lookup and kept for the
//! lifetime of the registry.

use crate::config::ConfigError;
use crate::domain::ports::MetricsExport;
use crate::domain::value_objects::CircuitState;
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

/// Breaker counts by state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySummary {
    pub total_circuits: usize,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
    pub closed_circuits: usize,
    pub circuits: Vec<String>,
}

/// Registry of named circuit breakers.
///
/// Each breaker owns its own lock, so breakers never contend with each
/// other; the map itself is only locked per shard during lookup.
pub struct CircuitRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    /// Create a registry whose breakers use `default_config` unless created
    /// with an explicit one.
    pub fn new(default_config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            breakers: DashMap::new(),
        })
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Get an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Get a breaker, creating it with the default config on first lookup.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_validated(
                    name.to_string(),
                    self.default_config.clone(),
                ))
            })
            .clone()
    }

    /// Get a breaker, creating it with `config` on first lookup.
    ///
    /// An existing breaker keeps the config it was created with.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        config.validate()?;
        Ok(self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_validated(name.to_string(), config)))
            .clone())
    }

    /// Remove a breaker. Callers holding its Arc keep a detached copy.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.breakers.remove(name).is_some();
        if removed {
            tracing::info!(circuit = %name, "circuit breaker removed");
        }
        removed
    }

    /// Reset one breaker. Returns false for an unknown name.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker, returning how many were reset.
    pub fn reset_all(&self) -> usize {
        let breakers = self.snapshot();
        for breaker in &breakers {
            breaker.reset();
        }
        breakers.len()
    }

    /// Names of all breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Metrics of all breakers, sorted by name.
    pub fn all_metrics(&self) -> Vec<CircuitMetrics> {
        let mut metrics: Vec<CircuitMetrics> = self.snapshot().iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            circuits: self.names(),
            ..Default::default()
        };
        for breaker in self.snapshot() {
            summary.total_circuits += 1;
            match breaker.state() {
                CircuitState::Open => summary.open_circuits += 1,
                CircuitState::HalfOpen => summary.half_open_circuits += 1,
                CircuitState::Closed => summary.closed_circuits += 1,
            }
        }
        summary
    }

    /// Clone the Arcs out so no shard lock is held while breakers lock.
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self {
            default_config: CircuitBreakerConfig::default(),
            breakers: DashMap::new(),
        }
    }
}

impl MetricsExport for CircuitRegistry {
    fn export_metrics(&self) -> Vec<(String, f64)> {
        let summary = self.summary();
        let mut out = vec![
            ("circuits.total".to_string(), summary.total_circuits as f64),
            ("circuits.open".to_string(), summary.open_circuits as f64),
            ("circuits.half_open".to_string(), summary.half_open_circuits as f64),
        ];
        for m in self.all_metrics() {
            let prefix = format!("circuit.{}", m.name);
            out.push((format!("{}.state", prefix), m.state.as_gauge()));
            out.push((format!("{}.total_requests", prefix), m.total_requests as f64));
            out.push((format!("{}.failed_requests", prefix), m.failed_requests as f64));
            out.push((format!("{}.timeout_requests", prefix), m.timeout_requests as f64));
            out.push((format!("{}.rejected_requests", prefix), m.rejected_requests as f64));
            out.push((format!("{}.opens", prefix), m.circuit_opens as f64));
        }
        out
    }
}
