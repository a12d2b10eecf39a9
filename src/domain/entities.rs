//! Domain Entities - Core business objects
//!
//! These entities represent the state tracked by the resilience layer:
//! cached values, backend targets, metric samples and alerts. They contain
//! only bookkeeping logic; locking lives in the infrastructure layer.

use crate::domain::value_objects::{AlertSeverity, CacheTier, Comparison};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Label set attached to a metric sample.
pub type Labels = BTreeMap<String, String>;

/// Smoothing factor for the rolling response time of a backend.
const RESPONSE_TIME_ALPHA: f64 = 0.3;

/// A cached value with its access metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    /// Last time this entry was read or written
    pub accessed_at: Instant,
    /// Number of reads served from this entry
    pub access_count: u64,
    /// Time-to-live; `None` never expires
    pub ttl: Option<Duration>,
    pub tier: CacheTier,
    /// Monotonic recency stamp used for LRU ordering
    pub(crate) access_seq: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(key: String, value: V, ttl: Option<Duration>, tier: CacheTier, seq: u64) -> Self {
        let now = Instant::now();
        Self {
            key,
            value,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl,
            tier,
            access_seq: seq,
        }
    }

    /// An entry is expired iff `now > created_at + ttl`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => self
                .created_at
                .checked_add(ttl)
                .map(|deadline| now > deadline)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Mark a read hit.
    pub fn touch(&mut self, seq: u64) {
        self.accessed_at = Instant::now();
        self.access_count += 1;
        self.access_seq = seq;
    }
}

/// A backend target that can receive wrapped operations.
///
/// The load balancer mutates connection counts and rolling metrics after
/// every request; the health check derives `healthy` from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendNode {
    /// Unique identifier for this backend
    pub id: String,
    /// Display name
    pub name: String,
    /// Routing priority, bounded to [1, 10] by the adaptive strategy
    pub weight: f64,
    /// Maximum number of concurrent requests (hard cap)
    pub max_connections: u32,
    /// Requests currently in flight
    pub current_connections: u32,
    /// Rolling response time in milliseconds
    pub response_time_ms: f64,
    /// Failed / total requests
    pub error_rate: f64,
    /// Derived health in [0, 1]
    pub health_score: f64,
    /// Whether this backend may be selected
    pub healthy: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    #[serde(skip)]
    pub last_health_check: Option<Instant>,
}

impl BackendNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            weight: 1.0,
            max_connections: 100,
            current_connections: 0,
            response_time_ms: 0.0,
            error_rate: 0.0,
            health_score: 1.0,
            healthy: true,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_health_check: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Reserve a connection slot. Returns false at the hard cap.
    pub fn try_reserve(&mut self) -> bool {
        if self.current_connections < self.max_connections {
            self.current_connections += 1;
            true
        } else {
            false
        }
    }

    /// Release a previously reserved slot.
    pub fn release(&mut self) {
        self.current_connections = self.current_connections.saturating_sub(1);
    }

    /// Fold a completed request into the rolling metrics and health score.
    pub fn record_outcome(&mut self, response_time_ms: f64, success: bool) {
        self.response_time_ms = if self.total_requests == 0 {
            response_time_ms
        } else {
            RESPONSE_TIME_ALPHA * response_time_ms
                + (1.0 - RESPONSE_TIME_ALPHA) * self.response_time_ms
        };

        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        self.error_rate = self.failed_requests as f64 / self.total_requests as f64;
        self.health_score =
            (1.0 - self.error_rate - self.response_time_ms / 1000.0).clamp(0.0, 1.0);
    }

    /// Free share of the connection cap (0 when full or uncapped at zero).
    pub fn connection_headroom(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        1.0 - self.current_connections as f64 / self.max_connections as f64
    }
}

/// One timestamped observation of a metric.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: Instant,
    pub labels: Labels,
}

impl MetricSample {
    pub fn new(value: f64, labels: Labels) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
            labels,
        }
    }
}

/// A threshold rule evaluated against the latest sample of a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: AlertSeverity,
    /// How long the condition must hold before the alert is raised
    pub min_duration: Duration,
    pub enabled: bool,
    pub description: String,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric_name: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            name: name.into(),
            metric_name: metric_name.into(),
            comparison,
            threshold,
            severity,
            min_duration: Duration::ZERO,
            enabled: true,
            description: String::new(),
        }
    }

    pub fn min_duration(mut self, duration: Duration) -> Self {
        self.min_duration = duration;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches(&self, value: f64) -> bool {
        self.comparison.matches(value, self.threshold)
    }
}

/// A raised alert. At most one unresolved alert exists per rule.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_name: String,
    pub metric_name: String,
    pub current_value: f64,
    pub threshold: f64,
    pub comparison: Comparison,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(skip)]
    pub first_seen: Instant,
    /// Updated on every matching evaluation
    #[serde(skip)]
    pub last_seen: Instant,
    pub resolved: bool,
    #[serde(skip)]
    pub resolved_at: Option<Instant>,
}

impl Alert {
    pub fn raise(rule: &AlertRule, value: f64) -> Self {
        let now = Instant::now();
        let label = if rule.description.is_empty() {
            rule.name.as_str()
        } else {
            rule.description.as_str()
        };
        Self {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            metric_name: rule.metric_name.clone(),
            current_value: value,
            threshold: rule.threshold,
            comparison: rule.comparison,
            severity: rule.severity,
            message: format!("{}: {} {} {}", label, value, rule.comparison, rule.threshold),
            first_seen: now,
            last_seen: now,
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn resolve(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(Instant::now());
    }
}
