//! Alert Engine
//!
//! Evaluates threshold rules against the latest sample of each metric,
//! keeps at most one open alert per rule and notifies handlers when an
//! alert is raised.

use crate::config::ConfigError;
use crate::domain::entities::{Alert, AlertRule};
use crate::domain::ports::{MetricsExport, MetricsStore};
use crate::infrastructure::shutdown::ShutdownController;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Alerting configuration.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Alerts not seen for this long are purged, resolved or not
    pub retention: Duration,
    /// Interval of the background evaluation pass
    pub evaluation_interval: Duration,
    /// Maximum alerts kept; the oldest resolved alerts are dropped first and
    /// open alerts are never dropped
    pub max_alerts: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            evaluation_interval: Duration::from_secs(30),
            max_alerts: 1000,
        }
    }
}

impl AlertConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval;
        self
    }

    pub fn max_alerts(mut self, max: usize) -> Self {
        self.max_alerts = max;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::Zero("evaluation_interval"));
        }
        if self.max_alerts == 0 {
            return Err(ConfigError::Zero("max_alerts"));
        }
        Ok(())
    }
}

/// Callback invoked once when an alert is raised.
pub type AlertHandler = Arc<dyn Fn(&Alert) + Send + Sync>;

/// Alert counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStats {
    pub total_alerts: usize,
    pub active_alerts: usize,
    pub resolved_alerts: usize,
    /// All retained alerts by severity
    pub by_severity: BTreeMap<String, usize>,
    pub rules: usize,
    pub enabled_rules: usize,
}

struct EngineState {
    rules: Vec<AlertRule>,
    /// First time each rule matched in its current streak
    pending_since: HashMap<String, Instant>,
    alerts: VecDeque<Alert>,
}

/// Rule evaluator over a metrics store.
pub struct AlertEngine {
    config: AlertConfig,
    state: Mutex<EngineState>,
    handlers: RwLock<Vec<AlertHandler>>,
}

impl AlertEngine {
    /// Create a new alert engine.
    pub fn new(config: AlertConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(EngineState {
                rules: Vec::new(),
                pending_since: HashMap::new(),
                alerts: VecDeque::new(),
            }),
            handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Add a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: AlertRule) {
        let mut state = self.state.lock();
        tracing::info!(rule = %rule.name, metric = %rule.metric_name, "alert rule added");
        match state.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => state.rules.push(rule),
        }
    }

    /// Remove a rule. Its alerts stay until they age out.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.name != name);
        state.pending_since.remove(name);
        state.rules.len() != before
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.state.lock();
        match state.rules.iter_mut().find(|r| r.name == name) {
            Some(rule) => {
                rule.enabled = enabled;
                if !enabled {
                    state.pending_since.remove(name);
                }
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.state.lock().rules.clone()
    }

    /// Register a handler called for every newly raised alert.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Run one evaluation pass and return the newly raised alerts.
    ///
    /// A rule whose metric has no sample is skipped. A matching rule with an
    /// open alert updates it in place; a rule that stops matching resolves
    /// its open alert. Handlers run after the engine lock is released.
    pub fn evaluate(&self, store: &dyn MetricsStore) -> Vec<Alert> {
        let rules: Vec<AlertRule> = self
            .state
            .lock()
            .rules
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        // Read the store without holding the engine lock
        let readings: Vec<(AlertRule, f64)> = rules
            .into_iter()
            .filter_map(|rule| {
                let value = store.latest(&rule.metric_name)?.value;
                Some((rule, value))
            })
            .collect();

        let now = Instant::now();
        let mut raised = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for (rule, value) in &readings {
                let open = state
                    .alerts
                    .iter_mut()
                    .find(|a| a.rule_name == rule.name && !a.resolved);

                if rule.matches(*value) {
                    if let Some(alert) = open {
                        alert.current_value = *value;
                        alert.last_seen = now;
                        continue;
                    }

                    let since = *state.pending_since.entry(rule.name.clone()).or_insert(now);
                    if now.duration_since(since) < rule.min_duration {
                        continue;
                    }

                    state.pending_since.remove(&rule.name);
                    let alert = Alert::raise(rule, *value);
                    tracing::warn!(
                        rule = %rule.name,
                        severity = %rule.severity,
                        value = *value,
                        threshold = rule.threshold,
                        "alert raised"
                    );
                    raised.push(alert.clone());
                    state.alerts.push_back(alert);
                } else {
                    state.pending_since.remove(&rule.name);
                    if let Some(alert) = open {
                        alert.current_value = *value;
                        alert.resolve();
                        tracing::info!(rule = %rule.name, value = *value, "alert resolved");
                    }
                }
            }

            self.purge_locked(state, now);
        }

        self.notify(&raised);
        raised
    }

    /// Unresolved alerts, oldest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Every retained alert, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.iter().cloned().collect()
    }

    pub fn stats(&self) -> AlertStats {
        let state = self.state.lock();
        let mut stats = AlertStats {
            total_alerts: state.alerts.len(),
            rules: state.rules.len(),
            enabled_rules: state.rules.iter().filter(|r| r.enabled).count(),
            ..Default::default()
        };
        for alert in &state.alerts {
            if alert.resolved {
                stats.resolved_alerts += 1;
            } else {
                stats.active_alerts += 1;
            }
            *stats
                .by_severity
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Evaluate rules against `store` every evaluation interval.
    pub fn start(self: &Arc<Self>, store: Arc<dyn MetricsStore>, shutdown: &ShutdownController) {
        let engine = Arc::clone(self);
        shutdown.spawn_periodic("alert-evaluator", self.config.evaluation_interval, move || {
            let engine = engine.clone();
            let store = store.clone();
            async move {
                engine.evaluate(store.as_ref());
                Ok(())
            }
        });
    }

    fn purge_locked(&self, state: &mut EngineState, now: Instant) {
        let retention = self.config.retention;
        state
            .alerts
            .retain(|a| now.duration_since(a.last_seen) <= retention);

        // Over the cap, drop the oldest resolved alerts; open alerts stay
        let mut excess = state.alerts.len().saturating_sub(self.config.max_alerts);
        if excess > 0 {
            state.alerts.retain(|a| {
                if excess > 0 && a.resolved {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    fn notify(&self, raised: &[Alert]) {
        if raised.is_empty() {
            return;
        }
        let handlers: Vec<AlertHandler> = self.handlers.read().clone();
        for alert in raised {
            for handler in &handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(alert))).is_err() {
                    tracing::error!(rule = %alert.rule_name, "alert handler panicked");
                }
            }
        }
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self {
            config: AlertConfig::default(),
            state: Mutex::new(EngineState {
                rules: Vec::new(),
                pending_since: HashMap::new(),
                alerts: VecDeque::new(),
            }),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl MetricsExport for AlertEngine {
    fn export_metrics(&self) -> Vec<(String, f64)> {
        let stats = self.stats();
        let mut out = vec![
            ("alerts.total".to_string(), stats.total_alerts as f64),
            ("alerts.active".to_string(), stats.active_alerts as f64),
            ("alerts.resolved".to_string(), stats.resolved_alerts as f64),
        ];
        for (severity, count) in stats.by_severity {
            out.push((format!("alerts.severity.{}", severity), count as f64));
        }
        out
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::RingBufferMetricsStore;
    use crate::domain::entities::Labels;
    use crate::domain::value_objects::{AlertSeverity, Comparison};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ===== Test Helpers =====

    fn cpu_rule() -> AlertRule {
        AlertRule::new("high-cpu", "cpu", Comparison::GreaterThan, 80.0, AlertSeverity::Warning)
    }

    fn record(store: &RingBufferMetricsStore, value: f64) {
        store.record("cpu", value, Labels::new());
    }

    // ===== Evaluation Tests =====

    #[test]
    fn test_single_alert_raised_updated_then_resolved() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule());

        record(&store, 70.0);
        assert!(engine.evaluate(&store).is_empty());
        assert!(engine.active_alerts().is_empty());

        record(&store, 90.0);
        let raised = engine.evaluate(&store);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].message, "high-cpu: 90 > 80");

        record(&store, 95.0);
        assert!(engine.evaluate(&store).is_empty());
        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].current_value, 95.0);
        assert_eq!(active[0].id, raised[0].id);

        record(&store, 80.0);
        assert!(engine.evaluate(&store).is_empty());
        assert!(engine.active_alerts().is_empty());

        let all = engine.alerts();
        assert_eq!(all.len(), 1);
        assert!(all[0].resolved);
        assert!(all[0].resolved_at.is_some());
    }

    #[test]
    fn test_rematch_after_resolution_raises_new_alert() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule());

        record(&store, 90.0);
        engine.evaluate(&store);
        record(&store, 10.0);
        engine.evaluate(&store);
        record(&store, 99.0);
        engine.evaluate(&store);

        let stats = engine.stats();
        assert_eq!(stats.total_alerts, 2);
        assert_eq!(stats.active_alerts, 1);
        assert_eq!(stats.resolved_alerts, 1);
        assert_eq!(stats.by_severity.get("warning"), Some(&2));
    }

    #[test]
    fn test_missing_metric_and_disabled_rule_are_skipped() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule().disabled());
        engine.add_rule(AlertRule::new(
            "no-data",
            "missing",
            Comparison::LessThan,
            1.0,
            AlertSeverity::Info,
        ));

        record(&store, 99.0);
        assert!(engine.evaluate(&store).is_empty());

        assert!(engine.set_rule_enabled("high-cpu", true));
        assert_eq!(engine.evaluate(&store).len(), 1);
        assert!(!engine.set_rule_enabled("unknown", true));
    }

    #[test]
    fn test_min_duration_delays_raise() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule().min_duration(Duration::from_millis(30)));

        record(&store, 90.0);
        assert!(engine.evaluate(&store).is_empty());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(engine.evaluate(&store).len(), 1);
    }

    #[test]
    fn test_min_duration_streak_resets_on_mismatch() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule().min_duration(Duration::from_millis(30)));

        record(&store, 90.0);
        engine.evaluate(&store);
        std::thread::sleep(Duration::from_millis(40));
        record(&store, 50.0);
        engine.evaluate(&store);
        record(&store, 90.0);

        // new streak starts now
        assert!(engine.evaluate(&store).is_empty());
    }

    #[test]
    fn test_add_rule_replaces_by_name_and_remove() {
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule());
        engine.add_rule(cpu_rule().description("cpu above 80%"));

        let rules = engine.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].description, "cpu above 80%");

        assert!(engine.remove_rule("high-cpu"));
        assert!(!engine.remove_rule("high-cpu"));
    }

    #[test]
    fn test_description_used_in_message() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule().description("cpu hot"));
        record(&store, 85.5);

        let raised = engine.evaluate(&store);
        assert_eq!(raised[0].message, "cpu hot: 85.5 > 80");
    }

    // ===== Handler Tests =====

    #[test]
    fn test_handlers_notified_once_per_alert() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        engine.add_handler(move |_alert| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for v in [90.0, 95.0, 99.0] {
            record(&store, v);
            engine.evaluate(&store);
        }
        record(&store, 10.0);
        engine.evaluate(&store);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_affect_others() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule());

        let calls = Arc::new(AtomicUsize::new(0));
        engine.add_handler(|_| panic!("handler failure"));
        let counter = calls.clone();
        engine.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        record(&store, 90.0);
        assert_eq!(engine.evaluate(&store).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn test_handler_may_query_engine() {
        let store = RingBufferMetricsStore::default();
        let engine = Arc::new(AlertEngine::default());
        engine.add_rule(cpu_rule());

        let seen = Arc::new(AtomicUsize::new(0));
        let inner = engine.clone();
        let counter = seen.clone();
        engine.add_handler(move |_| {
            // would deadlock if handlers ran under the engine lock
            counter.store(inner.active_alerts().len(), Ordering::SeqCst);
        });

        record(&store, 90.0);
        engine.evaluate(&store);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // ===== Retention Tests =====

    #[test]
    fn test_retention_purges_old_alerts() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::new(AlertConfig::new().retention(Duration::from_millis(20))).unwrap();
        engine.add_rule(cpu_rule());

        record(&store, 90.0);
        engine.evaluate(&store);
        record(&store, 10.0);
        engine.evaluate(&store);
        assert_eq!(engine.alerts().len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        engine.evaluate(&store);
        assert!(engine.alerts().is_empty());
    }

    #[test]
    fn test_max_alerts_drops_oldest_resolved() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::new(AlertConfig::new().max_alerts(2)).unwrap();
        engine.add_rule(cpu_rule());

        let mut ids = Vec::new();
        for _ in 0..3 {
            record(&store, 90.0);
            ids.push(engine.evaluate(&store)[0].id);
            record(&store, 10.0);
            engine.evaluate(&store);
        }

        let kept: Vec<_> = engine.alerts().into_iter().map(|a| a.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }

    #[test]
    fn test_max_alerts_never_drops_open_alerts() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::new(AlertConfig::new().max_alerts(1)).unwrap();
        engine.add_rule(cpu_rule());
        engine.add_rule(AlertRule::new(
            "cpu-critical",
            "cpu",
            Comparison::GreaterThan,
            85.0,
            AlertSeverity::Critical,
        ));

        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        engine.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            record(&store, 90.0);
            engine.evaluate(&store);
        }

        assert_eq!(notifications.load(Ordering::SeqCst), 2);
        assert_eq!(engine.active_alerts().len(), 2);
    }

    #[test]
    fn test_resolved_history_trimmed_behind_open_alert() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::new(AlertConfig::new().max_alerts(1)).unwrap();
        engine.add_rule(cpu_rule());

        record(&store, 90.0);
        engine.evaluate(&store);
        record(&store, 10.0);
        engine.evaluate(&store);
        record(&store, 95.0);
        engine.evaluate(&store);

        let alerts = engine.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].resolved);
        assert_eq!(alerts[0].current_value, 95.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(AlertEngine::new(AlertConfig::new().max_alerts(0)).is_err());
        assert!(AlertEngine::new(AlertConfig::new().evaluation_interval(Duration::ZERO)).is_err());
    }

    // ===== Background Tests =====

    #[tokio::test]
    async fn test_start_evaluates_periodically() {
        let store = Arc::new(RingBufferMetricsStore::default());
        let engine = Arc::new(
            AlertEngine::new(AlertConfig::new().evaluation_interval(Duration::from_millis(10))).unwrap(),
        );
        engine.add_rule(cpu_rule());
        record(&store, 90.0);

        let shutdown = ShutdownController::new();
        engine.start(store.clone(), &shutdown);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.active_alerts().len(), 1);

        shutdown.shutdown();
        assert!(shutdown.join(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_export_metrics() {
        let store = RingBufferMetricsStore::default();
        let engine = AlertEngine::default();
        engine.add_rule(cpu_rule());
        record(&store, 90.0);
        engine.evaluate(&store);

        let exported = engine.export_metrics();
        assert!(exported.contains(&("alerts.active".to_string(), 1.0)));
        assert!(exported.contains(&("alerts.severity.warning".to_string(), 1.0)));
    }
}
