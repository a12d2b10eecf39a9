//! Process configuration
//!
//! Flat settings loaded from `RESILIENCE_*` environment variables and
//! converted into the per-component configuration structs.

use crate::adapters::outbound::ring_buffer_metrics_store::MetricsConfig;
use crate::domain::value_objects::Strategy;
use crate::infrastructure::alert_engine::AlertConfig;
use crate::infrastructure::circuit_breaker::CircuitBreakerConfig;
use crate::infrastructure::load_balancer::LoadBalancerConfig;
use crate::infrastructure::tiered_cache::CacheConfig;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "RESILIENCE_";
const SECS_PER_HOUR: u64 = 3600;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Cache settings
    pub cache_l1_capacity: usize,
    pub cache_l2_capacity: usize,
    pub cache_default_ttl_secs: u64,
    pub cache_cleanup_interval_secs: u64,

    // Load balancer settings
    pub lb_strategy: Strategy,
    pub lb_response_time_threshold_ms: f64,
    pub lb_error_rate_threshold: f64,
    pub lb_min_health_score: f64,
    pub lb_adaptive_weight_step: f64,

    // Circuit breaker settings
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout_secs: u64,
    pub breaker_success_threshold: u32,
    pub breaker_timeout_secs: Option<f64>,

    // Alerting settings
    pub alert_retention_hours: u64,
    pub alert_evaluation_interval_secs: u64,
    pub alert_max_alerts: usize,

    // Metric store settings
    pub metrics_sample_capacity: usize,
    pub metrics_active_window_secs: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_l1_capacity: 1000,
            cache_l2_capacity: 10_000,
            cache_default_ttl_secs: 300,
            cache_cleanup_interval_secs: 60,
            lb_strategy: Strategy::Adaptive,
            lb_response_time_threshold_ms: 1000.0,
            lb_error_rate_threshold: 0.1,
            lb_min_health_score: 0.5,
            lb_adaptive_weight_step: 0.1,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_secs: 60,
            breaker_success_threshold: 2,
            breaker_timeout_secs: None,
            alert_retention_hours: 24,
            alert_evaluation_interval_secs: 30,
            alert_max_alerts: 1000,
            metrics_sample_capacity: 10_000,
            metrics_active_window_secs: 300,
            debug: false,
        }
    }
}

impl Config {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .l1_capacity(self.cache_l1_capacity)
            .l2_capacity(self.cache_l2_capacity)
            .default_ttl(Duration::from_secs(self.cache_default_ttl_secs))
            .cleanup_interval(Duration::from_secs(self.cache_cleanup_interval_secs))
    }

    pub fn load_balancer_config(&self) -> LoadBalancerConfig {
        LoadBalancerConfig::new(self.lb_strategy)
            .response_time_threshold_ms(self.lb_response_time_threshold_ms)
            .error_rate_threshold(self.lb_error_rate_threshold)
            .min_health_score(self.lb_min_health_score)
            .adaptive_weight_step(self.lb_adaptive_weight_step)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let timeout = self
            .breaker_timeout_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        CircuitBreakerConfig::new()
            .failure_threshold(self.breaker_failure_threshold)
            .recovery_timeout(Duration::from_secs(self.breaker_recovery_timeout_secs))
            .success_threshold(self.breaker_success_threshold)
            .timeout(timeout)
    }

    pub fn alert_config(&self) -> AlertConfig {
        AlertConfig::new()
            .retention(Duration::from_secs(
                self.alert_retention_hours.saturating_mul(SECS_PER_HOUR),
            ))
            .evaluation_interval(Duration::from_secs(self.alert_evaluation_interval_secs))
            .max_alerts(self.alert_max_alerts)
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig::new()
            .sample_capacity(self.metrics_sample_capacity)
            .active_window(Duration::from_secs(self.metrics_active_window_secs))
    }

    /// Validate every component section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alert_retention_hours.checked_mul(SECS_PER_HOUR).is_none() {
            return Err(ConfigError::OutOfRange {
                field: "alert_retention_hours",
                value: self.alert_retention_hours as f64,
            });
        }
        self.cache_config().validate()?;
        self.load_balancer_config().validate()?;
        self.circuit_breaker_config().validate()?;
        self.alert_config().validate()?;
        self.metrics_config().validate()?;
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown load balancing strategy: {0}")]
    UnknownStrategy(String),
    #[error("unknown comparison operator: {0}")]
    UnknownComparison(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Load configuration from the process environment.
pub fn load_config() -> anyhow::Result<Config> {
    let mut config = load_config_from(|key| std::env::var(key).ok())?;
    config.debug = std::env::var("DEBUG").is_ok();
    Ok(config)
}

/// Load configuration through an arbitrary variable lookup.
///
/// Malformed numbers fall back to their defaults. An unknown strategy name
/// or a value rejected by validation is an error.
pub fn load_config_from<F>(lookup: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();
    let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

    let lb_strategy = match var("LB_STRATEGY") {
        Some(raw) => Strategy::from_str(&raw)?,
        None => defaults.lb_strategy,
    };

    let config = Config {
        cache_l1_capacity: parse_or(var("CACHE_L1_CAPACITY"), defaults.cache_l1_capacity),
        cache_l2_capacity: parse_or(var("CACHE_L2_CAPACITY"), defaults.cache_l2_capacity),
        cache_default_ttl_secs: parse_or(
            var("CACHE_DEFAULT_TTL_SECS"),
            defaults.cache_default_ttl_secs,
        ),
        cache_cleanup_interval_secs: parse_or(
            var("CACHE_CLEANUP_INTERVAL_SECS"),
            defaults.cache_cleanup_interval_secs,
        ),
        lb_strategy,
        lb_response_time_threshold_ms: parse_or(
            var("LB_RESPONSE_TIME_THRESHOLD_MS"),
            defaults.lb_response_time_threshold_ms,
        ),
        lb_error_rate_threshold: parse_or(
            var("LB_ERROR_RATE_THRESHOLD"),
            defaults.lb_error_rate_threshold,
        ),
        lb_min_health_score: parse_or(var("LB_MIN_HEALTH_SCORE"), defaults.lb_min_health_score),
        lb_adaptive_weight_step: parse_or(
            var("LB_ADAPTIVE_WEIGHT_STEP"),
            defaults.lb_adaptive_weight_step,
        ),
        breaker_failure_threshold: parse_or(
            var("BREAKER_FAILURE_THRESHOLD"),
            defaults.breaker_failure_threshold,
        ),
        breaker_recovery_timeout_secs: parse_or(
            var("BREAKER_RECOVERY_TIMEOUT_SECS"),
            defaults.breaker_recovery_timeout_secs,
        ),
        breaker_success_threshold: parse_or(
            var("BREAKER_SUCCESS_THRESHOLD"),
            defaults.breaker_success_threshold,
        ),
        breaker_timeout_secs: var("BREAKER_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()),
        alert_retention_hours: parse_or(
            var("ALERT_RETENTION_HOURS"),
            defaults.alert_retention_hours,
        ),
        alert_evaluation_interval_secs: parse_or(
            var("ALERT_EVALUATION_INTERVAL_SECS"),
            defaults.alert_evaluation_interval_secs,
        ),
        alert_max_alerts: parse_or(var("ALERT_MAX_ALERTS"), defaults.alert_max_alerts),
        metrics_sample_capacity: parse_or(
            var("METRICS_SAMPLE_CAPACITY"),
            defaults.metrics_sample_capacity,
        ),
        metrics_active_window_secs: parse_or(
            var("METRICS_ACTIVE_WINDOW_SECS"),
            defaults.metrics_active_window_secs,
        ),
        debug: false,
    };

    config.validate()?;
    Ok(config)
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = load_config_from(lookup(&[])).unwrap();
        assert_eq!(config.cache_l1_capacity, 1000);
        assert_eq!(config.cache_l2_capacity, 10_000);
        assert_eq!(config.cache_default_ttl_secs, 300);
        assert_eq!(config.lb_strategy, Strategy::Adaptive);
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.breaker_success_threshold, 2);
        assert!(config.breaker_timeout_secs.is_none());
        assert_eq!(config.alert_retention_hours, 24);
        assert_eq!(config.alert_evaluation_interval_secs, 30);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = load_config_from(lookup(&[
            ("RESILIENCE_CACHE_L1_CAPACITY", "16"),
            ("RESILIENCE_LB_STRATEGY", "least-connections"),
            ("RESILIENCE_BREAKER_FAILURE_THRESHOLD", "3"),
            ("RESILIENCE_BREAKER_TIMEOUT_SECS", "1.5"),
        ]))
        .unwrap();

        assert_eq!(config.cache_l1_capacity, 16);
        assert_eq!(config.lb_strategy, Strategy::LeastConnections);
        assert_eq!(config.breaker_failure_threshold, 3);

        let breaker = config.circuit_breaker_config();
        assert_eq!(breaker.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_malformed_numbers_fall_back_to_defaults() {
        let config = load_config_from(lookup(&[
            ("RESILIENCE_CACHE_L2_CAPACITY", "lots"),
            ("RESILIENCE_LB_ERROR_RATE_THRESHOLD", "ten percent"),
            ("RESILIENCE_BREAKER_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap();

        assert_eq!(config.cache_l2_capacity, 10_000);
        assert_eq!(config.lb_error_rate_threshold, 0.1);
        assert!(config.breaker_timeout_secs.is_none());
    }

    #[test]
    fn test_unknown_strategy_is_an_error() {
        let err = load_config_from(lookup(&[("RESILIENCE_LB_STRATEGY", "random")])).unwrap_err();
        assert!(err.to_string().contains("random"));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = load_config_from(lookup(&[("RESILIENCE_CACHE_L1_CAPACITY", "0")])).unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert_eq!(config_err, &ConfigError::Zero("l1_capacity"));
    }

    // ===== Range Tests =====

    #[test]
    fn test_overflowing_retention_is_an_error() {
        let err = load_config_from(lookup(&[(
            "RESILIENCE_ALERT_RETENTION_HOURS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert!(matches!(
            config_err,
            ConfigError::OutOfRange {
                field: "alert_retention_hours",
                ..
            }
        ));
    }

    #[test]
    fn test_alert_config_saturates_instead_of_panicking() {
        let config = Config {
            alert_retention_hours: u64::MAX,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.alert_config().retention, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_non_positive_timeout_disables_it() {
        let config = load_config_from(lookup(&[("RESILIENCE_BREAKER_TIMEOUT_SECS", "0")])).unwrap();
        assert!(config.circuit_breaker_config().timeout.is_none());
    }

    #[test]
    fn test_component_conversions() {
        let config = Config::default();
        assert_eq!(config.cache_config().default_ttl, Duration::from_secs(300));
        assert_eq!(config.load_balancer_config().strategy, Strategy::Adaptive);
        assert_eq!(
            config.alert_config().retention,
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(config.metrics_config().sample_capacity, 10_000);
        assert!(config.validate().is_ok());
    }
}
