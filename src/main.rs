//! edge-resilience - Resilience layer service
//!
//! This is the composition root that wires together all the components.

use edge_resilience::application::Optimizer;
use edge_resilience::config::load_config;
use edge_resilience::domain::ports::MetricsStore;
use edge_resilience::infrastructure::{
    shutdown_signal, AlertEngine, CircuitRegistry, LoadBalancer, ShutdownController, TieredCache,
};
use edge_resilience::RingBufferMetricsStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting edge-resilience strategy={} l1={} l2={}",
        cfg.lb_strategy,
        cfg.cache_l1_capacity,
        cfg.cache_l2_capacity
    );

    // ===== COMPOSITION ROOT =====
    // Each component is constructed explicitly and validated up front

    let cache = TieredCache::<serde_json::Value>::new(cfg.cache_config())?;
    let breakers = CircuitRegistry::new(cfg.circuit_breaker_config())?;
    let load_balancer = LoadBalancer::new(cfg.load_balancer_config())?;
    let metrics: Arc<dyn MetricsStore> = Arc::new(RingBufferMetricsStore::new(cfg.metrics_config())?);
    let alerts = AlertEngine::new(cfg.alert_config())?;

    alerts.add_handler(|alert| {
        tracing::warn!(rule = %alert.rule_name, severity = %alert.severity, "{}", alert.message);
    });

    let optimizer = Arc::new(
        Optimizer::builder()
            .cache(cache)
            .breakers(breakers)
            .load_balancer(load_balancer)
            .metrics(metrics)
            .alerts(alerts)
            .build(),
    );

    // Background tasks: cache sweep and periodic observation
    let shutdown = ShutdownController::new();
    optimizer.start(&shutdown);

    shutdown_signal(shutdown.clone()).await;

    if !shutdown.join(DRAIN_TIMEOUT).await {
        tracing::warn!("background tasks did not stop in time");
    }

    if let Ok(status) = optimizer.status_json() {
        tracing::debug!("final status: {}", status);
    }

    tracing::info!("edge-resilience stopped");
    Ok(())
}
