//! Integration tests for concurrent callers
//!
//! Many overlapping operations against shared components: connection
//! accounting stays exact and counters add up.

use edge_resilience::domain::entities::{BackendNode, Labels};
use edge_resilience::domain::ports::MetricsStore;
use edge_resilience::domain::value_objects::{CacheTier, CircuitState, Expiry, Strategy};
use edge_resilience::infrastructure::{
    CircuitBreakerConfig, CircuitRegistry, LoadBalancer, LoadBalancerConfig, LoadBalancerError,
    TieredCache,
};
use edge_resilience::{Optimizer, RingBufferMetricsStore};
use futures::future::join_all;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Concurrent executes never exceed a backend's connection limit
#[tokio::test]
async fn test_connection_accounting_under_contention() {
    let lb = Arc::new(LoadBalancer::new(LoadBalancerConfig::new(Strategy::LeastConnections)).unwrap());
    lb.add_backend(BackendNode::new("a", "a").with_max_connections(4));
    lb.add_backend(BackendNode::new("b", "b").with_max_connections(4));

    let calls = (0..32).map(|i| {
        let lb = lb.clone();
        async move {
            lb.execute(|node| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if i % 4 == 0 {
                    Err(format!("failure on {}", node.id))
                } else {
                    Ok(node.id)
                }
            })
            .await
        }
    });
    let results = join_all(calls).await;

    let limited = results
        .iter()
        .filter(|r| matches!(r, Err(LoadBalancerError::ConnectionLimitExceeded { .. })))
        .count();
    let ran = results.len() - limited;
    assert!(ran >= 8);

    for backend in lb.backends() {
        assert_eq!(backend.current_connections, 0);
    }
    let stats = lb.stats();
    assert_eq!(stats.total_requests as usize, ran);
    assert_eq!(stats.successful_requests + stats.failed_requests, stats.total_requests);
}

/// Concurrent callers through the optimizer share one cache and breaker
#[tokio::test]
async fn test_optimizer_concurrent_callers() {
    let lb = LoadBalancer::new(LoadBalancerConfig::new(Strategy::RoundRobin)).unwrap();
    lb.add_backend(BackendNode::new("a", "a"));
    lb.add_backend(BackendNode::new("b", "b"));
    let optimizer: Arc<Optimizer<u64>> = Arc::new(Optimizer::builder().load_balancer(lb).build());

    let calls = (0..50u64).map(|i| {
        let optimizer = optimizer.clone();
        async move {
            optimizer
                .execute("square", &(i % 10).to_string(), move |_| async move {
                    tokio::task::yield_now().await;
                    Ok::<_, String>((i % 10) * (i % 10))
                })
                .await
        }
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        let k = (i % 10) as u64;
        assert_eq!(result.unwrap(), k * k);
    }

    let status = optimizer.status();
    assert_eq!(status.cache.l1_size, 10);
    assert_eq!(status.circuits.total_circuits, 1);
    assert_eq!(
        optimizer.breakers().get("square").unwrap().state(),
        CircuitState::Closed
    );
    // the breaker and the balancer saw the same completed calls
    let breaker = optimizer.breakers().get("square").unwrap().metrics();
    assert_eq!(breaker.total_requests, status.load_balancer.total_requests);
}

/// Independent tokio tasks drive the same breaker to open exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_breaker_opens_once_under_parallel_failures() {
    let registry = Arc::new(
        CircuitRegistry::new(CircuitBreakerConfig::new().failure_threshold(5)).unwrap(),
    );

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let breaker = registry.get_or_create("flaky");
                breaker.call_async(|| async { Err::<(), _>("down") }).await
            })
        })
        .collect();
    for task in join_all(tasks).await {
        assert!(task.unwrap().is_err());
    }

    let metrics = registry.get("flaky").unwrap().metrics();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.circuit_opens, 1);
    assert_eq!(metrics.failed_requests + metrics.rejected_requests, 20);
}

/// Writers on distinct keys from several threads all land
#[test]
fn test_cache_parallel_writers() {
    let cache: Arc<TieredCache<usize>> = Arc::new(TieredCache::default());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("{}-{}", t, i);
                    cache.set(key.clone(), i, Expiry::Never, CacheTier::L1);
                    assert_eq!(cache.get(&key), Some(i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), 800);
    assert_eq!(cache.stats().hits, 800);
}

/// Samples recorded from several threads are all counted
#[test]
fn test_metric_store_parallel_records() {
    let store = Arc::new(RingBufferMetricsStore::default());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    store.record("requests", i as f64, Labels::new());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = store.stats("requests", Duration::from_secs(60)).unwrap();
    assert_eq!(stats.count, 1000);
    assert_eq!(store.summary().total_samples, 1000);
}
