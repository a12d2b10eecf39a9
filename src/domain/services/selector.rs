//! Backend Selector Service
//!
//! Pure selection logic for the load balancer strategies.
//! This service has NO locking and NO I/O - callers hold the pool lock.

use crate::domain::entities::BackendNode;
use crate::domain::value_objects::Strategy;

/// Weight bounds enforced by the adaptive strategy.
pub const MIN_WEIGHT: f64 = 1.0;
pub const MAX_WEIGHT: f64 = 10.0;

/// Composite score above which the adaptive strategy raises a weight.
const PROMOTE_SCORE: f64 = 0.8;
/// Composite score below which the adaptive strategy lowers a weight.
const DEMOTE_SCORE: f64 = 0.5;

/// Tunables the strategies read from the load balancer configuration.
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams {
    /// Response time treated as a zero response-time score
    pub response_time_threshold_ms: f64,
    /// Weight nudge applied by the adaptive strategy
    pub adaptive_weight_step: f64,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            response_time_threshold_ms: 1000.0,
            adaptive_weight_step: 0.1,
        }
    }
}

/// Backend selector for the six routing strategies.
///
/// Every strategy only considers backends with `healthy == true` and
/// returns an index into the slice it was given. Ties go to the backend
/// seen first.
pub struct BackendSelector;

impl BackendSelector {
    /// Select a backend according to `strategy`.
    ///
    /// `counter` is the rotation state shared by the round-robin strategies.
    /// The adaptive strategy nudges the weight of every healthy backend it
    /// scores, not just the selected one.
    ///
    /// # Returns
    /// Index of the selected backend, or None if no backend is healthy
    pub fn select(
        strategy: Strategy,
        backends: &mut [BackendNode],
        counter: &mut u64,
        params: &SelectionParams,
    ) -> Option<usize> {
        let candidates: Vec<usize> = backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let picked = match strategy {
            Strategy::RoundRobin => Self::round_robin(&candidates, counter),
            Strategy::WeightedRoundRobin => {
                Self::weighted_round_robin(backends, &candidates, counter)
            }
            Strategy::LeastConnections => Self::min_by(&candidates, |i| {
                backends[i].current_connections as f64
            }),
            Strategy::WeightedLeastConnections => Self::min_by(&candidates, |i| {
                backends[i].current_connections as f64 / effective_weight(&backends[i])
            }),
            Strategy::ResponseTime => {
                Self::min_by(&candidates, |i| backends[i].response_time_ms)
            }
            Strategy::Adaptive => Self::adaptive(backends, &candidates, params),
        };

        Some(picked)
    }

    fn round_robin(candidates: &[usize], counter: &mut u64) -> usize {
        let picked = candidates[(*counter % candidates.len() as u64) as usize];
        *counter = counter.wrapping_add(1);
        picked
    }

    /// Cumulative-weight scan over a rotating point in `[0, ceil(total))`.
    fn weighted_round_robin(
        backends: &[BackendNode],
        candidates: &[usize],
        counter: &mut u64,
    ) -> usize {
        let total: f64 = candidates.iter().map(|&i| effective_weight(&backends[i])).sum();
        let span = (total.ceil() as u64).max(1);
        let point = (*counter % span) as f64;
        *counter = counter.wrapping_add(1);

        let mut cumulative = 0.0;
        for &i in candidates {
            cumulative += effective_weight(&backends[i]);
            if point < cumulative {
                return i;
            }
        }

        // Rounding left the point past the last bucket
        candidates[0]
    }

    fn min_by<F>(candidates: &[usize], key: F) -> usize
    where
        F: Fn(usize) -> f64,
    {
        let mut best = candidates[0];
        let mut best_key = key(best);
        for &i in &candidates[1..] {
            let k = key(i);
            if k < best_key {
                best = i;
                best_key = k;
            }
        }
        best
    }

    /// Score all, nudge all, select best.
    fn adaptive(backends: &mut [BackendNode], candidates: &[usize], params: &SelectionParams) -> usize {
        let scores: Vec<(usize, f64)> = candidates
            .iter()
            .map(|&i| (i, Self::adaptive_score(&backends[i], params)))
            .collect();

        let mut best = scores[0];
        for &(i, score) in &scores[1..] {
            if score > best.1 {
                best = (i, score);
            }
        }

        for &(i, score) in &scores {
            let backend = &mut backends[i];
            if score > PROMOTE_SCORE {
                backend.weight = (backend.weight + params.adaptive_weight_step).min(MAX_WEIGHT);
            } else if score < DEMOTE_SCORE {
                backend.weight = (backend.weight - params.adaptive_weight_step).max(MIN_WEIGHT);
            }
        }

        best.0
    }

    /// Composite adaptive score: 0.4 health + 0.3 headroom + 0.3 response time.
    pub fn adaptive_score(backend: &BackendNode, params: &SelectionParams) -> f64 {
        let response_score = if params.response_time_threshold_ms > 0.0 {
            (1.0 - backend.response_time_ms / params.response_time_threshold_ms).max(0.0)
        } else {
            0.0
        };

        backend.health_score * 0.4 + backend.connection_headroom() * 0.3 + response_score * 0.3
    }

    /// Calculate adaptive scores for all healthy backends (for diagnostics).
    pub fn calculate_all_scores(
        backends: &[BackendNode],
        params: &SelectionParams,
    ) -> Vec<(String, f64)> {
        backends
            .iter()
            .filter(|b| b.healthy)
            .map(|b| (b.id.clone(), Self::adaptive_score(b, params)))
            .collect()
    }
}

/// Weight used for arithmetic (zero or negative weight is treated as one).
fn effective_weight(backend: &BackendNode) -> f64 {
    if backend.weight <= 0.0 {
        1.0
    } else {
        backend.weight
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    // ===== Test Helpers =====

    fn create_backend(id: &str, healthy: bool) -> BackendNode {
        let mut b = BackendNode::new(id, format!("backend {}", id));
        b.healthy = healthy;
        b
    }

    fn select(strategy: Strategy, backends: &mut [BackendNode], counter: &mut u64) -> Option<String> {
        BackendSelector::select(strategy, backends, counter, &SelectionParams::default())
            .map(|i| backends[i].id.clone())
    }

    // ===== Round Robin Tests =====

    #[test]
    fn test_round_robin_rotates_and_wraps() {
        let mut backends = vec![
            create_backend("a", true),
            create_backend("b", true),
            create_backend("c", true),
        ];
        let mut counter = 0;

        let picks: Vec<String> = (0..6)
            .map(|_| select(Strategy::RoundRobin, &mut backends, &mut counter).unwrap())
            .collect();

        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let mut backends = vec![
            create_backend("a", true),
            create_backend("b", false),
            create_backend("c", true),
        ];
        let mut counter = 0;

        let picks: Vec<String> = (0..4)
            .map(|_| select(Strategy::RoundRobin, &mut backends, &mut counter).unwrap())
            .collect();

        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_no_healthy_backends() {
        let mut backends = vec![create_backend("a", false)];
        let mut counter = 0;
        for strategy in Strategy::ALL {
            assert!(select(strategy, &mut backends, &mut counter).is_none());
        }
    }

    #[test]
    fn test_empty_pool() {
        let mut backends: Vec<BackendNode> = vec![];
        let mut counter = 0;
        assert!(select(Strategy::Adaptive, &mut backends, &mut counter).is_none());
    }

    // ===== Weighted Round Robin Tests =====

    #[test]
    fn test_weighted_round_robin_distribution() {
        let mut backends = vec![
            create_backend("heavy", true).with_weight(3.0),
            create_backend("light", true).with_weight(1.0),
        ];
        let mut counter = 0;

        let picks: Vec<String> = (0..8)
            .map(|_| select(Strategy::WeightedRoundRobin, &mut backends, &mut counter).unwrap())
            .collect();

        assert_eq!(picks.iter().filter(|p| *p == "heavy").count(), 6);
        assert_eq!(picks.iter().filter(|p| *p == "light").count(), 2);
        assert_eq!(picks[3], "light");
        assert_eq!(picks[7], "light");
    }

    #[test]
    fn test_weighted_round_robin_fractional_weights() {
        // total 2.2 -> points 0, 1, 2
        let mut backends = vec![
            create_backend("a", true).with_weight(1.1),
            create_backend("b", true).with_weight(1.1),
        ];
        let mut counter = 0;

        let picks: Vec<String> = (0..3)
            .map(|_| select(Strategy::WeightedRoundRobin, &mut backends, &mut counter).unwrap())
            .collect();

        assert_eq!(picks, vec!["a", "a", "b"]);
    }

    #[test]
    fn test_weighted_round_robin_zero_weight_counts_as_one() {
        let mut backends = vec![
            create_backend("a", true).with_weight(0.0),
            create_backend("b", true).with_weight(1.0),
        ];
        let mut counter = 0;

        let picks: Vec<String> = (0..2)
            .map(|_| select(Strategy::WeightedRoundRobin, &mut backends, &mut counter).unwrap())
            .collect();

        assert_eq!(picks, vec!["a", "b"]);
    }

    // ===== Least Connections Tests =====

    #[test]
    fn test_least_connections_prefers_idle_and_first_on_tie() {
        let mut backends = vec![
            create_backend("a", true),
            create_backend("b", true),
            create_backend("c", true),
        ];
        backends[0].current_connections = 5;
        backends[1].current_connections = 2;
        backends[2].current_connections = 2;
        let mut counter = 0;

        assert_eq!(
            select(Strategy::LeastConnections, &mut backends, &mut counter).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_weighted_least_connections() {
        let mut backends = vec![
            create_backend("a", true).with_weight(1.0),
            create_backend("b", true).with_weight(4.0),
        ];
        backends[0].current_connections = 2; // 2.0
        backends[1].current_connections = 4; // 1.0
        let mut counter = 0;

        assert_eq!(
            select(Strategy::WeightedLeastConnections, &mut backends, &mut counter).unwrap(),
            "b"
        );
    }

    // ===== Response Time Tests =====

    #[test]
    fn test_response_time_picks_fastest() {
        let mut backends = vec![
            create_backend("slow", true),
            create_backend("fast", true),
        ];
        backends[0].response_time_ms = 250.0;
        backends[1].response_time_ms = 20.0;
        let mut counter = 0;

        assert_eq!(
            select(Strategy::ResponseTime, &mut backends, &mut counter).unwrap(),
            "fast"
        );
    }

    // ===== Adaptive Tests =====

    #[test]
    fn test_adaptive_score_components() {
        let params = SelectionParams::default();
        let mut backend = create_backend("a", true).with_max_connections(10);
        assert!((BackendSelector::adaptive_score(&backend, &params) - 1.0).abs() < 1e-9);

        backend.current_connections = 5;
        backend.response_time_ms = 500.0;
        backend.health_score = 0.5;
        // 0.4*0.5 + 0.3*0.5 + 0.3*0.5
        assert!((BackendSelector::adaptive_score(&backend, &params) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_picks_best_and_nudges_all() {
        let mut backends = vec![
            create_backend("good", true).with_weight(5.0),
            create_backend("bad", true).with_weight(5.0),
            create_backend("middling", true).with_weight(5.0),
        ];
        backends[1].health_score = 0.0;
        backends[1].response_time_ms = 2000.0;
        backends[2].health_score = 0.6;
        backends[2].response_time_ms = 400.0;
        let mut counter = 0;

        assert_eq!(select(Strategy::Adaptive, &mut backends, &mut counter).unwrap(), "good");
        assert!((backends[0].weight - 5.1).abs() < 1e-9);
        assert!((backends[1].weight - 4.9).abs() < 1e-9);
        // 0.24 + 0.3 + 0.18 = 0.72 -> untouched
        assert!((backends[2].weight - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_weights_stay_bounded() {
        let mut backends = vec![
            create_backend("good", true).with_weight(10.0),
            create_backend("bad", true).with_weight(1.0),
        ];
        backends[1].health_score = 0.0;
        backends[1].response_time_ms = 5000.0;
        let mut counter = 0;

        for _ in 0..5 {
            select(Strategy::Adaptive, &mut backends, &mut counter);
        }

        assert_eq!(backends[0].weight, MAX_WEIGHT);
        assert_eq!(backends[1].weight, MIN_WEIGHT);
    }

    #[test]
    fn test_adaptive_ignores_unhealthy_when_nudging() {
        let mut backends = vec![
            create_backend("up", true).with_weight(2.0),
            create_backend("down", false).with_weight(2.0),
        ];
        let mut counter = 0;

        select(Strategy::Adaptive, &mut backends, &mut counter);
        assert_eq!(backends[1].weight, 2.0);
    }

    #[test]
    fn test_calculate_all_scores_excludes_unhealthy() {
        let backends = vec![create_backend("a", true), create_backend("b", false)];
        let scores = BackendSelector::calculate_all_scores(&backends, &SelectionParams::default());
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].0, "a");
    }
}
