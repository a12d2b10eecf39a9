//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by rejecting calls to a failing dependency
//! until it has had time to recover.

use crate::config::ConfigError;
use crate::domain::value_objects::CircuitState;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to keep circuit open before allowing a trial call
    pub recovery_timeout: Duration,
    /// Number of consecutive successes in half-open to close the circuit
    pub success_threshold: u32,
    /// Per-call timeout; an overrun counts as a failure
    pub timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Zero("success_threshold"));
        }
        if self.timeout.map(|t| t.is_zero()).unwrap_or(false) {
            return Err(ConfigError::Zero("timeout"));
        }
        Ok(())
    }
}

/// Error returned by a protected call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without running the operation
    #[error("circuit '{name}' is open")]
    Open { name: String },
    /// The operation did not finish within the configured timeout
    #[error("circuit '{name}' call timed out after {after:?}")]
    Timeout { name: String, after: Duration },
    /// The operation's own error, passed through unchanged
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The downstream error, if the operation itself failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// How a failed call affects the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    /// Counts toward the failure threshold
    Matched,
    /// Timed out or was cancelled; counts toward the threshold
    Timeout,
    /// Rejected by the caller's classifier; bookkeeping only
    Ignored,
}

/// Snapshot of a breaker's state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub rejected_requests: u64,
    pub circuit_opens: u64,
    pub circuit_closes: u64,
    pub circuit_half_opens: u64,
    /// Successful / total completed requests, 0 before the first call
    pub success_rate: f64,
    pub secs_in_state: f64,
    pub last_success_secs_ago: Option<f64>,
    pub last_failure_secs_ago: Option<f64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive matching failures
    failure_count: u32,
    /// Consecutive successes (meaningful in half-open)
    success_count: u32,
    last_state_change: Instant,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    timeout_requests: u64,
    rejected_requests: u64,
    opens: u64,
    closes: u64,
    half_opens: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_state_change: Instant::now(),
            last_success: None,
            last_failure: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            timeout_requests: 0,
            rejected_requests: 0,
            opens: 0,
            closes: 0,
            half_opens: 0,
        }
    }
}

/// A named circuit breaker.
///
/// State and counters live behind one lock that is never held while the
/// protected operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config))
    }

    pub(crate) fn from_validated(name: String, config: CircuitBreakerConfig) -> Self {
        tracing::info!(circuit = %name, "circuit breaker created");
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without checking the recovery timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Check whether a call would be admitted right now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here, so the next call is admitted as a trial call. Nothing is run
    /// and no counter changes.
    pub fn allows_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.admit_locked(&mut inner)
    }

    /// Run a blocking operation under protection. Every error counts.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.call_classified(f, |_| true)
    }

    /// Run a blocking operation, counting only errors for which
    /// `is_failure` returns true toward the threshold.
    ///
    /// A blocking call cannot be pre-empted: when it overruns the timeout
    /// its result is discarded and the call is reported as `Timeout`.
    pub fn call_classified<T, E, F, C>(&self, f: F, is_failure: C) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        C: Fn(&E) -> bool,
    {
        self.admit()?;

        let start = Instant::now();
        let result = f();

        if let Some(timeout) = self.config.timeout {
            if start.elapsed() > timeout {
                self.record_failure(FailureKind::Timeout);
                return Err(self.timeout_error(timeout));
            }
        }

        self.settle(result, is_failure)
    }

    /// Run an async operation under protection. Every error counts.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_async_classified(f, |_| true).await
    }

    /// Run an async operation with an error classifier.
    ///
    /// The configured timeout cancels the operation. Dropping the returned
    /// future before it completes is recorded as a timeout.
    pub async fn call_async_classified<T, E, F, Fut, C>(
        &self,
        f: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.admit()?;

        let mut in_flight = InFlight {
            breaker: self,
            settled: false,
        };

        let outcome = match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, f()).await.ok(),
            None => Some(f().await),
        };
        in_flight.settled = true;

        match outcome {
            Some(result) => self.settle(result, is_failure),
            None => {
                let timeout = self.config.timeout.unwrap_or_default();
                self.record_failure(FailureKind::Timeout);
                Err(self.timeout_error(timeout))
            }
        }
    }

    /// Force the breaker closed and clear every counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerState::new();
        tracing::info!(circuit = %self.name, "circuit breaker manually reset");
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.inner.lock();
        let now = Instant::now();
        let secs_ago = |t: Option<Instant>| t.map(|t| now.duration_since(t).as_secs_f64());

        CircuitMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            timeout_requests: inner.timeout_requests,
            rejected_requests: inner.rejected_requests,
            circuit_opens: inner.opens,
            circuit_closes: inner.closes,
            circuit_half_opens: inner.half_opens,
            success_rate: if inner.total_requests == 0 {
                0.0
            } else {
                inner.successful_requests as f64 / inner.total_requests as f64
            },
            secs_in_state: now.duration_since(inner.last_state_change).as_secs_f64(),
            last_success_secs_ago: secs_ago(inner.last_success),
            last_failure_secs_ago: secs_ago(inner.last_failure),
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock();
        if self.admit_locked(&mut inner) {
            Ok(())
        } else {
            inner.rejected_requests += 1;
            tracing::debug!(circuit = %self.name, "request rejected, circuit open");
            Err(BreakerError::Open {
                name: self.name.clone(),
            })
        }
    }

    fn admit_locked(&self, inner: &mut BreakerState) -> bool {
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= self.config.recovery_timeout {
                    self.transition(inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn settle<T, E, C>(&self, result: Result<T, E>, is_failure: C) -> Result<T, BreakerError<E>>
    where
        C: Fn(&E) -> bool,
    {
        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                let kind = if is_failure(&e) {
                    FailureKind::Matched
                } else {
                    FailureKind::Ignored
                };
                self.record_failure(kind);
                Err(BreakerError::Operation(e))
            }
        }
    }

    fn timeout_error<E>(&self, after: Duration) -> BreakerError<E> {
        BreakerError::Timeout {
            name: self.name.clone(),
            after,
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.successful_requests += 1;
        inner.last_success = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                // Reset failure count on success
                inner.failure_count = 0;
            }
            CircuitState::Open => {
                // Admitted before a concurrent call opened the circuit
            }
        }
    }

    fn record_failure(&self, kind: FailureKind) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.last_failure = Some(Instant::now());
        if kind == FailureKind::Timeout {
            inner.timeout_requests += 1;
        }

        if kind == FailureKind::Ignored {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Move to `to`, resetting the consecutive counters.
    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_state_change = Instant::now();

        match to {
            CircuitState::Open => {
                inner.opens += 1;
                tracing::warn!(circuit = %self.name, from = %from, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.half_opens += 1;
                tracing::info!(circuit = %self.name, "circuit breaker half-open, allowing trial calls");
            }
            CircuitState::Closed => {
                inner.closes += 1;
                tracing::info!(circuit = %self.name, "circuit breaker closed (recovered)");
            }
        }
    }
}

/// Records a cancelled async call as a timeout when dropped unsettled.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(circuit = %self.breaker.name, "protected call cancelled");
            self.breaker.record_failure(FailureKind::Timeout);
        }
    }
}
