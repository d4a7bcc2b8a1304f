//! Circuit breaker for oracle providers
//!
//! Stops calling a provider that keeps failing so the intent resolver falls
//! back quickly instead of waiting out one timeout per command.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sortie_core::{OracleError, OraclePrompt, ReasoningOracle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failure threshold reached, calls fail fast
    Open,
    /// Probing whether the provider recovered
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time spent open before probing
    pub recovery_timeout_secs: u64,

    /// Trial successes needed to close again
    pub success_threshold: u32,

    /// Concurrent trial calls allowed while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            success_threshold: 3,
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_requests: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<Instant>,
}

/// Circuit breaker for a single provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_requests: 0,
                opened_at: None,
            }),
        }
    }

    /// Admit a call, or fail fast with `Unavailable`
    pub fn can_execute(&self) -> Result<(), OracleError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                let recovery = self.config.recovery_timeout();
                if elapsed >= recovery {
                    tracing::info!(provider = %self.provider, "circuit half-open, probing provider");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    inner.half_open_requests = 1;
                    Ok(())
                } else {
                    Err(OracleError::Unavailable(format!(
                        "circuit open for {}, retry in {:?}",
                        self.provider,
                        recovery - elapsed
                    )))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    Ok(())
                } else {
                    Err(OracleError::Unavailable(format!(
                        "circuit half-open for {}, trial call already in flight",
                        self.provider
                    )))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
                if inner.successes >= self.config.success_threshold {
                    tracing::info!(provider = %self.provider, "circuit closed, provider recovered");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Closed | CircuitState::Open => inner.failures = 0,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        match inner.state {
            CircuitState::Closed if inner.failures >= self.config.failure_threshold => {
                tracing::warn!(provider = %self.provider, failures = inner.failures, "circuit opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                tracing::warn!(provider = %self.provider, "trial call failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.successes = 0;
                inner.half_open_requests = 0;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failures,
            success_count: inner.successes,
            opened_at: inner.opened_at,
        }
    }

    /// Manual override, e.g. from an operator command
    pub fn force_open(&self) {
        tracing::warn!(provider = %self.provider, "circuit manually opened");
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    pub fn force_close(&self) {
        tracing::info!(provider = %self.provider, "circuit manually closed");
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_requests = 0;
        inner.opened_at = None;
    }
}

/// An oracle behind its own circuit breaker.
///
/// Transport-level failures (timeouts, rate limits, unreachable or failing
/// endpoints) count against the circuit; a malformed answer does not, since
/// the provider did respond.
pub struct GuardedOracle {
    oracle: Arc<dyn ReasoningOracle>,
    breaker: CircuitBreaker,
}

impl GuardedOracle {
    pub fn new(oracle: Arc<dyn ReasoningOracle>, config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(oracle.name().to_string(), config);
        Self { oracle, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl std::fmt::Debug for GuardedOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedOracle")
            .field("oracle", &self.oracle.name())
            .field("breaker", &self.breaker)
            .finish()
    }
}

#[async_trait]
impl ReasoningOracle for GuardedOracle {
    fn name(&self) -> &str {
        self.oracle.name()
    }

    async fn complete(&self, prompt: &OraclePrompt) -> Result<String, OracleError> {
        self.breaker.can_execute()?;
        match self.oracle.complete(prompt).await {
            Ok(text) => {
                self.breaker.record_success();
                Ok(text)
            }
            Err(err) => {
                if matches!(err, OracleError::Malformed(_)) {
                    self.breaker.record_success();
                } else {
                    self.breaker.record_failure();
                }
                Err(err)
            }
        }
    }
}
