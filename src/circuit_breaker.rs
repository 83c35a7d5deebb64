//! Per (channel, provider) circuit breaker shared by every worker of a channel.
//!
//! ```text
//! Closed  → Open:      failure_threshold consecutive provider failures
//! Open    → HalfOpen:  first call after open_duration (becomes the trial)
//! HalfOpen → Closed:   trial succeeds
//! HalfOpen → Open:     trial fails (opened_at reset)
//! ```
//!
//! Only one trial is admitted at a time; every other caller is rejected as if
//! the breaker were open. A trial whose holder vanished is re-leased once
//! `open_duration` has passed since it started.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    clients::circuit_breaker::RedisCircuitStore,
    error::DispatchError,
    models::{
        circuit_breaker::{CircuitBreakerConfig, CircuitSnapshot, CircuitState},
        request::Channel,
    },
};

/// Right to make one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub trial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// The call ended for a reason unrelated to the provider's health.
    Abandoned,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Abandoned => "abandoned",
        }
    }

    fn of<T>(result: &Result<T, DispatchError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(e) if e.counts_against_circuit() => CallOutcome::Failure,
            Err(_) => CallOutcome::Abandoned,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

impl BreakerState {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }

    pub(crate) fn try_acquire(&mut self, now: Instant, open_duration: Duration) -> Option<Permit> {
        match self.state {
            CircuitState::Closed => Some(Permit { trial: false }),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|opened_at| now.saturating_duration_since(opened_at))
                    .unwrap_or(open_duration);

                if elapsed < open_duration {
                    return None;
                }

                self.state = CircuitState::HalfOpen;
                self.trial_started_at = Some(now);
                Some(Permit { trial: true })
            }
            CircuitState::HalfOpen => match self.trial_started_at {
                Some(started) if now.saturating_duration_since(started) < open_duration => None,
                _ => {
                    self.trial_started_at = Some(now);
                    Some(Permit { trial: true })
                }
            },
        }
    }

    /// Applies an outcome; returns the new state when it changed.
    pub(crate) fn record(
        &mut self,
        permit: Permit,
        outcome: CallOutcome,
        now: Instant,
        failure_threshold: u32,
    ) -> Option<CircuitState> {
        let before = self.state;

        match (outcome, permit.trial, self.state) {
            (CallOutcome::Abandoned, true, CircuitState::HalfOpen) => {
                self.trial_started_at = None;
            }
            (CallOutcome::Success, true, CircuitState::HalfOpen) => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.trial_started_at = None;
            }
            (CallOutcome::Success, false, CircuitState::Closed) => {
                self.consecutive_failures = 0;
            }
            (CallOutcome::Failure, true, CircuitState::HalfOpen) => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.trial_started_at = None;
            }
            (CallOutcome::Failure, false, CircuitState::Closed) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            // Stragglers admitted before the state changed do not move it.
            _ => {}
        }

        (self.state != before).then_some(self.state)
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

enum Backend {
    Local(Mutex<BreakerState>),
    Redis(RedisCircuitStore),
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    backend: Backend,
}

impl CircuitBreaker {
    /// Breaker whose state lives in this process.
    pub fn local(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(breaker = %name, backend = "local", "Circuit breaker initialized");

        Self {
            name,
            config,
            backend: Backend::Local(Mutex::new(BreakerState::new())),
        }
    }

    /// Breaker whose state is shared through Redis by every worker process.
    pub fn redis(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: RedisCircuitStore,
    ) -> Self {
        let name = name.into();
        info!(breaker = %name, backend = "redis", "Circuit breaker initialized");

        Self {
            name,
            config,
            backend: Backend::Redis(store),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` behind the breaker.
    ///
    /// Rejected calls fail with `CircuitOpen` without running `operation`.
    /// Only provider failures and timeouts count against the breaker.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let permit = self.acquire().await?;

        if permit.trial {
            info!(breaker = %self.name, "Circuit breaker letting trial call through");
        }

        let result = operation().await;
        let outcome = CallOutcome::of(&result);

        if let Err(e) = self.record(permit, outcome).await {
            warn!(
                breaker = %self.name,
                outcome = outcome.as_str(),
                error = %e,
                "Failed to record circuit breaker outcome"
            );
        }

        result
    }

    pub async fn acquire(&self) -> Result<Permit, DispatchError> {
        let permit = match &self.backend {
            Backend::Local(state) => {
                let mut state = self.lock(state)?;
                state.try_acquire(Instant::now(), self.config.open_duration)
            }
            Backend::Redis(store) => store.try_acquire(&self.config).await?,
        };

        permit.ok_or_else(|| {
            debug!(breaker = %self.name, "Circuit breaker is open, rejecting call");
            DispatchError::CircuitOpen(self.name.clone())
        })
    }

    pub async fn record(&self, permit: Permit, outcome: CallOutcome) -> Result<(), DispatchError> {
        let changed = match &self.backend {
            Backend::Local(state) => {
                let mut state = self.lock(state)?;
                state.record(
                    permit,
                    outcome,
                    Instant::now(),
                    self.config.failure_threshold,
                )
            }
            Backend::Redis(store) => store.record(permit, outcome, &self.config).await?,
        };

        match changed {
            Some(CircuitState::Open) if permit.trial => {
                warn!(breaker = %self.name, "Circuit breaker reopened after failed trial call");
            }
            Some(CircuitState::Open) => {
                warn!(
                    breaker = %self.name,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker opened due to consecutive failures"
                );
            }
            Some(CircuitState::Closed) => {
                info!(breaker = %self.name, "Circuit breaker closed after successful trial call");
            }
            _ => {}
        }

        Ok(())
    }

    pub async fn snapshot(&self) -> Result<CircuitSnapshot, DispatchError> {
        let (state, consecutive_failures) = match &self.backend {
            Backend::Local(state) => {
                let state = self.lock(state)?;
                (state.state(), state.consecutive_failures())
            }
            Backend::Redis(store) => store.load().await?,
        };

        Ok(CircuitSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures,
        })
    }

    fn lock<'a>(
        &self,
        state: &'a Mutex<BreakerState>,
    ) -> Result<std::sync::MutexGuard<'a, BreakerState>, DispatchError> {
        state.lock().map_err(|_| {
            DispatchError::Internal(anyhow::anyhow!(
                "Circuit breaker {} state lock poisoned",
                self.name
            ))
        })
    }
}

/// One breaker per (channel, provider) pair.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<(Channel, String), Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker_name(channel: Channel, provider: &str) -> String {
        format!("{}:{}", channel, provider)
    }

    /// Returns the breaker for the pair, creating it with `build` on first use.
    pub fn get_or_insert_with<F>(
        &mut self,
        channel: Channel,
        provider: &str,
        build: F,
    ) -> Arc<CircuitBreaker>
    where
        F: FnOnce(String) -> CircuitBreaker,
    {
        self.breakers
            .entry((channel, provider.to_string()))
            .or_insert_with(|| Arc::new(build(Self::breaker_name(channel, provider))))
            .clone()
    }

    pub fn get(&self, channel: Channel, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&(channel, provider.to_string())).cloned()
    }

    pub fn breakers(&self) -> impl Iterator<Item = &Arc<CircuitBreaker>> {
        self.breakers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: Duration = Duration::from_secs(60);

    fn fail(state: &mut BreakerState, now: Instant) -> Option<CircuitState> {
        let permit = state.try_acquire(now, OPEN).unwrap();
        state.record(permit, CallOutcome::Failure, now, 5)
    }

    #[test]
    fn opens_after_threshold_and_rejects() {
        let mut state = BreakerState::new();
        let now = Instant::now();

        for _ in 0..4 {
            assert_eq!(fail(&mut state, now), None);
        }
        assert_eq!(fail(&mut state, now), Some(CircuitState::Open));
        assert!(state.try_acquire(now, OPEN).is_none());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut state = BreakerState::new();
        let now = Instant::now();

        for _ in 0..4 {
            fail(&mut state, now);
        }
        let permit = state.try_acquire(now, OPEN).unwrap();
        state.record(permit, CallOutcome::Success, now, 5);
        assert_eq!(state.consecutive_failures(), 0);

        fail(&mut state, now);
        assert_eq!(state.state(), CircuitState::Closed);
    }

    #[test]
    fn single_trial_after_open_duration() {
        let mut state = BreakerState::new();
        let opened = Instant::now();
        for _ in 0..5 {
            fail(&mut state, opened);
        }

        let later = opened + OPEN;
        let trial = state.try_acquire(later, OPEN).unwrap();
        assert!(trial.trial);
        assert!(state.try_acquire(later, OPEN).is_none());

        assert_eq!(
            state.record(trial, CallOutcome::Success, later, 5),
            Some(CircuitState::Closed)
        );
        assert!(state.try_acquire(later, OPEN).is_some());
    }

    #[test]
    fn failed_trial_reopens_with_fresh_timer() {
        let mut state = BreakerState::new();
        let opened = Instant::now();
        for _ in 0..5 {
            fail(&mut state, opened);
        }

        let later = opened + OPEN;
        let trial = state.try_acquire(later, OPEN).unwrap();
        state.record(trial, CallOutcome::Failure, later, 5);

        assert_eq!(state.state(), CircuitState::Open);
        assert!(state.try_acquire(later + OPEN / 2, OPEN).is_none());
        assert!(state.try_acquire(later + OPEN, OPEN).is_some());
    }

    #[test]
    fn abandoned_trial_frees_the_slot() {
        let mut state = BreakerState::new();
        let opened = Instant::now();
        for _ in 0..5 {
            fail(&mut state, opened);
        }

        let later = opened + OPEN;
        let trial = state.try_acquire(later, OPEN).unwrap();
        state.record(trial, CallOutcome::Abandoned, later, 5);

        assert_eq!(state.state(), CircuitState::HalfOpen);
        assert!(state.try_acquire(later, OPEN).unwrap().trial);
    }
}
