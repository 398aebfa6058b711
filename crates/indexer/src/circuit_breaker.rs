// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Circuit breakers guarding the daemon and the database.
//!
//! ```text
//! Closed --(failure_threshold failures within monitoring_period)--> Open
//! Open --(recovery_timeout elapsed, next call)--> HalfOpen
//! HalfOpen --(success_threshold successes)--> Closed
//! HalfOpen --(any failure)--> Open
//! ```
//!
//! A half-open circuit runs at most `success_threshold` trial calls at once. Further callers wait
//! for a trial to finish and are then admitted, rejected or held again depending on its outcome.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{Duration, Instant},
};

pub const DAEMON_BREAKER: &str = "daemon";
pub const DATABASE_BREAKER: &str = "database";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Failures older than this are forgotten while the circuit is closed.
    pub monitoring_period_secs: u64,
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn daemon() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            monitoring_period_secs: 60,
            success_threshold: 2,
        }
    }

    pub fn database() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 10,
            monitoring_period_secs: 60,
            success_threshold: 1,
        }
    }

    pub fn external_api() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 60,
            monitoring_period_secs: 120,
            success_threshold: 3,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_secs(self.monitoring_period_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(format!("circuit breaker thresholds must be non-zero: {self:?}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Error, Debug)]
pub enum CircuitError<E> {
    #[error("Circuit '{name}' is open; next attempt in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    /// Bumped every time the circuit turns half-open.
    trial_round: u64,
    trials_in_flight: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
            last_failure: None,
            next_attempt: None,
            trial_round: 0,
            trials_in_flight: 0,
        }
    }
}

enum Admission {
    Admitted(Option<u64>),
    Rejected(Duration),
    Wait,
}

/// Releases a half-open trial slot when the call finishes or is dropped.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    round: Option<u64>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        let Some(round) = self.round else {
            return;
        };
        {
            let mut state = self.breaker.lock();
            if state.trial_round == round {
                state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
            }
        }
        self.breaker.trial_finished.notify_waiters();
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    trial_finished: Notify,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
            trial_finished: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Time left before an open circuit admits a trial call.
    pub fn retry_in(&self) -> Option<Duration> {
        let state = self.lock();
        match state.state {
            CircuitState::Open => {
                state.next_attempt.map(|at| at.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Only `Err` results count as failures. Callers that want some errors to pass through without
    /// tripping the circuit should return them inside `Ok`.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let round = loop {
            let trial_finished = self.trial_finished.notified();
            tokio::pin!(trial_finished);
            trial_finished.as_mut().enable();

            match self.admit() {
                Admission::Admitted(round) => break round,
                Admission::Rejected(retry_in) => {
                    return Err(CircuitError::Open { name: self.name.clone(), retry_in })
                }
                Admission::Wait => trial_finished.await,
            }
        };
        let _slot = TrialSlot { breaker: self, round };

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock();

        if state.state == CircuitState::Open {
            match state.next_attempt {
                Some(at) if now < at => {
                    state.total_calls += 1;
                    state.rejected_calls += 1;
                    return Admission::Rejected(at - now);
                }
                _ => {
                    tracing::info!("Circuit '{}' half-open, admitting trial calls", self.name);
                    state.state = CircuitState::HalfOpen;
                    state.successes = 0;
                    state.trial_round += 1;
                    state.trials_in_flight = 0;
                }
            }
        }

        if state.state == CircuitState::HalfOpen {
            if state.trials_in_flight >= self.config.success_threshold {
                return Admission::Wait;
            }
            state.trials_in_flight += 1;
            state.total_calls += 1;
            return Admission::Admitted(Some(state.trial_round));
        }
        state.total_calls += 1;
        Admission::Admitted(None)
    }

    fn record_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.failures = 0;
                state.successes += 1;
            }
            CircuitState::HalfOpen => {
                state.successes += 1;
                if state.successes >= self.config.success_threshold {
                    tracing::info!("Circuit '{}' closed after successful trial calls", self.name);
                    state.state = CircuitState::Closed;
                    state.failures = 0;
                    state.successes = 0;
                    state.next_attempt = None;
                }
            }
            // A call admitted before the circuit opened; it does not close the circuit.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.total_failures += 1;

        match state.state {
            CircuitState::Closed => {
                let stale = state.last_failure.is_some_and(|at| {
                    now.saturating_duration_since(at) > self.config.monitoring_period()
                });
                if stale {
                    state.failures = 0;
                }
                state.failures += 1;
                state.last_failure = Some(now);
                if state.failures >= self.config.failure_threshold {
                    self.trip(&mut state, now);
                }
            }
            CircuitState::HalfOpen => {
                state.failures += 1;
                state.last_failure = Some(now);
                self.trip(&mut state, now);
            }
            CircuitState::Open => {
                state.failures += 1;
                state.last_failure = Some(now);
            }
        }
    }

    fn trip(&self, state: &mut BreakerState, now: Instant) {
        tracing::warn!(
            "Circuit '{}' opened after {} failures, retrying in {:?}",
            self.name,
            state.failures,
            self.config.recovery_timeout()
        );
        state.state = CircuitState::Open;
        state.successes = 0;
        state.next_attempt = Some(now + self.config.recovery_timeout());
    }

    pub fn reset(&self) {
        tracing::info!("Circuit '{}' reset", self.name);
        {
            let mut state = self.lock();
            let trial_round = state.trial_round + 1;
            *state = BreakerState { trial_round, ..BreakerState::closed() };
        }
        self.trial_finished.notify_waiters();
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let wall_now = Utc::now();
        let state = self.lock();
        let to_wall = |at: Instant| {
            let offset = if at >= now {
                chrono::Duration::from_std(at - now).unwrap_or(chrono::Duration::zero())
            } else {
                -chrono::Duration::from_std(now - at).unwrap_or(chrono::Duration::zero())
            };
            wall_now + offset
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            rejected_calls: state.rejected_calls,
            last_failure_time: state.last_failure.map(to_wall),
            next_attempt_time: state.next_attempt.map(to_wall),
        }
    }
}

/// Named breakers shared across the process.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the breaker registered under `name`, creating it with `config` if absent.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    pub fn stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.get(name).map(|breaker| breaker.stats())
    }

    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.lock().values().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
