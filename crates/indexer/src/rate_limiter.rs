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

//! Multi-window admission control for daemon RPC calls.
//!
//! The daemon enforces an undocumented request ceiling, and going over it degrades every other
//! consumer of the same node. Every RPC issued by the indexer is admitted here first. A call is
//! admitted only when it fits the per-second, per-minute and per-hour sliding windows *and* a
//! burst token is available. Denied calls consume nothing.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Key used when the whole process shares one daemon connection budget.
pub const GLOBAL_KEY: &str = "global";

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Usage ratio above which a key is reported as unhealthy.
const HEALTHY_USAGE_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
    /// Maximum number of calls that may be issued back to back. Refilled at `per_second`.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RateLimitConfig {
    /// Conservative limits for a shared local daemon.
    pub fn daemon() -> Self {
        Self { per_second: 8, per_minute: 300, per_hour: 12_000, burst: 12 }
    }

    /// Strict limits for third-party APIs.
    pub fn external_api() -> Self {
        Self { per_second: 2, per_minute: 50, per_hour: 1_000, burst: 3 }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.per_second == 0 || self.per_minute == 0 || self.per_hour == 0 || self.burst == 0 {
            return Err(format!("rate limits must all be non-zero: {self:?}"));
        }
        Ok(())
    }

    fn windows(&self) -> [(Duration, u32); 3] {
        [(SECOND, self.per_second), (MINUTE, self.per_minute), (HOUR, self.per_hour)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WindowCounts {
    pub second: u32,
    pub minute: u32,
    pub hour: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WindowUsage {
    pub second: f64,
    pub minute: f64,
    pub hour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub key: String,
    pub current: WindowCounts,
    pub limits: RateLimitConfig,
    pub usage_percent: WindowUsage,
    /// Calls that could be admitted right now without waiting.
    pub available: u32,
    pub is_healthy: bool,
}

#[derive(Debug)]
struct KeyWindow {
    /// Admission times, oldest first. Entries older than an hour are pruned.
    admitted: VecDeque<Instant>,
    tokens: f64,
    last_refill: Instant,
}

impl KeyWindow {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self { admitted: VecDeque::new(), tokens: config.burst as f64, last_refill: now }
    }

    fn decay(&mut self, config: &RateLimitConfig, now: Instant) {
        while self.admitted.front().is_some_and(|t| now.saturating_duration_since(*t) >= HOUR) {
            self.admitted.pop_front();
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.per_second as f64).min(config.burst as f64);
        self.last_refill = now;
    }

    /// Index of the first admission still inside `window`.
    fn window_start(&self, now: Instant, window: Duration) -> usize {
        self.admitted.partition_point(|t| now.saturating_duration_since(*t) >= window)
    }

    fn count_within(&self, now: Instant, window: Duration) -> u32 {
        (self.admitted.len() - self.window_start(now, window)) as u32
    }

    /// Time until one more call fits every window, or zero if it fits now.
    fn wait_time(&self, config: &RateLimitConfig, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;
        for (window, limit) in config.windows() {
            let count = self.count_within(now, window);
            if count >= limit {
                // The call fits once enough admissions age out of the window.
                let blocking = self.admitted[self.admitted.len() - limit as usize];
                wait = wait.max((blocking + window).saturating_duration_since(now));
            }
        }
        if self.tokens < 1.0 {
            let refill = (1.0 - self.tokens) / config.per_second as f64;
            wait = wait.max(Duration::from_secs_f64(refill));
        }
        wait
    }
}

/// Sliding-window rate limiter shared by all scan workers.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    keys: Mutex<HashMap<String, KeyWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, keys: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyWindow>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call for `key` if it fits every window. On denial returns how long to wait.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut keys = self.lock();
        let window =
            keys.entry(key.to_string()).or_insert_with(|| KeyWindow::new(&self.config, now));
        window.decay(&self.config, now);

        let wait = window.wait_time(&self.config, now);
        if !wait.is_zero() {
            return Err(wait);
        }

        window.tokens -= 1.0;
        window.admitted.push_back(now);
        Ok(())
    }

    /// Check-and-consume without waiting.
    pub fn is_allowed(&self, key: &str) -> bool {
        self.try_acquire(key).is_ok()
    }

    /// Wait until a call for `key` is admitted. Denials are never surfaced to the caller.
    pub async fn acquire(&self, key: &str) {
        loop {
            match self.try_acquire(key) {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!("Rate limited on {key}, waiting {:?}", wait);
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    pub fn stats(&self, key: &str) -> RateLimiterStats {
        let now = Instant::now();
        let mut keys = self.lock();
        let window =
            keys.entry(key.to_string()).or_insert_with(|| KeyWindow::new(&self.config, now));
        window.decay(&self.config, now);

        let current = WindowCounts {
            second: window.count_within(now, SECOND),
            minute: window.count_within(now, MINUTE),
            hour: window.count_within(now, HOUR),
        };
        let percent = |count: u32, limit: u32| count as f64 * 100.0 / limit as f64;
        let usage_percent = WindowUsage {
            second: percent(current.second, self.config.per_second),
            minute: percent(current.minute, self.config.per_minute),
            hour: percent(current.hour, self.config.per_hour),
        };
        let available = [
            self.config.per_second.saturating_sub(current.second),
            self.config.per_minute.saturating_sub(current.minute),
            self.config.per_hour.saturating_sub(current.hour),
            window.tokens.floor() as u32,
        ]
        .into_iter()
        .min()
        .unwrap_or(0);
        let is_healthy = usage_percent.second < HEALTHY_USAGE_PERCENT
            && usage_percent.minute < HEALTHY_USAGE_PERCENT
            && usage_percent.hour < HEALTHY_USAGE_PERCENT;

        RateLimiterStats {
            key: key.to_string(),
            current,
            limits: self.config,
            usage_percent,
            available,
            is_healthy,
        }
    }
}
