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

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::rpc::RetryPolicy;

/// Tuning for a single scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Daemon requests in flight at once within a chunk.
    pub max_concurrent_requests: usize,
    pub delay_between_batches_ms: u64,
    /// Heights per chunk.
    pub block_batch_size: u64,
    /// Identities scanned together over the union of their ranges.
    pub address_batch_size: usize,
    pub cache_block_data: bool,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub retry_base_delay_ms: u64,
    /// Upper bound on the heights scanned per identity in one scan.
    pub max_blocks_per_scan: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::conservative()
    }
}

impl ScanConfig {
    /// Gentle settings for full-history sweeps against a shared daemon.
    pub fn conservative() -> Self {
        Self {
            max_concurrent_requests: 4,
            delay_between_batches_ms: 500,
            block_batch_size: 100,
            address_batch_size: 10,
            cache_block_data: true,
            max_retries: 3,
            backoff_multiplier: 2.0,
            retry_base_delay_ms: 1000,
            max_blocks_per_scan: 250_000,
        }
    }

    /// Faster settings for short recent-only sweeps.
    pub fn aggressive() -> Self {
        Self {
            max_concurrent_requests: 16,
            delay_between_batches_ms: 50,
            block_batch_size: 500,
            address_batch_size: 50,
            cache_block_data: true,
            max_retries: 5,
            backoff_multiplier: 1.5,
            retry_base_delay_ms: 250,
            max_blocks_per_scan: 20_000,
        }
    }

    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be at least 1".into());
        }
        if self.block_batch_size == 0 {
            return Err("block_batch_size must be at least 1".into());
        }
        if self.address_batch_size == 0 {
            return Err("address_batch_size must be at least 1".into());
        }
        if self.max_blocks_per_scan == 0 {
            return Err("max_blocks_per_scan must be at least 1".into());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }
}

/// Which heights to scan for each identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// From the identity's creation height.
    FullHistory,
    /// From just after the identity's last scanned height.
    Incremental,
    /// The most recent `blocks` heights up to the tip.
    Recent { blocks: u64 },
    /// An explicit inclusive range, clamped to the identity's lifetime and the tip.
    Range { start: u64, end: u64 },
}

impl ScanMode {
    /// Whether a scan also retries failed heights its identities' cursors have moved past.
    pub fn retries_failed_blocks(&self) -> bool {
        matches!(self, ScanMode::FullHistory | ScanMode::Incremental)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeOptions {
    pub identities: Vec<String>,
    pub mode: ScanMode,
}

impl RangeOptions {
    pub fn new(identities: impl IntoIterator<Item = impl Into<String>>, mode: ScanMode) -> Self {
        Self { identities: identities.into_iter().map(Into::into).collect(), mode }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.identities.is_empty() {
            return Err("at least one identity is required".into());
        }
        let unique: HashSet<&String> = self.identities.iter().collect();
        if unique.len() != self.identities.len() {
            return Err("identities must be unique".into());
        }
        match self.mode {
            ScanMode::Recent { blocks: 0 } => Err("recent scans need at least one block".into()),
            ScanMode::Range { start, end } if start > end => {
                Err(format!("range start {start} is after end {end}"))
            }
            _ => Ok(()),
        }
    }
}

/// Inclusive heights one identity will be scanned over, or `None` when there is nothing to do.
pub fn effective_range(
    mode: ScanMode,
    creation: u64,
    last_scanned: Option<u64>,
    tip: u64,
    max_blocks_per_scan: u64,
) -> Option<(u64, u64)> {
    let (start, cap) = match mode {
        ScanMode::FullHistory => (creation, tip),
        ScanMode::Incremental => {
            let resume = last_scanned.map_or(creation, |height| height.saturating_add(1));
            (resume.max(creation), tip)
        }
        ScanMode::Recent { blocks } => {
            (tip.saturating_sub(blocks.saturating_sub(1)).max(creation), tip)
        }
        ScanMode::Range { start, end } => (start.max(creation), end.min(tip)),
    };
    if start > cap {
        return None;
    }
    let end = cap.min(start.saturating_add(max_blocks_per_scan.saturating_sub(1)));
    Some((start, end))
}
