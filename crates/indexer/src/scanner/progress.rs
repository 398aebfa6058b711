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

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Complete,
    Error,
}

impl ScanStatus {
    /// A scan holds the orchestrator while running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, ScanStatus::Running | ScanStatus::Paused)
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Running => "running",
            ScanStatus::Paused => "paused",
            ScanStatus::Stopped => "stopped",
            ScanStatus::Complete => "complete",
            ScanStatus::Error => "error",
        };
        f.write_str(status)
    }
}

/// Snapshot of the current or most recent scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub blocks_processed: u64,
    pub total_blocks: u64,
    pub addresses_processed: u64,
    pub total_addresses: u64,
    pub stake_events_found: u64,
    /// Heights left unprocessed after a failed classification or block fetch.
    pub blocks_failed: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            status: ScanStatus::Idle,
            blocks_processed: 0,
            total_blocks: 0,
            addresses_processed: 0,
            total_addresses: 0,
            stake_events_found: 0,
            blocks_failed: 0,
            start_time: None,
            estimated_completion: None,
            error: None,
        }
    }
}

impl ScanProgress {
    pub fn started(total_addresses: u64) -> Self {
        Self {
            status: ScanStatus::Running,
            total_addresses,
            start_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.blocks_processed as f64 * 100.0 / self.total_blocks as f64
    }

    /// Linear extrapolation of the processing rate so far.
    pub fn update_estimate(&mut self, elapsed: Duration) {
        if self.blocks_processed == 0 || elapsed.is_zero() {
            self.estimated_completion = None;
            return;
        }
        let remaining = self.total_blocks.saturating_sub(self.blocks_processed);
        let per_block = elapsed.as_secs_f64() / self.blocks_processed as f64;
        let eta = Duration::from_secs_f64(per_block * remaining as f64);
        self.estimated_completion =
            chrono::Duration::from_std(eta).ok().map(|eta| Utc::now() + eta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_extrapolates_rate() {
        let mut progress = ScanProgress::started(1);
        progress.total_blocks = 100;
        progress.blocks_processed = 25;

        let before = Utc::now();
        progress.update_estimate(Duration::from_secs(10));
        let eta = progress.estimated_completion.unwrap();
        // 75 remaining blocks at 0.4s per block
        assert!(eta >= before + chrono::Duration::seconds(29));
        assert!(eta <= Utc::now() + chrono::Duration::seconds(31));
        assert_eq!(progress.percent_complete(), 25.0);
    }

    #[test]
    fn test_no_estimate_before_progress() {
        let mut progress = ScanProgress::started(1);
        progress.total_blocks = 100;
        progress.update_estimate(Duration::from_secs(10));
        assert_eq!(progress.estimated_completion, None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ScanStatus::Complete).unwrap(), "\"complete\"");
        assert!(ScanStatus::Paused.is_active());
        assert!(!ScanStatus::Error.is_active());
    }
}
