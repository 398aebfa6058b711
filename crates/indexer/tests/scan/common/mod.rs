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

use std::{sync::Arc, time::Duration};

use verus_stake_indexer::{
    circuit_breaker::CircuitBreakerConfig,
    db::StakesDbObj,
    rate_limiter::RateLimitConfig,
    scanner::{OrchestratorConfig, ScanConfig, ScanOrchestrator, ScanProgress},
    test_utils::{MockDaemon, TestDb},
};

pub const ALICE: &str = "iGdnbDCsZHyRTb4xbnNNPkZeZ4TVbM8WEU";
pub const BOB: &str = "iJhCezBExJHvtyH3fGhNnt2NhU4Ztkf2yq";
pub const DELEGATE: &str = "RJD7uZ8ErmcSWvD3zwQcN5DSA8WpCmf3AS";

pub const REWARD_SATS: u64 = 600_000_000;

pub struct TestContext {
    pub test_db: TestDb,
    pub daemon: Arc<MockDaemon>,
}

impl TestContext {
    pub async fn new(daemon: MockDaemon) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let test_db = TestDb::new().await.expect("Failed to create test database");
        Self { test_db, daemon: Arc::new(daemon) }
    }

    pub fn db(&self) -> StakesDbObj {
        self.test_db.db.clone()
    }

    pub fn orchestrator(&self) -> ScanOrchestrator {
        self.orchestrator_with(orchestrator_config())
    }

    pub fn orchestrator_with(&self, config: OrchestratorConfig) -> ScanOrchestrator {
        ScanOrchestrator::new(self.db(), self.daemon.clone(), config)
    }
}

/// Rate limits high enough to never throttle a test.
pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        rate_limit: RateLimitConfig {
            per_second: 100_000,
            per_minute: 1_000_000,
            per_hour: 10_000_000,
            burst: 100_000,
        },
        daemon_breaker: CircuitBreakerConfig::daemon(),
        database_breaker: CircuitBreakerConfig::database(),
        block_cache_capacity: 100,
    }
}

pub fn fast_scan() -> ScanConfig {
    ScanConfig {
        max_concurrent_requests: 4,
        delay_between_batches_ms: 0,
        block_batch_size: 4,
        address_batch_size: 10,
        cache_block_data: true,
        max_retries: 2,
        backoff_multiplier: 1.0,
        retry_base_delay_ms: 1,
        max_blocks_per_scan: 10_000,
    }
}

/// Poll `orchestrator` until `ready` holds for its progress.
pub async fn wait_until(
    orchestrator: &ScanOrchestrator,
    ready: impl Fn(&ScanProgress) -> bool,
) -> ScanProgress {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let progress = orchestrator.progress();
        if ready(&progress) {
            return progress;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting, last: {progress:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
