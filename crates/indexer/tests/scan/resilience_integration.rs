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

use verus_stake_indexer::{
    circuit_breaker::{CircuitBreakerConfig, CircuitState, DAEMON_BREAKER, DATABASE_BREAKER},
    scanner::{OrchestratorConfig, RangeOptions, ScanConfig, ScanMode, ScanStatus},
    test_utils::MockDaemon,
};

use crate::common::{fast_scan, orchestrator_config, TestContext, ALICE, REWARD_SATS};

fn strict_daemon_breaker() -> OrchestratorConfig {
    OrchestratorConfig {
        daemon_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 1,
            monitoring_period_secs: 60,
            success_threshold: 1,
        },
        ..orchestrator_config()
    }
}

#[tokio::test]
async fn test_unreachable_daemon_ends_in_error() {
    let ctx = TestContext::new(MockDaemon::new().with_work_blocks(1..=10)).await;
    ctx.daemon.set_unavailable(true);
    let orchestrator = ctx.orchestrator_with(strict_daemon_breaker());

    let progress = orchestrator
        .run(
            ScanConfig { max_retries: 1, ..fast_scan() },
            RangeOptions::new([ALICE], ScanMode::FullHistory),
        )
        .await
        .unwrap();
    assert_eq!(progress.status, ScanStatus::Error);
    let error = progress.error.expect("error status carries a message");
    assert!(error.contains("Daemon unavailable"), "unexpected error: {error}");

    let daemon = orchestrator.circuit_breaker_stats(DAEMON_BREAKER).unwrap();
    assert_eq!(daemon.state, CircuitState::Open);
    assert!(daemon.rejected_calls > 0);
    // The database breaker is independent
    let database = orchestrator.circuit_breaker_stats(DATABASE_BREAKER).unwrap();
    assert_eq!(database.state, CircuitState::Closed);
    assert_eq!(database.total_failures, 0);
    assert!(orchestrator.circuit_breaker_stats("nonexistent").is_none());

    assert!(orchestrator.reset_circuit_breaker(DAEMON_BREAKER));
    assert_eq!(
        orchestrator.circuit_breaker_stats(DAEMON_BREAKER).unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_daemon_recovery_lets_the_next_scan_finish() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=10)
            .with_stake_block(6, ALICE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;
    let orchestrator = ctx.orchestrator_with(strict_daemon_breaker());
    let options = RangeOptions::new([ALICE], ScanMode::Incremental);

    ctx.daemon.set_unavailable(true);
    let failed = orchestrator
        .run(ScanConfig { max_retries: 0, ..fast_scan() }, options.clone())
        .await
        .unwrap();
    assert_eq!(failed.status, ScanStatus::Error);

    // Waits out the open circuit, then succeeds on the half-open trial
    ctx.daemon.set_unavailable(false);
    let progress = orchestrator.run(fast_scan(), options).await.unwrap();
    assert_eq!(progress.status, ScanStatus::Complete);
    assert_eq!(progress.stake_events_found, 1);
    assert_eq!(
        orchestrator.circuit_breaker_stats(DAEMON_BREAKER).unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_failed_block_is_retried_by_incremental_scan() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=12)
            .with_stake_block(5, ALICE, REWARD_SATS)
            .with_stake_block(9, ALICE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;
    ctx.daemon.set_height_failing(5, true);
    let db = ctx.db();

    let first = ctx
        .orchestrator()
        .run(fast_scan(), RangeOptions::new([ALICE], ScanMode::FullHistory))
        .await
        .unwrap();
    assert_eq!(first.status, ScanStatus::Complete);
    assert_eq!(first.blocks_failed, 1);
    assert_eq!(first.stake_events_found, 1);
    // The failed height is recorded instead of holding back the cursor
    assert_eq!(db.get_identity(ALICE).await.unwrap().unwrap().last_scanned_block, Some(12));
    let failed = db.get_failed_blocks_in_range(1, 12).await.unwrap();
    assert_eq!(failed.iter().map(|block| block.height).collect::<Vec<_>>(), vec![5]);

    ctx.daemon.set_height_failing(5, false);
    let second = ctx
        .orchestrator()
        .run(fast_scan(), RangeOptions::new([ALICE], ScanMode::Incremental))
        .await
        .unwrap();
    assert_eq!(second.status, ScanStatus::Complete);
    assert_eq!(second.blocks_failed, 0);
    assert_eq!(second.total_blocks, 1);

    // Only the failed height needed classifying again
    assert_eq!(ctx.daemon.calls("getblockhash"), 13);
    assert_eq!(db.count_stake_events().await.unwrap(), 2);
    assert_eq!(db.get_identity(ALICE).await.unwrap().unwrap().last_scanned_block, Some(12));
    assert!(db.get_failed_blocks_in_range(1, 12).await.unwrap().is_empty());
    let stats = db.get_identity_stake_stats(ALICE).await.unwrap().unwrap();
    assert_eq!(stats.total_stakes, 2);
    assert_eq!(stats.total_rewards_sats, 2 * REWARD_SATS);
}

#[tokio::test]
async fn test_permanently_failing_block_does_not_stall_the_cursor() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=40)
            .with_stake_block(30, ALICE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;
    ctx.daemon.set_height_failing(5, true);
    let db = ctx.db();
    let config = ScanConfig { max_blocks_per_scan: 10, ..fast_scan() };
    let options = RangeOptions::new([ALICE], ScanMode::Incremental);

    let mut cursors = Vec::new();
    let mut walked = Vec::new();
    let mut lookups = Vec::new();
    for _ in 0..3 {
        let progress = ctx.orchestrator().run(config.clone(), options.clone()).await.unwrap();
        assert_eq!(progress.status, ScanStatus::Complete);
        assert_eq!(progress.blocks_failed, 1);
        walked.push(progress.total_blocks);
        lookups.push(ctx.daemon.calls("getblockhash"));
        cursors.push(db.get_identity(ALICE).await.unwrap().unwrap().last_scanned_block);
    }

    assert_eq!(cursors, vec![Some(10), Some(20), Some(30)]);
    // Each later pass walks its new window plus the failed height
    assert_eq!(walked, vec![10, 11, 11]);
    assert_eq!(lookups, vec![10, 21, 32]);
    assert_eq!(db.count_stake_events().await.unwrap(), 1);
    let failed = db.get_failed_blocks_in_range(1, 40).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!((failed[0].height, failed[0].attempts), (5, 3));
}
