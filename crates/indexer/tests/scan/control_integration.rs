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

use verus_stake_indexer::{
    scanner::{RangeOptions, ScanConfig, ScanError, ScanMode, ScanStatus, StartOutcome},
    test_utils::MockDaemon,
};

use crate::common::{fast_scan, wait_until, TestContext, ALICE, DELEGATE, REWARD_SATS};

fn forty_blocks() -> MockDaemon {
    MockDaemon::new()
        .with_work_blocks(1..=40)
        .with_stake_block(10, ALICE, REWARD_SATS)
        .with_stake_block(22, DELEGATE, REWARD_SATS)
        .with_stake_block(30, ALICE, REWARD_SATS)
        .with_identity(ALICE, 1)
}

/// Slow enough between chunks for control requests to land mid-scan.
fn paced_scan() -> ScanConfig {
    ScanConfig { delay_between_batches_ms: 40, ..fast_scan() }
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let ctx = TestContext::new(forty_blocks()).await;
    let orchestrator = ctx.orchestrator();
    let options = RangeOptions::new([ALICE], ScanMode::FullHistory);

    assert_eq!(orchestrator.progress().status, ScanStatus::Idle);
    assert_eq!(orchestrator.start(paced_scan(), options.clone()).unwrap(), StartOutcome::Accepted);

    match orchestrator.start(paced_scan(), options.clone()).unwrap() {
        StartOutcome::Conflict(active) => assert!(active.status.is_active()),
        StartOutcome::Accepted => panic!("second scan was accepted"),
    }
    assert!(matches!(
        orchestrator.run(fast_scan(), options.clone()).await,
        Err(ScanError::Conflict(_))
    ));

    let progress = orchestrator.wait().await;
    assert_eq!(progress.status, ScanStatus::Complete);
    assert_eq!(progress.stake_events_found, 2);

    // Terminal scans no longer hold the orchestrator
    assert!(!orchestrator.stop());
    assert_eq!(orchestrator.start(fast_scan(), options).unwrap(), StartOutcome::Accepted);
    assert_eq!(orchestrator.wait().await.status, ScanStatus::Complete);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_starting() {
    let ctx = TestContext::new(forty_blocks()).await;
    let orchestrator = ctx.orchestrator();

    let result = orchestrator.start(
        ScanConfig { block_batch_size: 0, ..fast_scan() },
        RangeOptions::new([ALICE], ScanMode::FullHistory),
    );
    assert!(matches!(result, Err(ScanError::InvalidRequest(_))));
    assert_eq!(orchestrator.progress().status, ScanStatus::Idle);
}

#[tokio::test]
async fn test_stopped_scan_resumes_without_refetching() {
    let ctx = TestContext::new(forty_blocks()).await;
    let orchestrator = ctx.orchestrator();

    orchestrator.start(paced_scan(), RangeOptions::new([ALICE], ScanMode::FullHistory)).unwrap();
    wait_until(&orchestrator, |p| p.blocks_processed >= 8).await;
    assert!(orchestrator.stop());

    let stopped = orchestrator.wait().await;
    assert_eq!(stopped.status, ScanStatus::Stopped);
    assert!(stopped.blocks_processed < 40, "scan ran to completion: {stopped:?}");

    let db = ctx.db();
    let last_scanned = db.get_identity(ALICE).await.unwrap().unwrap().last_scanned_block;
    assert_eq!(last_scanned, Some(stopped.blocks_processed));

    // A fresh orchestrator picks up where the stopped scan left off
    let resumed = ctx
        .orchestrator()
        .run(fast_scan(), RangeOptions::new([ALICE], ScanMode::Incremental))
        .await
        .unwrap();
    assert_eq!(resumed.status, ScanStatus::Complete);
    assert_eq!(resumed.total_blocks, 40 - stopped.blocks_processed);

    assert_eq!(ctx.daemon.calls("getblockhash"), 40);
    assert_eq!(db.count_stake_events().await.unwrap(), 2);
    assert_eq!(db.get_identity(ALICE).await.unwrap().unwrap().last_scanned_block, Some(40));
}

#[tokio::test]
async fn test_pause_holds_progress_until_resumed() {
    let ctx = TestContext::new(forty_blocks()).await;
    let orchestrator = ctx.orchestrator();

    assert!(!orchestrator.pause());
    orchestrator.start(paced_scan(), RangeOptions::new([ALICE], ScanMode::FullHistory)).unwrap();
    wait_until(&orchestrator, |p| p.blocks_processed >= 4).await;
    assert!(orchestrator.pause());
    assert!(!orchestrator.pause());

    let paused = wait_until(&orchestrator, |p| p.status == ScanStatus::Paused).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(orchestrator.progress().blocks_processed, paused.blocks_processed);
    assert_eq!(orchestrator.progress().status, ScanStatus::Paused);

    assert!(orchestrator.resume());
    assert!(!orchestrator.resume());
    let progress = orchestrator.wait().await;
    assert_eq!(progress.status, ScanStatus::Complete);
    assert_eq!(progress.blocks_processed, 40);

    let stats = orchestrator.rate_limiter_stats();
    assert_eq!(stats.key, "global");
    assert!(stats.current.hour > 0);
    assert!(stats.is_healthy);
}

#[tokio::test]
async fn test_stop_while_paused() {
    let ctx = TestContext::new(forty_blocks()).await;
    let orchestrator = ctx.orchestrator();

    orchestrator.start(paced_scan(), RangeOptions::new([ALICE], ScanMode::FullHistory)).unwrap();
    wait_until(&orchestrator, |p| p.blocks_processed >= 4).await;
    assert!(orchestrator.pause());
    wait_until(&orchestrator, |p| p.status == ScanStatus::Paused).await;

    assert!(orchestrator.stop());
    let progress = orchestrator.wait().await;
    assert_eq!(progress.status, ScanStatus::Stopped);
    assert!(progress.blocks_processed < 40);
}
