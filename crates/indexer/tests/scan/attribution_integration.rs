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
    scanner::{RangeOptions, ScanConfig, ScanMode, ScanStatus},
    test_utils::{block_hash, MockDaemon},
};

use crate::common::{fast_scan, TestContext, ALICE, BOB, DELEGATE, REWARD_SATS};

#[tokio::test]
async fn test_delegate_stakes_are_not_credited() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=10)
            .with_stake_block(3, ALICE, REWARD_SATS)
            .with_stake_block(7, DELEGATE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;
    let orchestrator = ctx.orchestrator();

    let progress = orchestrator
        .run(fast_scan(), RangeOptions::new([ALICE], ScanMode::FullHistory))
        .await
        .unwrap();
    assert_eq!(progress.status, ScanStatus::Complete);
    assert_eq!(progress.total_blocks, 10);
    assert_eq!(progress.blocks_processed, 10);
    assert_eq!(progress.stake_events_found, 1);
    assert_eq!(progress.addresses_processed, 1);
    assert_eq!(progress.error, None);

    let db = ctx.db();
    let events = db.get_stake_events_by_identity(ALICE, 0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].block_height, 3);
    assert_eq!(events[0].block_hash, block_hash(3));
    assert_eq!(events[0].vout_index, 0);
    assert_eq!(events[0].amount_sats, REWARD_SATS);

    let identity = db.get_identity(ALICE).await.unwrap().unwrap();
    assert_eq!(identity.first_seen_block, Some(1));
    assert_eq!(identity.last_scanned_block, Some(10));

    let stats = db.get_identity_stake_stats(ALICE).await.unwrap().unwrap();
    assert_eq!(stats.total_stakes, 1);
    assert_eq!(stats.first_stake_height, Some(3));
    assert_eq!(stats.last_stake_height, Some(3));
}

#[tokio::test]
async fn test_rescanning_a_range_is_idempotent() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=20)
            .with_stake_block(4, ALICE, REWARD_SATS)
            .with_stake_block(12, ALICE, REWARD_SATS)
            .with_stake_block(13, DELEGATE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;
    let orchestrator = ctx.orchestrator();
    let options = RangeOptions::new([ALICE], ScanMode::Range { start: 1, end: 20 });

    let first = orchestrator.run(fast_scan(), options.clone()).await.unwrap();
    let count = ctx.db().count_stake_events().await.unwrap();
    let second = orchestrator.run(fast_scan(), options).await.unwrap();

    assert_eq!(first.stake_events_found, 2);
    assert_eq!(second.stake_events_found, 2);
    assert_eq!(count, 2);
    assert_eq!(ctx.db().count_stake_events().await.unwrap(), count);
}

#[tokio::test]
async fn test_stakes_only_credited_within_each_identity_range() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=12)
            .with_stake_block(3, BOB, REWARD_SATS)
            .with_stake_block(4, ALICE, REWARD_SATS)
            .with_stake_block(8, BOB, REWARD_SATS)
            .with_stake_block(11, ALICE, REWARD_SATS)
            .with_identity(ALICE, 1)
            .with_identity(BOB, 6),
    )
    .await;

    let progress = ctx
        .orchestrator()
        .run(fast_scan(), RangeOptions::new([ALICE, BOB], ScanMode::FullHistory))
        .await
        .unwrap();
    assert_eq!(progress.status, ScanStatus::Complete);
    // One batch walking the union of 1..=12 and 6..=12
    assert_eq!(progress.total_blocks, 12);
    assert_eq!(progress.addresses_processed, 2);

    let db = ctx.db();
    let alice: Vec<u64> = db
        .get_stake_events_by_identity(ALICE, 0, 10)
        .await
        .unwrap()
        .iter()
        .map(|event| event.block_height)
        .collect();
    let bob: Vec<u64> = db
        .get_stake_events_by_identity(BOB, 0, 10)
        .await
        .unwrap()
        .iter()
        .map(|event| event.block_height)
        .collect();
    assert_eq!(alice, vec![11, 4]);
    // Block 3 predates the identity's range
    assert_eq!(bob, vec![8]);
}

#[tokio::test]
async fn test_gap_between_identity_ranges_is_not_walked() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=60)
            .with_stake_block(3, ALICE, REWARD_SATS)
            .with_stake_block(52, BOB, REWARD_SATS)
            .with_identity(ALICE, 1)
            .with_identity(BOB, 50),
    )
    .await;
    let config = ScanConfig { max_blocks_per_scan: 5, ..fast_scan() };

    let progress = ctx
        .orchestrator()
        .run(config, RangeOptions::new([ALICE, BOB], ScanMode::FullHistory))
        .await
        .unwrap();
    assert_eq!(progress.status, ScanStatus::Complete);
    // 1..=5 and 50..=54 only
    assert_eq!(progress.total_blocks, 10);
    assert_eq!(progress.blocks_processed, 10);
    assert_eq!(ctx.daemon.calls("getblockhash"), 10);
    assert_eq!(progress.stake_events_found, 2);

    let db = ctx.db();
    assert_eq!(db.get_identity(ALICE).await.unwrap().unwrap().last_scanned_block, Some(5));
    assert_eq!(db.get_identity(BOB).await.unwrap().unwrap().last_scanned_block, Some(54));
}

#[tokio::test]
async fn test_detail_fetches_scale_with_stake_blocks() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=40)
            .with_stake_block(5, ALICE, REWARD_SATS)
            .with_stake_block(15, ALICE, REWARD_SATS)
            .with_stake_block(25, DELEGATE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;
    let options = RangeOptions::new([ALICE], ScanMode::FullHistory);

    let orchestrator = ctx.orchestrator();
    orchestrator.run(fast_scan(), options.clone()).await.unwrap();
    assert_eq!(ctx.daemon.calls("getblockhash"), 40);
    assert_eq!(ctx.daemon.detail_calls(), 3);

    // Same orchestrator: classification and block detail are both remembered
    orchestrator.run(fast_scan(), options.clone()).await.unwrap();
    assert_eq!(ctx.daemon.calls("getblockhash"), 40);
    assert_eq!(ctx.daemon.detail_calls(), 3);
    assert_eq!(orchestrator.block_cache_stats().hits, 3);

    // Fresh orchestrator: classification comes from the persisted index
    let progress = ctx.orchestrator().run(fast_scan(), options).await.unwrap();
    assert_eq!(progress.stake_events_found, 2);
    assert_eq!(ctx.daemon.calls("getblockhash"), 40);
    assert_eq!(ctx.daemon.detail_calls(), 6);
    // Creation height was memoized on the first scan
    assert_eq!(ctx.daemon.calls("getidentityhistory"), 1);
}

#[tokio::test]
async fn test_recent_mode_scans_from_tip() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=40)
            .with_stake_block(20, ALICE, REWARD_SATS)
            .with_stake_block(35, ALICE, REWARD_SATS)
            .with_identity(ALICE, 1),
    )
    .await;

    let progress = ctx
        .orchestrator()
        .run(fast_scan(), RangeOptions::new([ALICE], ScanMode::Recent { blocks: 10 }))
        .await
        .unwrap();
    assert_eq!(progress.total_blocks, 10);
    assert_eq!(progress.stake_events_found, 1);
    assert_eq!(ctx.daemon.calls("getblockhash"), 10);
}

#[tokio::test]
async fn test_unknown_identity_is_skipped() {
    let ctx = TestContext::new(
        MockDaemon::new()
            .with_work_blocks(1..=8)
            .with_stake_block(6, ALICE, REWARD_SATS)
            .with_identity(ALICE, 2),
    )
    .await;

    let progress = ctx
        .orchestrator()
        .run(fast_scan(), RangeOptions::new([ALICE, "iUnknownIdentity"], ScanMode::FullHistory))
        .await
        .unwrap();
    assert_eq!(progress.status, ScanStatus::Complete);
    assert_eq!(progress.total_addresses, 2);
    assert_eq!(progress.addresses_processed, 2);
    assert_eq!(progress.total_blocks, 7);
    assert_eq!(progress.stake_events_found, 1);
    assert_eq!(ctx.db().get_identity("iUnknownIdentity").await.unwrap(), None);
}
