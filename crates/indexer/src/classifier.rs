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

//! Stake/work classification of block heights.
//!
//! Classifying a height costs two daemon calls (`getblockhash` then a summary `getblock`), and a
//! height's classification never changes once it is buried. The [PosBlockIndex] remembers which
//! heights have been classified and which of them are stake blocks, so a height is classified at
//! most once across scans, identities and process restarts.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::{stream, StreamExt};
use moka::{future::Cache, policy::EvictionPolicy};
use serde::Serialize;
use thiserror::Error;
use verus_staking::Block;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitError},
    db::{DbError, PosBlock, StakesDbObj},
    rpc::{DaemonClient, RpcError},
};

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Database unavailable: circuit '{name}' is open, retry in {retry_in:?}")]
    DatabaseUnavailable { name: String, retry_in: Duration },

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Invalid height range {start}..={end}")]
    BadRange { start: u64, end: u64 },
}

impl From<CircuitError<DbError>> for ClassifyError {
    fn from(err: CircuitError<DbError>) -> Self {
        match err {
            CircuitError::Open { name, retry_in } => {
                ClassifyError::DatabaseUnavailable { name, retry_in }
            }
            CircuitError::Inner(err) => ClassifyError::Database(err),
        }
    }
}

/// Disjoint, non-adjacent inclusive height ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeightRanges {
    /// start -> end
    ranges: BTreeMap<u64, u64>,
}

impl HeightRanges {
    pub fn insert(&mut self, start: u64, end: u64) {
        if start > end {
            return;
        }
        // Ends increase with starts, so walking left from the last candidate finds every range
        // that overlaps or touches the new one.
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end.saturating_add(1))
            .rev()
            .take_while(|&(_, &e)| e.saturating_add(1) >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        let mut merged = (start, end);
        for (s, e) in touching {
            self.ranges.remove(&s);
            merged = (merged.0.min(s), merged.1.max(e));
        }
        self.ranges.insert(merged.0, merged.1);
    }

    pub fn contains(&self, height: u64) -> bool {
        self.ranges.range(..=height).next_back().is_some_and(|(_, &end)| end >= height)
    }

    /// Sub-ranges of `start..=end` not covered by the set.
    pub fn gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        if start > end {
            return gaps;
        }
        let mut cursor = start;
        let first = self.ranges.range(..=start).next_back().map(|(&s, &e)| (s, e));
        let rest = (start < end)
            .then(|| self.ranges.range(start + 1..=end))
            .into_iter()
            .flatten()
            .map(|(&s, &e)| (s, e));
        for (s, e) in first.into_iter().chain(rest) {
            if e < cursor {
                continue;
            }
            if s > cursor {
                gaps.push((cursor, s - 1));
            }
            match e.checked_add(1) {
                Some(next) => cursor = next,
                None => return gaps,
            }
            if cursor > end {
                return gaps;
            }
        }
        gaps.push((cursor, end));
        gaps
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of heights covered.
    pub fn height_count(&self) -> u64 {
        self.iter().map(|(start, end)| (end - start).saturating_add(1)).sum()
    }
}

/// Collapse sorted, de-duplicated heights into maximal contiguous runs.
pub fn contiguous_runs(heights: &[u64]) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for &height in heights {
        match runs.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(height) => *end = height,
            _ => runs.push((height, height)),
        }
    }
    runs
}

/// Which heights have been classified, and which of those are stake blocks.
#[derive(Debug, Default, Clone)]
pub struct PosBlockIndex {
    classified: HeightRanges,
    stake_blocks: BTreeMap<u64, PosBlock>,
}

impl PosBlockIndex {
    pub fn record(
        &mut self,
        ranges: &[(u64, u64)],
        stake_blocks: impl IntoIterator<Item = PosBlock>,
    ) {
        for block in stake_blocks {
            self.stake_blocks.insert(block.height, block);
        }
        for &(start, end) in ranges {
            self.classified.insert(start, end);
        }
    }

    pub fn is_classified(&self, height: u64) -> bool {
        self.classified.contains(height)
    }

    pub fn unclassified(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.classified.gaps(start, end)
    }

    pub fn stake_block(&self, height: u64) -> Option<&PosBlock> {
        self.stake_blocks.get(&height)
    }

    pub fn stake_blocks_in(&self, start: u64, end: u64) -> Vec<PosBlock> {
        if start > end {
            return Vec::new();
        }
        self.stake_blocks.range(start..=end).map(|(_, block)| block.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockCacheStats {
    pub capacity: u64,
    /// Approximate; pending evictions may not be reflected yet.
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub height: u64,
    pub is_stake_block: bool,
    /// Present for stake blocks.
    pub block: Option<PosBlock>,
}

#[derive(Debug, Clone)]
pub struct RangeClassification {
    pub start: u64,
    pub end: u64,
    /// Every known stake block in the range, ordered by height.
    pub stake_blocks: Vec<PosBlock>,
    /// Heights that could not be classified in this pass, ordered by height.
    pub failed: Vec<(u64, RpcError)>,
    /// Heights classified by querying the daemon in this pass.
    pub fetched: u64,
}

impl RangeClassification {
    /// Longest wait requested by an open daemon circuit, if any height failed on one.
    pub fn circuit_open_retry_in(&self) -> Option<Duration> {
        self.failed.iter().filter_map(|(_, err)| err.circuit_open_retry_in()).max()
    }
}

#[derive(Debug, Default)]
struct ClassifierState {
    index: PosBlockIndex,
    /// Height ranges whose persisted classification has been read into `index`.
    loaded: HeightRanges,
}

pub struct BlockClassifier {
    db: StakesDbObj,
    db_breaker: Arc<CircuitBreaker>,
    state: Mutex<ClassifierState>,
    /// Decoded stake blocks by height. `None` when caching is disabled.
    blocks: Option<Cache<u64, Arc<Block>>>,
    capacity: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockClassifier {
    pub fn new(db: StakesDbObj, db_breaker: Arc<CircuitBreaker>, cache_capacity: usize) -> Self {
        let capacity = cache_capacity as u64;
        let blocks = (capacity > 0).then(|| {
            Cache::builder().eviction_policy(EvictionPolicy::lru()).max_capacity(capacity).build()
        });
        Self {
            db,
            db_breaker,
            state: Mutex::new(ClassifierState::default()),
            blocks,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClassifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache_stats(&self) -> BlockCacheStats {
        BlockCacheStats {
            capacity: self.capacity,
            entries: self.blocks.as_ref().map_or(0, |blocks| blocks.entry_count()),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Classify a single height, from the index when possible.
    pub async fn classify(
        &self,
        client: &DaemonClient,
        height: u64,
    ) -> Result<Classification, ClassifyError> {
        self.ensure_loaded(height, height).await?;
        {
            let state = self.state();
            if state.index.is_classified(height) {
                let block = state.index.stake_block(height).cloned();
                return Ok(Classification { height, is_stake_block: block.is_some(), block });
            }
        }

        let block = self.fetch_classification(client, height).await?;
        self.persist(block.iter().cloned().collect(), vec![(height, height)]).await?;
        self.state().index.record(&[(height, height)], block.clone());
        Ok(Classification { height, is_stake_block: block.is_some(), block })
    }

    /// Classify every height in `start..=end` that the index does not already know, with up to
    /// `concurrency` daemon requests in flight.
    ///
    /// Heights that fail are reported in [RangeClassification::failed] and left unclassified so a
    /// later pass retries them. Successfully classified runs are persisted before returning.
    pub async fn stake_heights(
        &self,
        client: &DaemonClient,
        start: u64,
        end: u64,
        concurrency: usize,
    ) -> Result<RangeClassification, ClassifyError> {
        if start > end {
            return Err(ClassifyError::BadRange { start, end });
        }
        self.ensure_loaded(start, end).await?;

        let pending: Vec<u64> = self
            .state()
            .index
            .unclassified(start, end)
            .into_iter()
            .flat_map(|(s, e)| s..=e)
            .collect();
        let fetched = pending.len() as u64;

        let lookups: Vec<_> =
            pending.into_iter().map(|height| self.classify_height(client, height)).collect();
        let results: Vec<(u64, Result<Option<PosBlock>, RpcError>)> =
            stream::iter(lookups).buffer_unordered(concurrency.max(1)).collect().await;

        let mut classified = Vec::with_capacity(results.len());
        let mut new_stake_blocks = Vec::new();
        let mut failed = Vec::new();
        for (height, result) in results {
            match result {
                Ok(block) => {
                    classified.push(height);
                    new_stake_blocks.extend(block);
                }
                Err(err) => failed.push((height, err)),
            }
        }
        classified.sort_unstable();
        failed.sort_by_key(|(height, _)| *height);

        let runs = contiguous_runs(&classified);
        if !new_stake_blocks.is_empty() || !runs.is_empty() {
            tracing::debug!(
                "Classified {} heights in {start}..={end}: {} stake blocks, {} failures",
                classified.len(),
                new_stake_blocks.len(),
                failed.len()
            );
        }
        self.persist(new_stake_blocks.clone(), runs.clone()).await?;

        let stake_blocks = {
            let mut state = self.state();
            state.index.record(&runs, new_stake_blocks);
            state.index.stake_blocks_in(start, end)
        };

        Ok(RangeClassification { start, end, stake_blocks, failed, fetched })
    }

    /// Decoded transactions of a known stake block.
    ///
    /// Concurrent lookups of the same uncached height share a single daemon request.
    pub async fn block_detail(
        &self,
        client: &DaemonClient,
        block: &PosBlock,
        use_cache: bool,
    ) -> Result<Arc<Block>, RpcError> {
        let Some(blocks) = self.blocks.as_ref().filter(|_| use_cache) else {
            return Ok(Arc::new(client.get_block(&block.hash).await?));
        };

        let entry = blocks
            .entry(block.height)
            .or_try_insert_with(async { client.get_block(&block.hash).await.map(Arc::new) })
            .await
            .map_err(Arc::unwrap_or_clone)?;
        if entry.is_fresh() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry.into_value())
    }

    async fn classify_height(
        &self,
        client: &DaemonClient,
        height: u64,
    ) -> (u64, Result<Option<PosBlock>, RpcError>) {
        (height, self.fetch_classification(client, height).await)
    }

    async fn fetch_classification(
        &self,
        client: &DaemonClient,
        height: u64,
    ) -> Result<Option<PosBlock>, RpcError> {
        let hash = client.get_block_hash(height).await?;
        let summary = client.get_block_summary(&hash).await?;
        Ok(summary.is_stake_block().then(|| PosBlock {
            height,
            hash: summary.hash,
            time: summary.time,
        }))
    }

    /// Stake blocks are written before the ranges that cover them, so a recorded range never
    /// refers to a missing stake block.
    async fn persist(
        &self,
        stake_blocks: Vec<PosBlock>,
        ranges: Vec<(u64, u64)>,
    ) -> Result<(), ClassifyError> {
        if stake_blocks.is_empty() && ranges.is_empty() {
            return Ok(());
        }
        let db = self.db.clone();
        self.db_breaker
            .execute(|| async move {
                db.upsert_pos_blocks(stake_blocks).await?;
                db.record_classified_ranges(ranges).await
            })
            .await?;
        Ok(())
    }

    async fn ensure_loaded(&self, start: u64, end: u64) -> Result<(), ClassifyError> {
        let gaps = self.state().loaded.gaps(start, end);
        for (gap_start, gap_end) in gaps {
            let db = self.db.clone();
            let (ranges, blocks) = self
                .db_breaker
                .execute(|| async move {
                    let ranges = db.get_classified_ranges(gap_start, gap_end).await?;
                    let blocks = db.get_pos_blocks_in_range(gap_start, gap_end).await?;
                    Ok::<_, DbError>((ranges, blocks))
                })
                .await?;

            let mut state = self.state();
            state.index.record(&ranges, blocks);
            state.loaded.insert(gap_start, gap_end);
        }
        Ok(())
    }
}
