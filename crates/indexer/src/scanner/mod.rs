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

//! Scan orchestration.
//!
//! A scan resolves each identity's height range, then walks the union of a batch of identities'
//! ranges chunk by chunk: classify the chunk, fetch detail for its stake blocks, attribute them,
//! persist the resulting events, and only then advance progress. Heights outside every member's
//! range are never walked. Stop and pause requests are observed between chunks.
//!
//! A height that fails is recorded in the failed-block table and does not hold back the scan
//! cursor. Full-history and incremental scans retry the failed heights behind each cursor.

mod options;
mod progress;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use verus_staking::{attribute_block, Block};

pub use options::{effective_range, RangeOptions, ScanConfig, ScanMode};
pub use progress::{ScanProgress, ScanStatus};

use crate::{
    circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
        CircuitError, DAEMON_BREAKER, DATABASE_BREAKER,
    },
    classifier::{BlockCacheStats, BlockClassifier, ClassifyError, HeightRanges},
    db::{DbError, PosBlock, StakesDbObj},
    rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterStats, GLOBAL_KEY},
    rpc::{DaemonClient, RpcError, RpcTransport, TransportError},
};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("A scan is already {0}")]
    Conflict(ScanStatus),

    #[error("Daemon unavailable: circuit '{name}' still open after {attempts} attempts")]
    DaemonUnavailable { name: String, attempts: u32 },

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Database unavailable: circuit '{name}' is open, retry in {retry_in:?}")]
    DatabaseUnavailable { name: String, retry_in: Duration },
}

impl From<CircuitError<DbError>> for ScanError {
    fn from(err: CircuitError<DbError>) -> Self {
        match err {
            CircuitError::Open { name, retry_in } => ScanError::DatabaseUnavailable { name, retry_in },
            CircuitError::Inner(err) => ScanError::Database(err),
        }
    }
}

impl From<ClassifyError> for ScanError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Database(err) => ScanError::Database(err),
            ClassifyError::DatabaseUnavailable { name, retry_in } => {
                ScanError::DatabaseUnavailable { name, retry_in }
            }
            ClassifyError::Rpc(err) => ScanError::Rpc(err),
            ClassifyError::BadRange { start, end } => {
                ScanError::InvalidRequest(format!("invalid height range {start}..={end}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Accepted,
    /// Another scan holds the orchestrator. Carries its current progress.
    Conflict(ScanProgress),
}

/// Shared resources of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    pub rate_limit: RateLimitConfig,
    pub daemon_breaker: CircuitBreakerConfig,
    pub database_breaker: CircuitBreakerConfig,
    /// Decoded stake blocks kept in memory; zero disables the cache.
    pub block_cache_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::daemon(),
            daemon_breaker: CircuitBreakerConfig::daemon(),
            database_breaker: CircuitBreakerConfig::database(),
            block_cache_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanControl {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Complete,
    Stopped,
}

/// One identity's slice of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IdentityRange {
    identity: String,
    /// Heights selected by the scan mode.
    window: Option<(u64, u64)>,
    /// Previously failed heights behind the cursor, ascending.
    retry: Vec<u64>,
    /// First height not yet covered by the identity's scan cursor.
    resume_from: u64,
}

impl IdentityRange {
    fn contains(&self, height: u64) -> bool {
        self.window.is_some_and(|(start, end)| (start..=end).contains(&height))
            || self.retry.binary_search(&height).is_ok()
    }
}

/// Identities walked together over the union of their ranges.
#[derive(Debug, Clone)]
struct ScanBatch {
    members: Vec<IdentityRange>,
    heights: HeightRanges,
}

impl ScanBatch {
    fn new(members: &[IdentityRange]) -> Option<Self> {
        let mut heights = HeightRanges::default();
        for member in members {
            if let Some((start, end)) = member.window {
                heights.insert(start, end);
            }
            for &height in &member.retry {
                heights.insert(height, height);
            }
        }
        (!heights.is_empty()).then(|| Self { members: members.to_vec(), heights })
    }

    fn len(&self) -> u64 {
        self.heights.height_count()
    }

    /// Identities whose own range contains `height`.
    fn identities_at(&self, height: u64) -> HashSet<String> {
        self.members
            .iter()
            .filter(|m| m.contains(height))
            .map(|m| m.identity.clone())
            .collect()
    }

    /// Ascending chunks of at most `size` heights. A chunk never spans a gap between ranges.
    fn chunks(&self, size: u64) -> Vec<(u64, u64)> {
        let mut chunks = Vec::new();
        for (start, end) in self.heights.iter() {
            let mut chunk_start = start;
            loop {
                let chunk_end = end.min(chunk_start.saturating_add(size.saturating_sub(1)));
                chunks.push((chunk_start, chunk_end));
                match chunk_end.checked_add(1) {
                    Some(next) if next <= end => chunk_start = next,
                    _ => break,
                }
            }
        }
        chunks
    }
}

struct ChunkOutcome {
    events_found: u64,
    failed: u64,
}

struct Inner {
    db: StakesDbObj,
    transport: Arc<dyn RpcTransport>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    daemon_breaker: Arc<CircuitBreaker>,
    db_breaker: Arc<CircuitBreaker>,
    classifier: BlockClassifier,
    progress: RwLock<ScanProgress>,
    status: watch::Sender<ScanStatus>,
    control: watch::Sender<ScanControl>,
}

/// Runs at most one scan at a time and exposes its control surface.
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl ScanOrchestrator {
    pub fn new(
        db: StakesDbObj,
        transport: Arc<dyn RpcTransport>,
        config: OrchestratorConfig,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let daemon_breaker = breakers.get_or_create(DAEMON_BREAKER, config.daemon_breaker);
        let db_breaker = breakers.get_or_create(DATABASE_BREAKER, config.database_breaker);
        let classifier =
            BlockClassifier::new(db.clone(), db_breaker.clone(), config.block_cache_capacity);

        Self {
            inner: Arc::new(Inner {
                db,
                transport,
                rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
                breakers,
                daemon_breaker,
                db_breaker,
                classifier,
                progress: RwLock::new(ScanProgress::default()),
                status: watch::Sender::new(ScanStatus::Idle),
                control: watch::Sender::new(ScanControl::Run),
            }),
        }
    }

    /// Start a scan in the background.
    pub fn start(
        &self,
        config: ScanConfig,
        options: RangeOptions,
    ) -> Result<StartOutcome, ScanError> {
        config.validate().map_err(ScanError::InvalidRequest)?;
        options.validate().map_err(ScanError::InvalidRequest)?;
        if let Some(active) = self.inner.begin(&options) {
            return Ok(StartOutcome::Conflict(active));
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.execute(config, options).await;
        });
        Ok(StartOutcome::Accepted)
    }

    /// Run a scan to completion on the current task.
    pub async fn run(
        &self,
        config: ScanConfig,
        options: RangeOptions,
    ) -> Result<ScanProgress, ScanError> {
        config.validate().map_err(ScanError::InvalidRequest)?;
        options.validate().map_err(ScanError::InvalidRequest)?;
        if let Some(active) = self.inner.begin(&options) {
            return Err(ScanError::Conflict(active.status));
        }
        Ok(self.inner.execute(config, options).await)
    }

    /// Wait until no scan is running or paused, then return the final progress.
    pub async fn wait(&self) -> ScanProgress {
        let mut status = self.inner.status.subscribe();
        // The sender lives as long as `inner`, so this only returns once the scan settles.
        let _ = status.wait_for(|status| !status.is_active()).await;
        self.progress()
    }

    /// Ask the active scan to stop after its current chunk.
    pub fn stop(&self) -> bool {
        if !self.progress().status.is_active() {
            return false;
        }
        tracing::info!("Stop requested");
        self.inner.control.send_replace(ScanControl::Stop);
        true
    }

    /// Ask the running scan to pause after its current chunk.
    pub fn pause(&self) -> bool {
        if self.progress().status != ScanStatus::Running
            || *self.inner.control.borrow() != ScanControl::Run
        {
            return false;
        }
        tracing::info!("Pause requested");
        self.inner.control.send_replace(ScanControl::Pause);
        true
    }

    pub fn resume(&self) -> bool {
        if !self.progress().status.is_active()
            || *self.inner.control.borrow() != ScanControl::Pause
        {
            return false;
        }
        tracing::info!("Resume requested");
        self.inner.control.send_replace(ScanControl::Run);
        true
    }

    pub fn progress(&self) -> ScanProgress {
        self.inner.progress()
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.inner.rate_limiter.stats(GLOBAL_KEY)
    }

    pub fn circuit_breaker_stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.inner.breakers.stats(name)
    }

    pub fn all_circuit_breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.inner.breakers.all_stats()
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> bool {
        self.inner.breakers.reset(name)
    }

    pub fn block_cache_stats(&self) -> BlockCacheStats {
        self.inner.classifier.cache_stats()
    }
}

impl Inner {
    fn progress(&self) -> ScanProgress {
        self.progress.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_progress(&self, update: impl FnOnce(&mut ScanProgress)) {
        let status = {
            let mut progress = self.progress.write().unwrap_or_else(PoisonError::into_inner);
            update(&mut progress);
            progress.status
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Claim the orchestrator for a new scan. Returns the active scan's progress on conflict.
    fn begin(&self, options: &RangeOptions) -> Option<ScanProgress> {
        {
            let mut progress = self.progress.write().unwrap_or_else(PoisonError::into_inner);
            if progress.status.is_active() {
                return Some(progress.clone());
            }
            *progress = ScanProgress::started(options.identities.len() as u64);
        }
        self.control.send_replace(ScanControl::Run);
        self.status.send_replace(ScanStatus::Running);
        None
    }

    fn client(&self, config: &ScanConfig) -> DaemonClient {
        DaemonClient::new(
            self.transport.clone(),
            self.rate_limiter.clone(),
            self.daemon_breaker.clone(),
            config.retry_policy(),
        )
    }

    async fn execute(&self, config: ScanConfig, options: RangeOptions) -> ScanProgress {
        let started = Instant::now();
        let mut control = self.control.subscribe();
        tracing::info!(
            "Starting {:?} scan of {} identities",
            options.mode,
            options.identities.len()
        );

        let result = self.scan(&config, &options, &mut control, started).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                let status = match outcome {
                    ScanOutcome::Complete => ScanStatus::Complete,
                    ScanOutcome::Stopped => ScanStatus::Stopped,
                };
                self.update_progress(|p| {
                    p.status = status;
                    p.estimated_completion = None;
                });
                let progress = self.progress();
                tracing::info!(
                    "Scan {status} in {:.2}s: {} blocks, {} stake events, {} failed blocks",
                    elapsed,
                    progress.blocks_processed,
                    progress.stake_events_found,
                    progress.blocks_failed
                );
            }
            Err(err) => {
                tracing::error!("Scan failed after {:.2}s: {err}", elapsed);
                self.update_progress(|p| {
                    p.status = ScanStatus::Error;
                    p.estimated_completion = None;
                    p.error = Some(err.to_string());
                });
            }
        }
        self.progress()
    }

    /// Returns false when the scan should stop. Blocks while paused.
    async fn checkpoint(&self, control: &mut watch::Receiver<ScanControl>) -> bool {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                ScanControl::Run => {
                    self.update_progress(|p| p.status = ScanStatus::Running);
                    return true;
                }
                ScanControl::Stop => return false,
                ScanControl::Pause => {
                    self.update_progress(|p| p.status = ScanStatus::Paused);
                    tracing::info!("Scan paused");
                    if control.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn scan(
        &self,
        config: &ScanConfig,
        options: &RangeOptions,
        control: &mut watch::Receiver<ScanControl>,
        started: Instant,
    ) -> Result<ScanOutcome, ScanError> {
        let client = self.client(config);
        let tip = self.with_daemon_retry(config, || client.get_blockchain_info()).await?.blocks;
        tracing::debug!("Chain tip at {tip}");

        let mut targets = Vec::with_capacity(options.identities.len());
        let mut settled = 0u64;
        for identity in &options.identities {
            if !self.checkpoint(control).await {
                return Ok(ScanOutcome::Stopped);
            }
            match self.resolve_range(&client, config, options.mode, identity, tip).await? {
                Some(range) => targets.push(range),
                None => settled += 1,
            }
        }

        let batches: Vec<ScanBatch> =
            targets.chunks(config.address_batch_size).filter_map(ScanBatch::new).collect();
        let total_blocks: u64 = batches.iter().map(ScanBatch::len).sum();
        self.update_progress(|p| {
            p.total_blocks = total_blocks;
            p.addresses_processed = settled;
        });

        for batch in &batches {
            let outcome = self.scan_batch(&client, config, batch, control, started).await?;
            if outcome == ScanOutcome::Stopped {
                return Ok(ScanOutcome::Stopped);
            }
        }
        Ok(ScanOutcome::Complete)
    }

    async fn resolve_range(
        &self,
        client: &DaemonClient,
        config: &ScanConfig,
        mode: ScanMode,
        identity: &str,
        tip: u64,
    ) -> Result<Option<IdentityRange>, ScanError> {
        let key = identity.to_string();
        let record = self.db_call(|db| async move { db.get_identity(&key).await }).await?;

        let creation = match record.as_ref().and_then(|record| record.first_seen_block) {
            Some(height) => height,
            None => {
                let history = match self
                    .with_daemon_retry(config, || client.get_identity_history(identity, tip))
                    .await
                {
                    Ok(history) => history,
                    Err(ScanError::Rpc(RpcError::Transport(
                        err @ (TransportError::Rpc { .. } | TransportError::Parse { .. }),
                    ))) => {
                        tracing::warn!("Skipping identity {identity}: {err}");
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                };
                let Some(height) = history.creation_height() else {
                    tracing::warn!("Skipping identity {identity}: no on-chain history");
                    return Ok(None);
                };
                let key = identity.to_string();
                self.db_call(|db| async move { db.set_identity_first_seen(&key, height).await })
                    .await?;
                tracing::debug!("Identity {identity} first seen at {height}");
                height
            }
        };

        let last_scanned = record.and_then(|record| record.last_scanned_block);
        let resume_from = last_scanned.map_or(creation, |height| height.saturating_add(1));
        let window =
            effective_range(mode, creation, last_scanned, tip, config.max_blocks_per_scan);

        let retry: Vec<u64> = match last_scanned.filter(|_| mode.retries_failed_blocks()) {
            Some(cursor) if cursor >= creation => self
                .db_call(|db| async move { db.get_failed_blocks_in_range(creation, cursor).await })
                .await?
                .into_iter()
                .map(|block| block.height)
                .take(usize::try_from(config.max_blocks_per_scan).unwrap_or(usize::MAX))
                .collect(),
            _ => Vec::new(),
        };

        if window.is_none() && retry.is_empty() {
            tracing::info!("Identity {identity} has nothing to scan up to tip {tip}");
            return Ok(None);
        }
        if let Some((start, end)) = window {
            tracing::debug!("Identity {identity}: scanning {start}..={end}");
        }
        if !retry.is_empty() {
            tracing::info!("Identity {identity}: retrying {} failed heights", retry.len());
        }
        Ok(Some(IdentityRange {
            identity: identity.to_string(),
            window,
            retry,
            resume_from: resume_from.max(creation),
        }))
    }

    /// Heights in the batch that earlier scans failed on.
    async fn known_failed(&self, batch: &ScanBatch) -> Result<BTreeSet<u64>, ScanError> {
        let mut known = BTreeSet::new();
        for (start, end) in batch.heights.iter() {
            let failed = self
                .db_call(|db| async move { db.get_failed_blocks_in_range(start, end).await })
                .await?;
            known.extend(failed.into_iter().map(|block| block.height));
        }
        Ok(known)
    }

    async fn scan_batch(
        &self,
        client: &DaemonClient,
        config: &ScanConfig,
        batch: &ScanBatch,
        control: &mut watch::Receiver<ScanControl>,
        started: Instant,
    ) -> Result<ScanOutcome, ScanError> {
        let known_failed = self.known_failed(batch).await?;
        let chunks = batch.chunks(config.block_batch_size);
        let delay = config.delay_between_batches();
        let mut scanned_through = None;

        for (index, &(chunk_start, chunk_end)) in chunks.iter().enumerate() {
            if !self.checkpoint(control).await {
                self.finish_batch(batch, scanned_through).await?;
                return Ok(ScanOutcome::Stopped);
            }

            let chunk_timer = Instant::now();
            let outcome = self
                .scan_chunk(client, config, batch, chunk_start, chunk_end, &known_failed)
                .await?;
            tracing::debug!(
                "Chunk {chunk_start}..={chunk_end}: {} stake events in {:.2}s",
                outcome.events_found,
                chunk_timer.elapsed().as_secs_f64()
            );

            let elapsed = started.elapsed();
            self.update_progress(|p| {
                p.blocks_processed += chunk_end - chunk_start + 1;
                p.stake_events_found += outcome.events_found;
                p.blocks_failed += outcome.failed;
                p.update_estimate(elapsed);
            });
            scanned_through = Some(chunk_end);

            if index + 1 < chunks.len() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.finish_batch(batch, scanned_through).await?;
        self.update_progress(|p| p.addresses_processed += batch.members.len() as u64);
        Ok(ScanOutcome::Complete)
    }

    async fn scan_chunk(
        &self,
        client: &DaemonClient,
        config: &ScanConfig,
        batch: &ScanBatch,
        start: u64,
        end: u64,
        known_failed: &BTreeSet<u64>,
    ) -> Result<ChunkOutcome, ScanError> {
        let mut attempt = 0;
        let classification = loop {
            let classification = self
                .classifier
                .stake_heights(client, start, end, config.max_concurrent_requests)
                .await?;
            match classification.circuit_open_retry_in() {
                None => break classification,
                Some(retry_in) if attempt < config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Daemon circuit open while classifying {start}..={end}, retrying in {:?} ({attempt}/{})",
                        retry_in,
                        config.max_retries
                    );
                    tokio::time::sleep(retry_in).await;
                }
                Some(_) => {
                    return Err(ScanError::DaemonUnavailable {
                        name: self.daemon_breaker.name().to_string(),
                        attempts: attempt + 1,
                    })
                }
            }
        };

        let mut failures = BTreeMap::new();
        for (height, err) in &classification.failed {
            tracing::warn!("Skipping block {height}, classification failed: {err}");
            failures.insert(*height, err.to_string());
        }

        let lookups: Vec<_> = classification
            .stake_blocks
            .iter()
            .map(|block| self.fetch_detail(client, config, block))
            .collect();
        let details: Vec<(u64, Result<Arc<Block>, ScanError>)> =
            stream::iter(lookups).buffer_unordered(config.max_concurrent_requests).collect().await;

        let mut events = Vec::new();
        for (height, detail) in details {
            match detail {
                Ok(block) => match attribute_block(&block, &batch.identities_at(height)) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(err) => tracing::warn!("Skipping block {height}: {err}"),
                },
                Err(err @ ScanError::DaemonUnavailable { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!("Skipping block {height}, detail fetch failed: {err}");
                    failures.insert(height, err.to_string());
                }
            }
        }

        let events_found = events.len() as u64;
        if !events.is_empty() {
            self.db_call(|db| async move { db.upsert_stake_events(events).await }).await?;
        }

        let recovered: Vec<u64> = known_failed
            .range(start..=end)
            .filter(|height| !failures.contains_key(height))
            .copied()
            .collect();
        if !recovered.is_empty() {
            tracing::info!(
                "Recovered {} previously failed blocks in {start}..={end}",
                recovered.len()
            );
        }
        let failed = failures.len() as u64;
        if !failures.is_empty() || !recovered.is_empty() {
            self.db_call(|db| async move {
                db.record_failed_blocks(failures.into_iter().collect()).await?;
                db.clear_failed_blocks(recovered).await
            })
            .await?;
        }
        Ok(ChunkOutcome { events_found, failed })
    }

    async fn fetch_detail(
        &self,
        client: &DaemonClient,
        config: &ScanConfig,
        block: &PosBlock,
    ) -> (u64, Result<Arc<Block>, ScanError>) {
        let detail = self
            .with_daemon_retry(config, || {
                self.classifier.block_detail(client, block, config.cache_block_data)
            })
            .await;
        (block.height, detail)
    }

    /// Recompute stats for every member and advance its scan cursor to the last height walked.
    ///
    /// The cursor only moves forward, and only when the scanned window continues from it: every
    /// height between creation and the cursor has been walked, and those that failed are in the
    /// failed-block table.
    async fn finish_batch(
        &self,
        batch: &ScanBatch,
        scanned_through: Option<u64>,
    ) -> Result<(), ScanError> {
        for member in &batch.members {
            let key = member.identity.clone();
            let stats =
                self.db_call(|db| async move { db.refresh_identity_stake_stats(&key).await }).await?;
            tracing::debug!(
                "Identity {}: {} stakes, {} sats",
                member.identity,
                stats.total_stakes,
                stats.total_rewards_sats
            );

            let Some((start, end)) = member.window else {
                continue;
            };
            let Some(through) =
                scanned_through.map(|height| height.min(end)).filter(|&through| through >= start)
            else {
                continue;
            };
            if start <= member.resume_from && through >= member.resume_from {
                let key = member.identity.clone();
                self.db_call(|db| async move { db.set_identity_last_scanned(&key, through).await })
                    .await?;
            }
        }
        Ok(())
    }

    /// Retry `op` while the daemon circuit is open, waiting out its recovery timeout.
    async fn with_daemon_retry<T, F, Fut>(
        &self,
        config: &ScanConfig,
        mut op: F,
    ) -> Result<T, ScanError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(RpcError::CircuitOpen { name, retry_in }) => {
                    if attempt >= config.max_retries {
                        return Err(ScanError::DaemonUnavailable { name, attempts: attempt + 1 });
                    }
                    attempt += 1;
                    tracing::warn!(
                        "Daemon circuit '{name}' open, retrying in {:?} ({attempt}/{})",
                        retry_in,
                        config.max_retries
                    );
                    tokio::time::sleep(retry_in).await;
                }
                other => return other.map_err(ScanError::from),
            }
        }
    }

    async fn db_call<T, F, Fut>(&self, op: F) -> Result<T, ScanError>
    where
        F: FnOnce(StakesDbObj) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let db = self.db.clone();
        Ok(self.db_breaker.execute(|| op(db)).await?)
    }
}
