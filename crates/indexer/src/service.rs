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

use std::sync::Arc;

use anyhow::Context;
use tokio::time::Instant;

use crate::{
    config::IndexerConfig,
    db::{IdentityStakeStats, StakesDb, StakesDbObj},
    rpc::{HttpTransport, RpcTransport},
    scanner::{RangeOptions, ScanConfig, ScanMode, ScanOrchestrator, ScanProgress, ScanStatus},
    ServiceError,
};

/// Scans a fixed set of identities, one scan per [StakeIndexerService::run].
pub struct StakeIndexerService {
    db: StakesDbObj,
    orchestrator: ScanOrchestrator,
    scan: ScanConfig,
    options: RangeOptions,
}

impl StakeIndexerService {
    pub async fn new(
        config: &IndexerConfig,
        db_conn: &str,
        options: RangeOptions,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let daemon = &config.daemon;
        let url = daemon.url.clone().context("daemon url is not configured")?;
        let transport = HttpTransport::new(
            url,
            daemon.user.clone().unwrap_or_default(),
            daemon.password.clone().unwrap_or_default(),
            daemon.timeout(),
        )?;
        tracing::info!("Using {:?} daemon at {}", daemon.profile, transport.url());

        let db: StakesDbObj = Arc::new(StakesDb::new(db_conn).await?);
        Self::with_transport(db, Arc::new(transport), config, options)
    }

    pub fn with_transport(
        db: StakesDbObj,
        transport: Arc<dyn RpcTransport>,
        config: &IndexerConfig,
        options: RangeOptions,
    ) -> Result<Self, ServiceError> {
        config
            .scan
            .validate()
            .and_then(|_| options.validate())
            .map_err(crate::scanner::ScanError::InvalidRequest)?;
        let orchestrator = ScanOrchestrator::new(db.clone(), transport, config.orchestrator());
        Ok(Self { db, orchestrator, scan: config.scan.clone(), options })
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn mode(&self) -> ScanMode {
        self.options.mode
    }

    /// Run one scan in the foreground.
    ///
    /// After a successful full-history scan the service switches to incremental catch-up, so
    /// repeated runs only walk blocks added since.
    pub async fn run(&mut self) -> Result<ScanProgress, ServiceError> {
        let start_time = Instant::now();
        let progress = self.orchestrator.run(self.scan.clone(), self.options.clone()).await?;

        match progress.status {
            ScanStatus::Complete => {
                if self.options.mode == ScanMode::FullHistory {
                    self.options.mode = ScanMode::Incremental;
                }
            }
            ScanStatus::Stopped => {
                tracing::info!("Scan stopped before completion");
            }
            status => {
                return Err(ServiceError::ScanFailed {
                    status,
                    message: progress.error.clone().unwrap_or_default(),
                });
            }
        }

        for identity in &self.options.identities {
            if let Some(stats) = self.db.get_identity_stake_stats(identity).await? {
                tracing::info!(
                    "{identity}: {} direct stakes, {} sats, last at height {:?}",
                    stats.total_stakes,
                    stats.total_rewards_sats,
                    stats.last_stake_height
                );
            }
        }
        tracing::info!(
            "Stake indexer run finished in {:.2}s ({} blocks, {} stake events)",
            start_time.elapsed().as_secs_f64(),
            progress.blocks_processed,
            progress.stake_events_found
        );
        Ok(progress)
    }

    pub async fn identity_stats(
        &self,
        identity: &str,
    ) -> Result<Option<IdentityStakeStats>, ServiceError> {
        Ok(self.db.get_identity_stake_stats(identity).await?)
    }
}
