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

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use url::Url;
use verus_stake_indexer::{
    config::{DaemonProfile, IndexerConfig},
    scanner::{RangeOptions, ScanConfig, ScanMode, ScanOrchestrator},
    StakeIndexerService,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Every block since each identity was created.
    Full,
    /// Blocks after each identity's last scanned height.
    Incremental,
    /// The most recent `--recent-blocks` blocks.
    Recent,
    /// Blocks between `--start-block` and `--end-block`.
    Range,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Preset {
    Conservative,
    Aggressive,
}

/// Arguments for the stake indexer.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct StakeIndexerArgs {
    /// Path to a TOML config file with scan, rate limit and circuit breaker settings.
    #[clap(short, long, env = "STAKE_INDEXER_CONFIG")]
    config: Option<PathBuf>,

    /// URL of the daemon JSON-RPC endpoint. Overrides the config file.
    #[clap(short, long, env)]
    rpc_url: Option<Url>,

    /// Daemon RPC user. Overrides the config file.
    #[clap(long, env)]
    rpc_user: Option<String>,

    /// Daemon RPC password. Overrides the config file.
    #[clap(long, env, hide_env_values = true)]
    rpc_password: Option<String>,

    /// Treat the daemon as a hosted endpoint and apply the stricter remote limits.
    #[clap(long, env, default_value_t = false)]
    remote_daemon: bool,

    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,

    /// Identity addresses to index, comma separated.
    #[clap(long, env, value_delimiter = ',', required = true)]
    identities: Vec<String>,

    /// Which blocks to scan.
    #[clap(long, value_enum, default_value_t = Mode::Incremental)]
    mode: Mode,

    /// Number of blocks back from the tip scanned in `recent` mode.
    #[clap(long, default_value = "1440")]
    recent_blocks: u64,

    /// First block scanned in `range` mode.
    #[clap(long, required_if_eq("mode", "range"))]
    start_block: Option<u64>,

    /// Last block scanned in `range` mode.
    #[clap(long, required_if_eq("mode", "range"))]
    end_block: Option<u64>,

    /// Scan tuning preset. Overrides the config file's scan section.
    #[clap(long, value_enum)]
    preset: Option<Preset>,

    /// Run a single scan and exit.
    #[clap(long, default_value_t = false)]
    once: bool,

    /// Interval in seconds between scans.
    #[clap(long, default_value = "600")]
    interval: u64,

    /// Number of retries before quitting after an error.
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

impl StakeIndexerArgs {
    fn indexer_config(&self) -> Result<IndexerConfig> {
        let mut config = match &self.config {
            Some(path) => IndexerConfig::load(path)?,
            None => IndexerConfig::default(),
        };
        if let Some(url) = &self.rpc_url {
            config.daemon.url = Some(url.clone());
        }
        if let Some(user) = &self.rpc_user {
            config.daemon.user = Some(user.clone());
        }
        if let Some(password) = &self.rpc_password {
            config.daemon.password = Some(password.clone());
        }
        if self.remote_daemon {
            config.daemon.profile = DaemonProfile::Remote;
        }
        match self.preset {
            Some(Preset::Conservative) => config.scan = ScanConfig::conservative(),
            Some(Preset::Aggressive) => config.scan = ScanConfig::aggressive(),
            None => {}
        }
        config.validate()?;
        Ok(config)
    }

    fn scan_mode(&self) -> Result<ScanMode> {
        Ok(match self.mode {
            Mode::Full => ScanMode::FullHistory,
            Mode::Incremental => ScanMode::Incremental,
            Mode::Recent => ScanMode::Recent { blocks: self.recent_blocks },
            Mode::Range => match (self.start_block, self.end_block) {
                (Some(start), Some(end)) => ScanMode::Range { start, end },
                _ => bail!("range mode needs --start-block and --end-block"),
            },
        })
    }
}

/// Run one scan, stopping it after the current chunk on Ctrl-C. The flag is set when interrupted.
async fn run_once(
    service: &mut StakeIndexerService,
    orchestrator: &ScanOrchestrator,
) -> (Result<()>, bool) {
    let run = service.run();
    tokio::pin!(run);
    let mut interrupted = false;
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping after the current chunk");
            interrupted = true;
            orchestrator.stop();
            run.await
        }
    };
    (result.map(|_| ()).map_err(Into::into), interrupted)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = StakeIndexerArgs::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    let config = args.indexer_config()?;
    let mode = args.scan_mode()?;
    let options = RangeOptions::new(args.identities.iter().cloned(), mode);

    let mut service = StakeIndexerService::new(&config, &args.db, options).await?;
    let orchestrator = service.orchestrator().clone();

    // An explicit range only needs to be scanned once
    if args.once || matches!(mode, ScanMode::Range { .. }) {
        tracing::info!("Running stake indexer once");
        let (result, _) = run_once(&mut service, &orchestrator).await;
        result?;
        tracing::info!("Stake indexer completed successfully");
        return Ok(());
    }

    let mut failures = 0u32;
    loop {
        let (result, interrupted) = run_once(&mut service, &orchestrator).await;
        if interrupted {
            return result;
        }
        match result {
            Ok(()) => {
                failures = 0;
                tracing::info!("Sleeping for {} seconds", args.interval);
            }
            Err(e) => {
                failures += 1;
                tracing::error!("Error running stake indexer: {:?}", e);
                if failures >= args.retries {
                    bail!("Maximum retries reached");
                }
                tracing::info!("Retrying in {} seconds", args.interval);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, exiting");
                return Ok(());
            }
        }
    }
}
