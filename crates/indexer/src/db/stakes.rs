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

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use verus_staking::StakeEvent;

use super::DbError;

pub type StakesDbObj = Arc<dyn StakeIndexerDb + Send + Sync>;

/// Maximum rows per multi-row insert. Keeps bind parameters under SQLite's limit.
const BATCH_INSERT_CHUNK_SIZE: usize = 75;

fn to_i64(column: &'static str, value: u64) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::OutOfRange { column, value: value.to_string() })
}

fn to_u64(column: &'static str, value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::OutOfRange { column, value: value.to_string() })
}

/// A height known to hold a proof-of-stake block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosBlock {
    pub height: u64,
    pub hash: String,
    pub time: u64,
}

/// A height whose last scan attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBlock {
    pub height: u64,
    pub attempts: u64,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub identity_address: String,
    /// Height of the identity's first on-chain appearance.
    pub first_seen_block: Option<u64>,
    /// Highest height up to which every block has been scanned for this identity.
    pub last_scanned_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityStakeStats {
    pub identity_address: String,
    pub total_stakes: u64,
    pub total_rewards_sats: u64,
    pub first_stake_height: Option<u64>,
    pub last_stake_height: Option<u64>,
    pub last_stake_time: Option<u64>,
}

impl IdentityStakeStats {
    pub fn from_events(identity_address: &str, events: &[StakeEvent]) -> Self {
        let latest = events.iter().max_by_key(|event| event.block_height);
        Self {
            identity_address: identity_address.to_string(),
            total_stakes: events.len() as u64,
            total_rewards_sats: events.iter().map(|event| event.amount_sats).sum(),
            first_stake_height: events.iter().map(|event| event.block_height).min(),
            last_stake_height: latest.map(|event| event.block_height),
            last_stake_time: latest.map(|event| event.block_time),
        }
    }
}

#[async_trait]
pub trait StakeIndexerDb {
    /// Insert or update stake events keyed by (identity, height, txid). Returns rows written.
    async fn upsert_stake_events(&self, events: Vec<StakeEvent>) -> Result<u64, DbError>;

    /// Stake events for an identity, newest first, with pagination.
    async fn get_stake_events_by_identity(
        &self,
        identity_address: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StakeEvent>, DbError>;

    /// Stake events for any identity with heights in `start..=end`, ordered by height.
    async fn get_stake_events_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<StakeEvent>, DbError>;

    async fn count_stake_events(&self) -> Result<u64, DbError>;

    async fn get_identity(&self, identity_address: &str)
        -> Result<Option<IdentityRecord>, DbError>;

    async fn set_identity_first_seen(
        &self,
        identity_address: &str,
        height: u64,
    ) -> Result<(), DbError>;

    async fn set_identity_last_scanned(
        &self,
        identity_address: &str,
        height: u64,
    ) -> Result<(), DbError>;

    async fn upsert_pos_blocks(&self, blocks: Vec<PosBlock>) -> Result<(), DbError>;

    async fn get_pos_blocks_in_range(&self, start: u64, end: u64)
        -> Result<Vec<PosBlock>, DbError>;

    /// Record inclusive height ranges whose classification is complete.
    async fn record_classified_ranges(&self, ranges: Vec<(u64, u64)>) -> Result<(), DbError>;

    /// Recorded ranges overlapping `start..=end`.
    async fn get_classified_ranges(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, u64)>, DbError>;

    /// Record scan failures, counting repeat failures of the same height.
    async fn record_failed_blocks(&self, failures: Vec<(u64, String)>) -> Result<(), DbError>;

    /// Forget heights that have since been scanned successfully.
    async fn clear_failed_blocks(&self, heights: Vec<u64>) -> Result<(), DbError>;

    /// Failed heights in `start..=end`, ordered by height.
    async fn get_failed_blocks_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<FailedBlock>, DbError>;

    async fn upsert_identity_stake_stats(&self, stats: &IdentityStakeStats) -> Result<(), DbError>;

    /// Recompute an identity's aggregate stats from its stake events and store them.
    async fn refresh_identity_stake_stats(
        &self,
        identity_address: &str,
    ) -> Result<IdentityStakeStats, DbError>;

    async fn get_identity_stake_stats(
        &self,
        identity_address: &str,
    ) -> Result<Option<IdentityStakeStats>, DbError>;
}

#[derive(Debug, Clone)]
pub struct StakesDb {
    pool: AnyPool,
}

impl StakesDb {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(20).connect(database_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn event_from_row(row: &sqlx::any::AnyRow) -> Result<StakeEvent, DbError> {
        Ok(StakeEvent {
            identity_address: row.get("identity_address"),
            block_height: to_u64("block_height", row.get::<i64, _>("block_height"))?,
            block_hash: row.get("block_hash"),
            block_time: to_u64("block_time", row.get::<i64, _>("block_time"))?,
            txid: row.get("txid"),
            vout_index: u32::try_from(row.get::<i64, _>("vout_index")).map_err(|e| {
                DbError::OutOfRange { column: "vout_index", value: e.to_string() }
            })?,
            amount_sats: to_u64("amount_sats", row.get::<i64, _>("amount_sats"))?,
        })
    }

    async fn all_stake_events_for(&self, identity_address: &str) -> Result<Vec<StakeEvent>, DbError> {
        let rows = sqlx::query(
            r#"SELECT identity_address, block_height, block_hash, block_time, txid, vout_index, amount_sats
            FROM stake_events
            WHERE identity_address = $1
            ORDER BY block_height ASC"#,
        )
        .bind(identity_address)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::event_from_row).collect()
    }
}

#[async_trait]
impl StakeIndexerDb for StakesDb {
    async fn upsert_stake_events(&self, events: Vec<StakeEvent>) -> Result<u64, DbError> {
        if events.is_empty() {
            return Ok(0);
        }

        // A single statement may not touch the same conflict key twice, last write wins.
        let mut unique: HashMap<(String, u64, String), StakeEvent> = HashMap::new();
        for event in events {
            unique.insert(
                (event.identity_address.clone(), event.block_height, event.txid.clone()),
                event,
            );
        }
        let mut events: Vec<StakeEvent> = unique.into_values().collect();
        events.sort_by(|a, b| {
            (a.block_height, &a.identity_address).cmp(&(b.block_height, &b.identity_address))
        });

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for chunk in events.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let mut values_clauses = Vec::with_capacity(chunk.len());
            let mut param_idx = 1;
            for _ in chunk {
                values_clauses.push(format!(
                    "(${},${},${},${},${},${},${},CURRENT_TIMESTAMP)",
                    param_idx,
                    param_idx + 1,
                    param_idx + 2,
                    param_idx + 3,
                    param_idx + 4,
                    param_idx + 5,
                    param_idx + 6
                ));
                param_idx += 7;
            }

            let query = format!(
                r#"INSERT INTO stake_events
                (identity_address, block_height, block_hash, block_time, txid, vout_index, amount_sats, updated_at)
                VALUES {}
                ON CONFLICT (identity_address, block_height, txid)
                DO UPDATE SET
                    block_hash = EXCLUDED.block_hash,
                    block_time = EXCLUDED.block_time,
                    vout_index = EXCLUDED.vout_index,
                    amount_sats = EXCLUDED.amount_sats,
                    updated_at = CURRENT_TIMESTAMP"#,
                values_clauses.join(",")
            );

            let mut q = sqlx::query(&query);
            for event in chunk {
                q = q
                    .bind(event.identity_address.clone())
                    .bind(to_i64("block_height", event.block_height)?)
                    .bind(event.block_hash.clone())
                    .bind(to_i64("block_time", event.block_time)?)
                    .bind(event.txid.clone())
                    .bind(event.vout_index as i64)
                    .bind(to_i64("amount_sats", event.amount_sats)?);
            }
            written += q.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn get_stake_events_by_identity(
        &self,
        identity_address: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StakeEvent>, DbError> {
        let rows = sqlx::query(
            r#"SELECT identity_address, block_height, block_hash, block_time, txid, vout_index, amount_sats
            FROM stake_events
            WHERE identity_address = $1
            ORDER BY block_height DESC
            LIMIT $2 OFFSET $3"#,
        )
        .bind(identity_address)
        .bind(to_i64("limit", limit)?)
        .bind(to_i64("offset", offset)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::event_from_row).collect()
    }

    async fn get_stake_events_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<StakeEvent>, DbError> {
        if start > end {
            return Err(DbError::BadRange { start, end });
        }
        let rows = sqlx::query(
            r#"SELECT identity_address, block_height, block_hash, block_time, txid, vout_index, amount_sats
            FROM stake_events
            WHERE block_height >= $1 AND block_height <= $2
            ORDER BY block_height ASC, identity_address ASC"#,
        )
        .bind(to_i64("block_height", start)?)
        .bind(to_i64("block_height", end)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::event_from_row).collect()
    }

    async fn count_stake_events(&self) -> Result<u64, DbError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM stake_events")
            .fetch_one(&self.pool)
            .await?;
        to_u64("count", row.get::<i64, _>("count"))
    }

    async fn get_identity(
        &self,
        identity_address: &str,
    ) -> Result<Option<IdentityRecord>, DbError> {
        let row = sqlx::query(
            "SELECT identity_address, first_seen_block, last_scanned_block FROM identities WHERE identity_address = $1",
        )
        .bind(identity_address)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let first_seen_block = row
            .get::<Option<i64>, _>("first_seen_block")
            .map(|height| to_u64("first_seen_block", height))
            .transpose()?;
        let last_scanned_block = row
            .get::<Option<i64>, _>("last_scanned_block")
            .map(|height| to_u64("last_scanned_block", height))
            .transpose()?;

        Ok(Some(IdentityRecord {
            identity_address: row.get("identity_address"),
            first_seen_block,
            last_scanned_block,
        }))
    }

    async fn set_identity_first_seen(
        &self,
        identity_address: &str,
        height: u64,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"INSERT INTO identities (identity_address, first_seen_block, updated_at)
            VALUES ($1, $2, CURRENT_TIMESTAMP)
            ON CONFLICT (identity_address)
            DO UPDATE SET first_seen_block = EXCLUDED.first_seen_block, updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(identity_address)
        .bind(to_i64("first_seen_block", height)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_identity_last_scanned(
        &self,
        identity_address: &str,
        height: u64,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"INSERT INTO identities (identity_address, last_scanned_block, updated_at)
            VALUES ($1, $2, CURRENT_TIMESTAMP)
            ON CONFLICT (identity_address)
            DO UPDATE SET last_scanned_block = EXCLUDED.last_scanned_block, updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(identity_address)
        .bind(to_i64("last_scanned_block", height)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_pos_blocks(&self, blocks: Vec<PosBlock>) -> Result<(), DbError> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut blocks = blocks;
        blocks.sort_by_key(|block| block.height);
        blocks.dedup_by_key(|block| block.height);

        let mut tx = self.pool.begin().await?;
        for chunk in blocks.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let values_clauses: Vec<String> = (0..chunk.len())
                .map(|i| format!("(${},${},${})", i * 3 + 1, i * 3 + 2, i * 3 + 3))
                .collect();
            let query = format!(
                r#"INSERT INTO pos_blocks (block_height, block_hash, block_time)
                VALUES {}
                ON CONFLICT (block_height)
                DO UPDATE SET block_hash = EXCLUDED.block_hash, block_time = EXCLUDED.block_time"#,
                values_clauses.join(",")
            );

            let mut q = sqlx::query(&query);
            for block in chunk {
                q = q
                    .bind(to_i64("block_height", block.height)?)
                    .bind(block.hash.clone())
                    .bind(to_i64("block_time", block.time)?);
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_pos_blocks_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<PosBlock>, DbError> {
        if start > end {
            return Err(DbError::BadRange { start, end });
        }
        let rows = sqlx::query(
            r#"SELECT block_height, block_hash, block_time FROM pos_blocks
            WHERE block_height >= $1 AND block_height <= $2
            ORDER BY block_height ASC"#,
        )
        .bind(to_i64("block_height", start)?)
        .bind(to_i64("block_height", end)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PosBlock {
                    height: to_u64("block_height", row.get::<i64, _>("block_height"))?,
                    hash: row.get("block_hash"),
                    time: to_u64("block_time", row.get::<i64, _>("block_time"))?,
                })
            })
            .collect()
    }

    async fn record_classified_ranges(&self, ranges: Vec<(u64, u64)>) -> Result<(), DbError> {
        if let Some(&(start, end)) = ranges.iter().find(|(start, end)| start > end) {
            return Err(DbError::BadRange { start, end });
        }
        if ranges.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in ranges.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let values_clauses: Vec<String> =
                (0..chunk.len()).map(|i| format!("(${},${})", i * 2 + 1, i * 2 + 2)).collect();
            let query = format!(
                r#"INSERT INTO classified_ranges (start_height, end_height)
                VALUES {}
                ON CONFLICT (start_height, end_height) DO NOTHING"#,
                values_clauses.join(",")
            );

            let mut q = sqlx::query(&query);
            for (start, end) in chunk {
                q = q.bind(to_i64("start_height", *start)?).bind(to_i64("end_height", *end)?);
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_classified_ranges(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, u64)>, DbError> {
        if start > end {
            return Err(DbError::BadRange { start, end });
        }
        let rows = sqlx::query(
            r#"SELECT start_height, end_height FROM classified_ranges
            WHERE start_height <= $1 AND end_height >= $2
            ORDER BY start_height ASC"#,
        )
        .bind(to_i64("end_height", end)?)
        .bind(to_i64("start_height", start)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    to_u64("start_height", row.get::<i64, _>("start_height"))?,
                    to_u64("end_height", row.get::<i64, _>("end_height"))?,
                ))
            })
            .collect()
    }

    async fn record_failed_blocks(&self, failures: Vec<(u64, String)>) -> Result<(), DbError> {
        if failures.is_empty() {
            return Ok(());
        }

        let mut unique: BTreeMap<u64, String> = BTreeMap::new();
        for (height, error) in failures {
            unique.insert(height, error);
        }
        let failures: Vec<(u64, String)> = unique.into_iter().collect();

        let mut tx = self.pool.begin().await?;
        for chunk in failures.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let values_clauses: Vec<String> = (0..chunk.len())
                .map(|i| format!("(${},1,${},CURRENT_TIMESTAMP)", i * 2 + 1, i * 2 + 2))
                .collect();
            let query = format!(
                r#"INSERT INTO failed_blocks (block_height, attempts, last_error, updated_at)
                VALUES {}
                ON CONFLICT (block_height)
                DO UPDATE SET
                    attempts = failed_blocks.attempts + 1,
                    last_error = EXCLUDED.last_error,
                    updated_at = CURRENT_TIMESTAMP"#,
                values_clauses.join(",")
            );

            let mut q = sqlx::query(&query);
            for (height, error) in chunk {
                q = q.bind(to_i64("block_height", *height)?).bind(error.clone());
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_failed_blocks(&self, heights: Vec<u64>) -> Result<(), DbError> {
        if heights.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in heights.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("${i}")).collect();
            let query = format!(
                "DELETE FROM failed_blocks WHERE block_height IN ({})",
                placeholders.join(",")
            );

            let mut q = sqlx::query(&query);
            for height in chunk {
                q = q.bind(to_i64("block_height", *height)?);
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_failed_blocks_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<FailedBlock>, DbError> {
        if start > end {
            return Err(DbError::BadRange { start, end });
        }
        let rows = sqlx::query(
            r#"SELECT block_height, attempts, last_error FROM failed_blocks
            WHERE block_height >= $1 AND block_height <= $2
            ORDER BY block_height ASC"#,
        )
        .bind(to_i64("block_height", start)?)
        .bind(to_i64("block_height", end)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(FailedBlock {
                    height: to_u64("block_height", row.get::<i64, _>("block_height"))?,
                    attempts: to_u64("attempts", row.get::<i64, _>("attempts"))?,
                    last_error: row.get("last_error"),
                })
            })
            .collect()
    }

    async fn refresh_identity_stake_stats(
        &self,
        identity_address: &str,
    ) -> Result<IdentityStakeStats, DbError> {
        // Summed in Rust; SUM over BIGINT decodes as NUMERIC on Postgres, which Any cannot read.
        let events = self.all_stake_events_for(identity_address).await?;
        let stats = IdentityStakeStats::from_events(identity_address, &events);
        self.upsert_identity_stake_stats(&stats).await?;
        Ok(stats)
    }

    async fn upsert_identity_stake_stats(&self, stats: &IdentityStakeStats) -> Result<(), DbError> {
        sqlx::query(
            r#"INSERT INTO identity_stake_stats
            (identity_address, total_stakes, total_rewards_sats, first_stake_height, last_stake_height, last_stake_time, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, CURRENT_TIMESTAMP)
            ON CONFLICT (identity_address)
            DO UPDATE SET
                total_stakes = EXCLUDED.total_stakes,
                total_rewards_sats = EXCLUDED.total_rewards_sats,
                first_stake_height = EXCLUDED.first_stake_height,
                last_stake_height = EXCLUDED.last_stake_height,
                last_stake_time = EXCLUDED.last_stake_time,
                updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(stats.identity_address.clone())
        .bind(to_i64("total_stakes", stats.total_stakes)?)
        .bind(to_i64("total_rewards_sats", stats.total_rewards_sats)?)
        .bind(to_i64("first_stake_height", stats.first_stake_height.unwrap_or(0))?)
        .bind(to_i64("last_stake_height", stats.last_stake_height.unwrap_or(0))?)
        .bind(to_i64("last_stake_time", stats.last_stake_time.unwrap_or(0))?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_identity_stake_stats(
        &self,
        identity_address: &str,
    ) -> Result<Option<IdentityStakeStats>, DbError> {
        let row = sqlx::query(
            r#"SELECT identity_address, total_stakes, total_rewards_sats, first_stake_height, last_stake_height, last_stake_time
            FROM identity_stake_stats
            WHERE identity_address = $1"#,
        )
        .bind(identity_address)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let total_stakes = to_u64("total_stakes", row.get::<i64, _>("total_stakes"))?;
        let optional = |column: &'static str| -> Result<Option<u64>, DbError> {
            if total_stakes == 0 {
                return Ok(None);
            }
            to_u64(column, row.get::<i64, _>(column)).map(Some)
        };

        Ok(Some(IdentityStakeStats {
            identity_address: row.get("identity_address"),
            total_stakes,
            total_rewards_sats: to_u64(
                "total_rewards_sats",
                row.get::<i64, _>("total_rewards_sats"),
            )?,
            first_stake_height: optional("first_stake_height")?,
            last_stake_height: optional("last_stake_height")?,
            last_stake_time: optional("last_stake_time")?,
        }))
    }
}
