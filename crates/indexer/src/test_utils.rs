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

//! Helpers for exercising the indexer without a live daemon or database server.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use verus_staking::{
    Block, BlockSummary, ScriptPubKey, Transaction, TxIn, TxOut, ValidationType, SATS_PER_COIN,
};

use crate::{
    db::{DbError, StakesDb},
    rpc::{RpcTransport, TransportError},
};

/// A migrated SQLite database in a temporary file, removed on drop.
pub struct TestDb {
    pub db: Arc<StakesDb>,
    pub db_url: String,
    _temp_file: NamedTempFile,
}

impl TestDb {
    pub async fn new() -> Result<Self, DbError> {
        let temp_file = NamedTempFile::new().map_err(|e| DbError::SqlErr(sqlx::Error::Io(e)))?;
        let db_url = format!("sqlite:{}", temp_file.path().display());
        let db = Arc::new(StakesDb::new(&db_url).await?);
        Ok(Self { db, db_url, _temp_file: temp_file })
    }
}

pub fn block_hash(height: u64) -> String {
    format!("{height:064x}")
}

fn reward_output(address: &str, sats: u64) -> TxOut {
    TxOut {
        value: sats as f64 / SATS_PER_COIN as f64,
        value_sat: Some(sats as i64),
        n: 0,
        script_pub_key: ScriptPubKey {
            script_type: Some("pubkeyhash".into()),
            addresses: vec![address.to_string()],
        },
    }
}

/// A block whose coinbase pays `sats` to `address` in its first output.
pub fn reward_block(
    height: u64,
    validationtype: ValidationType,
    address: &str,
    sats: u64,
) -> Block {
    let coinbase = Transaction {
        txid: format!("{:064x}", height.wrapping_mul(31).wrapping_add(7)),
        vin: vec![TxIn { coinbase: Some(format!("03{height:06x}")), txid: None, vout: None }],
        vout: vec![reward_output(address, sats)],
    };
    let transfer = Transaction {
        txid: format!("{:064x}", height.wrapping_mul(31).wrapping_add(8)),
        vin: vec![TxIn { coinbase: None, txid: Some(block_hash(height)), vout: Some(1) }],
        vout: vec![reward_output("RTransferRecipient", 1_000)],
    };
    Block {
        hash: block_hash(height),
        height,
        time: 1_700_000_000 + height * 60,
        validationtype,
        tx: vec![coinbase, transfer],
    }
}

#[derive(Default)]
struct DaemonState {
    blocks: BTreeMap<u64, Block>,
    identities: HashMap<String, Vec<u64>>,
    tip: Option<u64>,
    failing_heights: HashSet<u64>,
    unavailable: bool,
    latency: Duration,
    calls: HashMap<String, u64>,
    detail_calls: u64,
}

/// In-memory daemon answering the JSON-RPC methods the indexer uses.
///
/// Unknown heights and hashes produce the daemon's own error codes. A failing height answers
/// `getblockhash` with an RPC error; an unavailable daemon answers everything with HTTP 503.
#[derive(Default)]
pub struct MockDaemon {
    state: Mutex<DaemonState>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Proof-of-work blocks at every height in `heights` not already populated.
    pub fn with_work_blocks(self, heights: impl IntoIterator<Item = u64>) -> Self {
        {
            let mut state = self.state();
            for height in heights {
                state.blocks.entry(height).or_insert_with(|| {
                    reward_block(height, ValidationType::Work, "RMinerPayoutAddress", 300_000_000)
                });
            }
        }
        self
    }

    pub fn with_stake_block(self, height: u64, address: &str, sats: u64) -> Self {
        self.with_block(reward_block(height, ValidationType::Stake, address, sats))
    }

    pub fn with_block(self, block: Block) -> Self {
        self.state().blocks.insert(block.height, block);
        self
    }

    pub fn with_identity(self, address: &str, creation_height: u64) -> Self {
        self.state().identities.insert(address.to_string(), vec![creation_height]);
        self
    }

    /// Override the reported tip. Defaults to the highest populated height.
    pub fn set_tip(&self, tip: u64) {
        self.state().tip = Some(tip);
    }

    pub fn set_height_failing(&self, height: u64, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_heights.insert(height);
        } else {
            state.failing_heights.remove(&height);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn calls(&self, method: &str) -> u64 {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    /// `getblock` calls asking for decoded transactions.
    pub fn detail_calls(&self) -> u64 {
        self.state().detail_calls
    }

    fn respond(&self, method: &str, params: &Value) -> Result<Value, TransportError> {
        let mut state = self.state();
        *state.calls.entry(method.to_string()).or_default() += 1;

        if state.unavailable {
            return Err(TransportError::Http {
                method: method.to_string(),
                status: Some(503),
                message: "Service Unavailable".into(),
            });
        }
        let tip = state.tip.or_else(|| state.blocks.keys().next_back().copied()).unwrap_or(0);
        let rpc_error = |code: i64, message: &str| TransportError::Rpc {
            method: method.to_string(),
            code,
            message: message.to_string(),
        };

        match method {
            "getblockchaininfo" => Ok(json!({
                "chain": "VRSCTEST",
                "blocks": tip,
                "headers": tip,
                "bestblockhash": block_hash(tip),
            })),
            "getblockhash" => {
                let height = params[0].as_u64().ok_or_else(|| rpc_error(-1, "invalid height"))?;
                if state.failing_heights.contains(&height) {
                    return Err(rpc_error(-1, "forced failure"));
                }
                if height > tip || !state.blocks.contains_key(&height) {
                    return Err(rpc_error(-8, "Block height out of range"));
                }
                Ok(json!(block_hash(height)))
            }
            "getblock" => {
                let hash = params[0].as_str().unwrap_or_default();
                let verbosity = params[1].as_u64().unwrap_or(1);
                let block = state
                    .blocks
                    .values()
                    .find(|block| block.hash == hash)
                    .cloned()
                    .ok_or_else(|| rpc_error(-5, "Block not found"))?;
                if verbosity >= 2 {
                    state.detail_calls += 1;
                    return serde_json::to_value(&block)
                        .map_err(|e| TransportError::parse(method, e));
                }
                let summary = BlockSummary {
                    hash: block.hash,
                    height: block.height,
                    time: block.time,
                    validationtype: block.validationtype,
                    tx: block.tx.into_iter().map(|tx| tx.txid).collect(),
                };
                serde_json::to_value(&summary).map_err(|e| TransportError::parse(method, e))
            }
            "getidentityhistory" => {
                let identity = params[0].as_str().unwrap_or_default();
                let heights = state
                    .identities
                    .get(identity)
                    .ok_or_else(|| rpc_error(-5, "Identity not found"))?;
                let history: Vec<Value> = heights
                    .iter()
                    .map(|&height| json!({ "height": height, "blockhash": block_hash(height) }))
                    .collect();
                Ok(json!({ "history": history }))
            }
            _ => Err(rpc_error(-32601, "Method not found")),
        }
    }
}

#[async_trait]
impl RpcTransport for MockDaemon {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.respond(method, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verus_staking::{attribute_block, BlockchainInfo, IdentityHistory};

    #[tokio::test]
    async fn test_mock_daemon_serves_typed_results() {
        let daemon = MockDaemon::new()
            .with_work_blocks(1..=5)
            .with_stake_block(3, "iStaker", 1_200_000_000)
            .with_identity("iStaker", 2);

        let info: BlockchainInfo =
            serde_json::from_value(daemon.call("getblockchaininfo", json!([])).await.unwrap())
                .unwrap();
        assert_eq!(info.blocks, 5);

        let hash = daemon.call("getblockhash", json!([3])).await.unwrap();
        let summary: BlockSummary =
            serde_json::from_value(daemon.call("getblock", json!([hash, 1])).await.unwrap())
                .unwrap();
        assert!(summary.is_stake_block());

        let block: Block =
            serde_json::from_value(daemon.call("getblock", json!([hash, 2])).await.unwrap())
                .unwrap();
        let identities = HashSet::from(["iStaker".to_string()]);
        let event = attribute_block(&block, &identities).unwrap().unwrap();
        assert_eq!(event.amount_sats, 1_200_000_000);
        assert_eq!(daemon.detail_calls(), 1);

        let history: IdentityHistory = serde_json::from_value(
            daemon.call("getidentityhistory", json!(["iStaker", 0, 5])).await.unwrap(),
        )
        .unwrap();
        assert_eq!(history.creation_height(), Some(2));
    }

    #[tokio::test]
    async fn test_mock_daemon_errors() {
        let daemon = MockDaemon::new().with_work_blocks(1..=3);
        daemon.set_height_failing(2, true);

        let err = daemon.call("getblockhash", json!([9])).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -8, .. }));
        assert!(daemon.call("getblockhash", json!([2])).await.is_err());

        daemon.set_unavailable(true);
        let err = daemon.call("getblockhash", json!([1])).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(daemon.calls("getblockhash"), 3);
    }
}
