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

//! Typed views of the daemon responses used by the indexer.
//!
//! Only the fields the indexer reads are modelled; everything else in the daemon's JSON is
//! ignored by serde.

use serde::{Deserialize, Serialize};

use crate::amount::{coins_to_sats, AmountError};

/// Result of `getblockchaininfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    /// Height of the current tip.
    pub blocks: u64,
    #[serde(default)]
    pub headers: u64,
    pub bestblockhash: String,
}

/// How a block was validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    Stake,
    Work,
    #[serde(other)]
    Unknown,
}

/// Result of `getblock <hash> 1`: block metadata with transaction ids only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub hash: String,
    pub height: u64,
    pub time: u64,
    pub validationtype: ValidationType,
    #[serde(default)]
    pub tx: Vec<String>,
}

impl BlockSummary {
    pub fn is_stake_block(&self) -> bool {
        self.validationtype == ValidationType::Stake
    }
}

/// Result of `getblock <hash> 2`: block metadata with decoded transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    pub time: u64,
    pub validationtype: ValidationType,
    #[serde(default)]
    pub tx: Vec<Transaction>,
}

impl Block {
    pub fn is_stake_block(&self) -> bool {
        self.validationtype == ValidationType::Stake
    }

    /// The transaction paying the block reward: the one whose first input is a coinbase input.
    pub fn reward_transaction(&self) -> Option<&Transaction> {
        self.tx.iter().find(|tx| tx.is_coinbase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxIn>,
    #[serde(default)]
    pub vout: Vec<TxOut>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.first().is_some_and(|input| input.coinbase.is_some())
    }

    /// Sum of all output values in satoshis.
    pub fn total_output_sats(&self) -> Result<u64, AmountError> {
        let mut total = 0u64;
        for output in &self.vout {
            let sats = output.amount_sats()?;
            total = total.checked_add(sats).ok_or(AmountError::OutOfRange(output.value))?;
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: f64,
    /// Exact satoshi value, reported by newer daemons alongside the float value.
    #[serde(rename = "valueSat", default, skip_serializing_if = "Option::is_none")]
    pub value_sat: Option<i64>,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

impl TxOut {
    pub fn amount_sats(&self) -> Result<u64, AmountError> {
        match self.value_sat {
            Some(sats) if sats >= 0 => Ok(sats as u64),
            Some(_) => Err(AmountError::Negative(self.value)),
            None => coins_to_sats(self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub script_type: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Result of `getidentityhistory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHistory {
    #[serde(default)]
    pub history: Vec<IdentityHistoryEntry>,
}

impl IdentityHistory {
    /// Height at which the identity first appears on chain.
    pub fn creation_height(&self) -> Option<u64> {
        self.history.iter().map(|entry| entry.height).min()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHistoryEntry {
    pub height: u64,
    #[serde(default)]
    pub blockhash: String,
}
