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

//! Direct-stake attribution.
//!
//! A stake block pays its reward through the coinbase transaction. The address of that
//! transaction's first output is the crediting address. A stake is only credited to an identity
//! when the crediting address *is* the identity address. Stakes produced by a delegate address
//! acting for the identity credit the delegate and are never recorded for the identity.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{amount::AmountError, block::Block};

/// A credited proof-of-stake reward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StakeEvent {
    pub identity_address: String,
    pub block_height: u64,
    pub block_hash: String,
    pub block_time: u64,
    pub txid: String,
    pub vout_index: u32,
    pub amount_sats: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttributionError {
    #[error("Block {0} is not a stake block")]
    NotStakeBlock(u64),

    #[error("Block {0} has no reward transaction")]
    MissingRewardTransaction(u64),

    #[error("Reward transaction {0} has no outputs")]
    NoOutputs(String),

    #[error("Reward transaction {0} has no crediting address")]
    NoCreditingAddress(String),

    #[error("Reward transaction {txid} credits multiple addresses: {addresses:?}")]
    Ambiguous { txid: String, addresses: Vec<String> },

    #[error("Invalid reward amount in {txid}: {source}")]
    InvalidAmount {
        txid: String,
        #[source]
        source: AmountError,
    },
}

/// The crediting output of a stake block, before it is matched against any identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditingSource {
    pub address: String,
    pub txid: String,
    pub vout_index: u32,
    pub amount_sats: u64,
}

/// Determine which address a stake block credits and how much it pays.
pub fn crediting_source(block: &Block) -> Result<CreditingSource, AttributionError> {
    if !block.is_stake_block() {
        return Err(AttributionError::NotStakeBlock(block.height));
    }

    let reward_tx =
        block.reward_transaction().ok_or(AttributionError::MissingRewardTransaction(block.height))?;
    let first_output =
        reward_tx.vout.first().ok_or_else(|| AttributionError::NoOutputs(reward_tx.txid.clone()))?;

    let address = match first_output.script_pub_key.addresses.as_slice() {
        [] => return Err(AttributionError::NoCreditingAddress(reward_tx.txid.clone())),
        [address] => address.clone(),
        addresses => {
            return Err(AttributionError::Ambiguous {
                txid: reward_tx.txid.clone(),
                addresses: addresses.to_vec(),
            })
        }
    };

    let amount_sats = reward_tx
        .total_output_sats()
        .map_err(|source| AttributionError::InvalidAmount { txid: reward_tx.txid.clone(), source })?;

    Ok(CreditingSource {
        address,
        txid: reward_tx.txid.clone(),
        vout_index: first_output.n,
        amount_sats,
    })
}

/// Attribute a stake block to one of the given identity addresses.
///
/// Returns `Ok(None)` when the block credits an address outside `identities`, which includes
/// stakes made by a delegate on an identity's behalf.
pub fn attribute_block(
    block: &Block,
    identities: &HashSet<String>,
) -> Result<Option<StakeEvent>, AttributionError> {
    let source = crediting_source(block)?;

    if !identities.contains(&source.address) {
        tracing::trace!(
            "Block {} credits {} which is not a scanned identity",
            block.height,
            source.address
        );
        return Ok(None);
    }

    Ok(Some(StakeEvent {
        identity_address: source.address,
        block_height: block.height,
        block_hash: block.hash.clone(),
        block_time: block.time,
        txid: source.txid,
        vout_index: source.vout_index,
        amount_sats: source.amount_sats,
    }))
}
