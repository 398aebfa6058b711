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

//! Block model and stake attribution utilities for Verus proof-of-stake rewards.

pub mod amount;
pub mod attribution;
pub mod block;

pub use amount::{coins_to_sats, AmountError, SATS_PER_COIN};

pub use attribution::{
    attribute_block, crediting_source, AttributionError, CreditingSource, StakeEvent,
};

pub use block::{
    Block, BlockSummary, BlockchainInfo, IdentityHistory, IdentityHistoryEntry, ScriptPubKey,
    Transaction, TxIn, TxOut, ValidationType,
};
