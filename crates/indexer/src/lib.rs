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

//! Indexes Verus proof-of-stake rewards credited directly to identities.

pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod db;
pub mod rate_limiter;
pub mod rpc;
pub mod scanner;
pub mod service;
pub mod test_utils;

use thiserror::Error;

pub use service::StakeIndexerService;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("RPC error: {0}")]
    Rpc(#[from] rpc::RpcError),

    #[error("Transport error: {0}")]
    Transport(#[from] rpc::TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Scan error: {0}")]
    Scan(#[from] scanner::ScanError),

    #[error("Scan ended with status {status}: {message}")]
    ScanFailed { status: scanner::ScanStatus, message: String },

    #[error("Error: {0}")]
    Error(#[from] anyhow::Error),
}
