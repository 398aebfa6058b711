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

use std::{sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use verus_staking::{Block, BlockSummary, BlockchainInfo, IdentityHistory};

use super::transport::{RpcTransport, TransportError};
use crate::{
    circuit_breaker::{CircuitBreaker, CircuitError},
    rate_limiter::{RateLimiter, GLOBAL_KEY},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Daemon unavailable: circuit '{name}' is open, retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },
}

impl RpcError {
    pub fn circuit_open_retry_in(&self) -> Option<Duration> {
        match self {
            RpcError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            RpcError::Transport(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(500), backoff_multiplier: 2.0 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(self.backoff_multiplier.powi(attempt as i32))
    }
}

/// Typed daemon calls. Every call is admitted by the rate limiter, then run through the daemon
/// circuit breaker, then retried on transient transport failures.
#[derive(Clone)]
pub struct DaemonClient {
    transport: Arc<dyn RpcTransport>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl DaemonClient {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        rate_limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self { transport, rate_limiter, breaker, retry }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut attempt = 0;
        loop {
            self.rate_limiter.acquire(GLOBAL_KEY).await;

            let transport = self.transport.clone();
            let call_params = params.clone();
            let outcome = self
                .breaker
                .execute(|| async move {
                    // Daemon-side errors prove the daemon is up; keep them out of the breaker.
                    match transport.call(method, call_params).await {
                        Err(err) if err.is_daemon_response() => Ok(Err(err)),
                        Err(err) => Err(err),
                        Ok(value) => Ok(Ok(value)),
                    }
                })
                .await;

            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => return Err(err.into()),
                Err(CircuitError::Open { name, retry_in }) => {
                    return Err(RpcError::CircuitOpen { name, retry_in })
                }
                Err(CircuitError::Inner(err)) => {
                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        return Err(err.into());
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "RPC {method} failed (attempt {}/{}): {err}, retrying in {:?}",
                        attempt + 1,
                        self.retry.max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| TransportError::parse(method, e).into())
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call_typed("getblockchaininfo", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call_typed("getblockhash", json!([height])).await
    }

    /// Block header fields, validation type and transaction ids.
    pub async fn get_block_summary(&self, hash: &str) -> Result<BlockSummary, RpcError> {
        self.call_typed("getblock", json!([hash, 1])).await
    }

    /// Block with fully decoded transactions.
    pub async fn get_block(&self, hash: &str) -> Result<Block, RpcError> {
        self.call_typed("getblock", json!([hash, 2])).await
    }

    pub async fn get_identity_history(
        &self,
        identity: &str,
        tip: u64,
    ) -> Result<IdentityHistory, RpcError> {
        self.call_typed("getidentityhistory", json!([identity, 0, tip])).await
    }
}
