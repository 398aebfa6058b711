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
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("RPC call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("HTTP error calling {method}: {message}")]
    Http { method: String, status: Option<u16>, message: String },

    #[error("RPC error {code} from {method}: {message}")]
    Rpc { method: String, code: i64, message: String },

    #[error("Daemon rejected credentials for {method} (HTTP {status})")]
    Unauthorized { method: String, status: u16 },

    #[error("Failed to parse {method} response: {message}")]
    Parse { method: String, message: String },
}

impl TransportError {
    /// Whether the call may succeed if repeated unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout { .. } | TransportError::Http { .. })
    }

    /// Errors returned by the daemon itself. The daemon was reachable, so these do not count
    /// against its health.
    pub fn is_daemon_response(&self) -> bool {
        matches!(self, TransportError::Rpc { .. } | TransportError::Unauthorized { .. })
    }

    pub fn parse(method: &str, err: impl std::fmt::Display) -> Self {
        TransportError::Parse { method: method.to_string(), message: err.to_string() }
    }
}

/// A JSON-RPC endpoint. Implemented over HTTP for the daemon, and in memory for tests.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC 1.0 over HTTP with basic auth, as spoken by the daemon.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    url: Url,
    user: String,
    password: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(
        url: Url,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            TransportError::Http { method: "connect".into(), status: None, message: e.to_string() }
        })?;
        Ok(Self {
            client,
            url,
            user: user.into(),
            password: password.into(),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest { jsonrpc: "1.0", id, method, params: &params };
        tracing::trace!("RPC {method} id={id} params={params}");

        let response = self
            .client
            .post(self.url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.send_error(method, e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.send_error(method, e))?;

        // The daemon reports RPC errors with a non-2xx status and a JSON body, so the body is
        // inspected before the status.
        match serde_json::from_str::<RpcResponse>(&body) {
            Ok(RpcResponse { error: Some(error), .. }) => Err(TransportError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Ok(RpcResponse { result, .. }) if status.is_success() => {
                Ok(result.unwrap_or(Value::Null))
            }
            Err(e) if status.is_success() => Err(TransportError::parse(method, e)),
            _ if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(TransportError::Unauthorized {
                    method: method.to_string(),
                    status: status.as_u16(),
                })
            }
            _ => Err(TransportError::Http {
                method: method.to_string(),
                status: Some(status.as_u16()),
                message: format!("status {status}: {}", body.chars().take(200).collect::<String>()),
            }),
        }
    }
}

impl HttpTransport {
    fn send_error(&self, method: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout { method: method.to_string(), timeout: self.timeout }
        } else {
            TransportError::Http {
                method: method.to_string(),
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}
