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

//! File-backed indexer configuration.
//!
//! Every section and field has a default, so a config file only needs the values it overrides:
//!
//! ```toml
//! [daemon]
//! url = "http://127.0.0.1:27486"
//! user = "verusrpc"
//! password = "secret"
//!
//! [scan]
//! max_concurrent_requests = 8
//!
//! [rate_limit]
//! per_second = 4
//! ```
//!
//! A daemon reached through a hosted or shared endpoint should set `profile = "remote"`. The rate
//! limit and daemon circuit breaker then default to the stricter external API presets.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    circuit_breaker::CircuitBreakerConfig, rate_limiter::RateLimitConfig, scanner::ScanConfig,
    scanner::OrchestratorConfig,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing daemon setting: {0}")]
    MissingDaemonSetting(&'static str),

    #[error("Invalid {section} configuration: {message}")]
    Invalid { section: &'static str, message: String },
}

/// Where the daemon runs, which decides the default limits applied to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonProfile {
    /// A daemon dedicated to this indexer.
    #[default]
    Local,
    /// A hosted or shared RPC endpoint.
    Remote,
}

impl DaemonProfile {
    pub fn rate_limit(self) -> RateLimitConfig {
        match self {
            DaemonProfile::Local => RateLimitConfig::daemon(),
            DaemonProfile::Remote => RateLimitConfig::external_api(),
        }
    }

    pub fn circuit_breaker(self) -> CircuitBreakerConfig {
        match self {
            DaemonProfile::Local => CircuitBreakerConfig::daemon(),
            DaemonProfile::Remote => CircuitBreakerConfig::external_api(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub url: Option<Url>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub profile: DaemonProfile,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            timeout_secs: 15,
            profile: DaemonProfile::default(),
        }
    }
}

impl DaemonConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    /// Defaults to the daemon profile's preset.
    #[serde(default)]
    pub daemon: Option<CircuitBreakerConfig>,
    #[serde(default = "CircuitBreakerConfig::database")]
    pub database: CircuitBreakerConfig,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self { daemon: None, database: CircuitBreakerConfig::database() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub daemon: DaemonConfig,
    pub scan: ScanConfig,
    /// Defaults to the daemon profile's preset. Fields missing from a partial section take the
    /// local daemon values.
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: CircuitBreakerSection,
    pub block_cache_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            scan: ScanConfig::default(),
            rate_limit: None,
            circuit_breaker: CircuitBreakerSection::default(),
            block_cache_capacity: 1_000,
        }
    }
}

impl IndexerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path: display, source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.url.is_none() {
            return Err(ConfigError::MissingDaemonSetting("url"));
        }
        if self.daemon.user.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingDaemonSetting("user"));
        }
        if self.daemon.password.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingDaemonSetting("password"));
        }
        if self.daemon.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                section: "daemon",
                message: "timeout_secs must be at least 1".into(),
            });
        }
        self.scan.validate().map_err(|message| ConfigError::Invalid { section: "scan", message })?;
        self.rate_limit()
            .validate()
            .map_err(|message| ConfigError::Invalid { section: "rate_limit", message })?;
        self.daemon_breaker()
            .validate()
            .and(self.circuit_breaker.database.validate())
            .map_err(|message| ConfigError::Invalid { section: "circuit_breaker", message })?;
        Ok(())
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit.unwrap_or_else(|| self.daemon.profile.rate_limit())
    }

    pub fn daemon_breaker(&self) -> CircuitBreakerConfig {
        self.circuit_breaker.daemon.unwrap_or_else(|| self.daemon.profile.circuit_breaker())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            rate_limit: self.rate_limit(),
            daemon_breaker: self.daemon_breaker(),
            database_breaker: self.circuit_breaker.database,
            block_cache_capacity: self.block_cache_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn complete() -> IndexerConfig {
        IndexerConfig {
            daemon: DaemonConfig {
                url: Some(Url::parse("http://127.0.0.1:27486").unwrap()),
                user: Some("verusrpc".into()),
                password: Some("secret".into()),
                ..DaemonConfig::default()
            },
            ..IndexerConfig::default()
        }
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
block_cache_capacity = 50

[daemon]
url = "http://127.0.0.1:27486"
user = "verusrpc"
password = "secret"

[scan]
max_concurrent_requests = 8

[rate_limit]
per_second = 4

[circuit_breaker.daemon]
failure_threshold = 10
recovery_timeout_secs = 5
monitoring_period_secs = 60
success_threshold = 1
"#
        )
        .unwrap();

        let config = IndexerConfig::load(file.path()).unwrap();
        assert_eq!(config.block_cache_capacity, 50);
        assert_eq!(config.daemon.timeout(), Duration::from_secs(15));
        assert_eq!(config.scan.max_concurrent_requests, 8);
        assert_eq!(config.scan.block_batch_size, ScanConfig::conservative().block_batch_size);
        assert_eq!(config.rate_limit().per_second, 4);
        assert_eq!(config.rate_limit().per_minute, RateLimitConfig::daemon().per_minute);
        assert_eq!(config.daemon_breaker().failure_threshold, 10);
        assert_eq!(config.circuit_breaker.database, CircuitBreakerConfig::database());
        config.validate().unwrap();
    }

    #[test]
    fn test_remote_profile_selects_external_api_presets() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[daemon]
url = "https://rpc.example.org"
user = "verusrpc"
password = "secret"
profile = "remote"
"#
        )
        .unwrap();

        let config = IndexerConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.daemon.profile, DaemonProfile::Remote);

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.rate_limit, RateLimitConfig::external_api());
        assert_eq!(orchestrator.daemon_breaker, CircuitBreakerConfig::external_api());
        assert_eq!(orchestrator.database_breaker, CircuitBreakerConfig::database());

        // Explicit sections win over the profile
        let config = IndexerConfig {
            rate_limit: Some(RateLimitConfig::daemon()),
            ..config
        };
        assert_eq!(config.orchestrator().rate_limit, RateLimitConfig::daemon());
        assert_eq!(complete().orchestrator().daemon_breaker, CircuitBreakerConfig::daemon());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = IndexerConfig {
            daemon: DaemonConfig { password: None, ..complete().daemon },
            ..complete()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingDaemonSetting("password"))));
        assert!(matches!(
            IndexerConfig::default().validate(),
            Err(ConfigError::MissingDaemonSetting("url"))
        ));
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut config = complete();
        config.scan.address_batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { section: "scan", .. })));

        let mut config = complete();
        config.rate_limit = Some(RateLimitConfig { burst: 0, ..RateLimitConfig::daemon() });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { section: "rate_limit", .. })
        ));
    }

    #[test]
    fn test_unreadable_file() {
        let err = IndexerConfig::load("/nonexistent/stake-indexer.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
