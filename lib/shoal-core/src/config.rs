//! Pool configuration: listen address, routing policy, backend list, and
//! failure-handling knobs. Parsed from TOML via `serdeconv`, the same way
//! the logging configuration is, then validated before any socket opens.

use serde_derive::Deserialize;
use shoal_support::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub name: Option<String>,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub listen: String,
    #[serde(default = "default_hash")]
    pub hash: String,
    #[serde(default = "default_distribution")]
    pub distribution: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_failure_limit")]
    pub server_failure_limit: u32,
    #[serde(default = "default_retry_timeout_ms")]
    pub server_retry_timeout_ms: u64,
    #[serde(default = "default_server_connections")]
    pub server_connections: u32,
    #[serde(default)]
    pub auto_eject_hosts: bool,
    #[serde(default)]
    pub preconnect: bool,
    pub servers: Vec<ServerSpec>,
}

fn default_hash() -> String {
    "fnv1a_32".to_owned()
}
fn default_distribution() -> String {
    "ketama".to_owned()
}
fn default_timeout_ms() -> u64 {
    400
}
fn default_failure_limit() -> u32 {
    2
}
fn default_retry_timeout_ms() -> u64 {
    30_000
}
fn default_server_connections() -> u32 {
    1
}

impl PoolConfig {
    pub fn from_toml_str(text: &str) -> Result<PoolConfig, ConfigError> {
        let config: PoolConfig =
            serdeconv::from_toml_str(text).map_err(|e| ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError("pool must list at least one server".to_owned()));
        }
        for server in &self.servers {
            if server.weight == 0 {
                return Err(ConfigError(format!(
                    "server {} has zero weight",
                    server.address
                )));
            }
            server
                .address
                .parse::<std::net::SocketAddr>()
                .map_err(|_| ConfigError(format!("invalid server address: {}", server.address)))?;
        }
        if shoal_support::hash::HashFn::from_name(&self.hash).is_none() {
            return Err(ConfigError(format!("unknown hash function: {}", self.hash)));
        }
        if crate::ring::Distribution::from_name(&self.distribution).is_none() {
            return Err(ConfigError(format!(
                "unknown distribution: {}",
                self.distribution
            )));
        }
        if self.server_connections == 0 {
            return Err(ConfigError("server_connections must be at least 1".to_owned()));
        }
        Ok(())
    }
}
