use std::env;
use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    // JSON-RPC endpoint of the chain the voting contract lives on.
    pub rpc_url: String,
    pub contract_address: String,
    pub database_url: String,
    pub port: u16,
    pub reconcile_interval_secs: u64,
    // Creation events with fewer than 2 or more than this many options are
    // treated as malformed and dropped.
    pub max_poll_options: usize,
    pub gap_retry_limit: u32,
    // Contract deployment height; backfill never looks below it.
    pub start_block: u64,
    // Max blocks per historical eth_getLogs window.
    pub log_chunk_size: u64,
    pub subscribe_poll_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            rpc_url: require("RPC_URL")?,
            contract_address: require("CONTRACT_ADDRESS")?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:democrazy.db".to_string()),
            port: parse_or("PORT", 5000)?,
            reconcile_interval_secs: parse_or("RECONCILE_INTERVAL_SECS", 5)?,
            max_poll_options: parse_or("MAX_POLL_OPTIONS", 5)?,
            gap_retry_limit: parse_or("GAP_RETRY_LIMIT", 5)?,
            start_block: parse_or("START_BLOCK", 0)?,
            log_chunk_size: parse_or("LOG_CHUNK_SIZE", 10_000)?,
            subscribe_poll_secs: parse_or("SUBSCRIBE_POLL_SECS", 4)?,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            contract_address: "0x0000000000000000000000000000000000000001".to_string(),
            database_url: "sqlite::memory:".to_string(),
            port: 0,
            reconcile_interval_secs: 5,
            max_poll_options: 5,
            gap_retry_limit: 3,
            start_block: 0,
            log_chunk_size: 100,
            subscribe_poll_secs: 1,
        }
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
