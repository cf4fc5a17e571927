//! Configuration management for the marketplace client.
//!
//! Loads configuration from environment variables. The ledger endpoint and
//! address have no sensible default and must be set; everything else falls
//! back to a default.

use crate::transaction::Timeouts;
use parkmarket_core::Address;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC endpoint of the ledger node
pub const RPC_URL_VAR: &str = "PARKMARKET_RPC_URL";
/// Address of the marketplace ledger
pub const LEDGER_ADDRESS_VAR: &str = "PARKMARKET_LEDGER_ADDRESS";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{0} is not set")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Ledger connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// Marketplace ledger address
    pub address: Address,
    /// Interval between receipt polls
    pub receipt_poll_interval: Duration,
    /// How long to keep polling before giving up on a receipt
    pub receipt_timeout: Duration,
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Ledger connection
    pub ledger: LedgerConfig,
    /// Transaction wait bounds
    pub timeouts: Timeouts,
    /// Prometheus listener address
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if the endpoint or address is unset,
    /// [`ConfigError::Invalid`] if any value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// As [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = lookup(RPC_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(RPC_URL_VAR))?;

        let raw_address = lookup(LEDGER_ADDRESS_VAR).ok_or(ConfigError::Missing(LEDGER_ADDRESS_VAR))?;
        let address = raw_address
            .parse::<Address>()
            .map_err(|e| ConfigError::Invalid {
                var: LEDGER_ADDRESS_VAR,
                value: raw_address.clone(),
                reason: e.to_string(),
            })?;

        let signature_secs = parsed(&lookup, "PARKMARKET_SIGNATURE_TIMEOUT_SECS", 300)?;
        let confirmation_secs = parsed(&lookup, "PARKMARKET_CONFIRMATION_TIMEOUT_SECS", 120)?;
        let poll_ms = parsed(&lookup, "PARKMARKET_RECEIPT_POLL_MS", 1000)?;
        let receipt_secs = parsed(&lookup, "PARKMARKET_RECEIPT_TIMEOUT_SECS", 600)?;
        let metrics_addr = parsed(
            &lookup,
            "PARKMARKET_METRICS_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 9090)),
        )?;

        Ok(Self {
            ledger: LedgerConfig {
                rpc_url,
                address,
                receipt_poll_interval: Duration::from_millis(poll_ms),
                receipt_timeout: Duration::from_secs(receipt_secs),
            },
            timeouts: Timeouts {
                signature: Duration::from_secs(signature_secs),
                confirmation: Duration::from_secs(confirmation_secs),
            },
            metrics_addr,
        })
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
