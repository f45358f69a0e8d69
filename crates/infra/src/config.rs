//! Runtime configuration, read from the environment.

use chrono::Duration;
use thiserror::Error;

use sacco_ledger::DEFAULT_PENDING_EXPIRY_DAYS;

pub const ENV_PENDING_EXPIRY_DAYS: &str = "SACCO_PENDING_EXPIRY_DAYS";
pub const ENV_MINIMUM_SHARES: &str = "SACCO_MINIMUM_SHARES";
pub const ENV_INVESTMENT_LIMIT: &str = "SACCO_INVESTMENT_LIMIT";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// How long an unresolved external transaction stays settleable.
    pub pending_expiry: Duration,
    /// Share capital a member needs for full membership.
    pub minimum_shares_required: u64,
    /// Ceiling on active invested total per member.
    pub investment_limit: u64,
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            pending_expiry: Duration::days(DEFAULT_PENDING_EXPIRY_DAYS),
            minimum_shares_required: 5_000,
            investment_limit: 1_000_000,
            database_url: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let expiry_days = match lookup(ENV_PENDING_EXPIRY_DAYS) {
            Some(value) => positive(ENV_PENDING_EXPIRY_DAYS, &value)?,
            None => DEFAULT_PENDING_EXPIRY_DAYS as u64,
        };
        let minimum_shares_required = match lookup(ENV_MINIMUM_SHARES) {
            Some(value) => number(ENV_MINIMUM_SHARES, &value)?,
            None => defaults.minimum_shares_required,
        };
        let investment_limit = match lookup(ENV_INVESTMENT_LIMIT) {
            Some(value) => number(ENV_INVESTMENT_LIMIT, &value)?,
            None => defaults.investment_limit,
        };

        Ok(Self {
            pending_expiry: Duration::days(expiry_days as i64),
            minimum_shares_required,
            investment_limit,
            database_url: lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty()),
        })
    }
}

fn number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n <= i64::MAX as u64)
        .ok_or_else(|| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

fn positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match number(var, value)? {
        0 => Err(ConfigError::Zero { var }),
        // keep `Duration::days` in range
        n => Ok(n.min(365_000)),
    }
}
