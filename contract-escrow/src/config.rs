//! Engine configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! file, then `CONTRACT_ESCROW__`-prefixed environment variables
//! (e.g. `CONTRACT_ESCROW__LIMITS__MAX_MILESTONE_AMOUNT=5000`).

use crate::{error::EscrowError, EscrowResult};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CONTRACT_ESCROW";

/// Top-level configuration for the contract engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    pub concurrency: ConcurrencyConfig,
    pub activity: ActivityConfig,
    pub response: ResponseConfig,
    pub logging: LoggingConfig,
}

/// Limits applied when validating contract terms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum amount of a single milestone
    pub max_milestone_amount: Decimal,
    /// Maximum number of milestones per contract
    pub max_milestones_per_contract: usize,
    /// Decimal places of the settlement currency
    pub currency_scale: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_milestone_amount: Decimal::from(1_000_000),
            max_milestones_per_contract: 50,
            currency_scale: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Re-stage attempts after a stale write before giving up
    pub max_commit_retries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub default_recent_limit: usize,
    pub max_recent_limit: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            default_recent_limit: 20,
            max_recent_limit: 100,
        }
    }
}

/// Response shaping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Field names stripped from response payloads (case-insensitive substring match)
    pub sensitive_fields: Vec<String>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            sensitive_fields: [
                "password",
                "token",
                "secret",
                "api_key",
                "apikey",
                "authorization",
                "private_key",
                "card_number",
                "cvv",
                "account_number",
                "payment_instrument",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> EscrowResult<()> {
        if self.limits.max_milestone_amount <= Decimal::ZERO {
            return Err(EscrowError::config(
                "limits.max_milestone_amount must be greater than 0",
            ));
        }

        if self.limits.max_milestones_per_contract == 0 {
            return Err(EscrowError::config(
                "limits.max_milestones_per_contract must be at least 1",
            ));
        }

        if self.limits.currency_scale > 8 {
            return Err(EscrowError::config(format!(
                "limits.currency_scale {} exceeds 8",
                self.limits.currency_scale
            )));
        }

        if self.activity.default_recent_limit == 0
            || self.activity.default_recent_limit > self.activity.max_recent_limit
        {
            return Err(EscrowError::config(
                "activity.default_recent_limit must be between 1 and activity.max_recent_limit",
            ));
        }

        if self
            .response
            .sensitive_fields
            .iter()
            .any(|field| field.trim().is_empty())
        {
            return Err(EscrowError::config(
                "response.sensitive_fields must not contain empty names",
            ));
        }

        Ok(())
    }
}
