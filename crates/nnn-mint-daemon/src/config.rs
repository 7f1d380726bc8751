// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use nnn_mint_core::{LedgerOptions, RetryPolicy, TOTAL_SUPPLY};
use thiserror::Error;

pub const LEDGER_FILE_NAME: &str = "nnn_mints.sqlite";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub supply_cap: u32,
    pub max_body_bytes: usize,
    pub claim_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Bearer token for the settlement endpoint; `None` disables it.
    pub settlement_token: Option<String>,
    pub metrics_listen: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            data_dir: PathBuf::from("./data"),
            supply_cap: TOTAL_SUPPLY,
            max_body_bytes: 16_384,
            claim_timeout_ms: 5_000,
            busy_timeout_ms: 250,
            retry_max_attempts: 8,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 200,
            settlement_token: None,
            metrics_listen: None,
        }
    }
}

impl DaemonConfig {
    /// Defaults overlaid with any `NNN_MINT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("NNN_MINT_LISTEN") {
            cfg.listen = v;
        }
        if let Some(v) = lookup("NNN_MINT_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("NNN_MINT_SUPPLY_CAP") {
            cfg.supply_cap = parse("NNN_MINT_SUPPLY_CAP", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_MAX_BODY_BYTES") {
            cfg.max_body_bytes = parse("NNN_MINT_MAX_BODY_BYTES", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_CLAIM_TIMEOUT_MS") {
            cfg.claim_timeout_ms = parse("NNN_MINT_CLAIM_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_BUSY_TIMEOUT_MS") {
            cfg.busy_timeout_ms = parse("NNN_MINT_BUSY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_RETRY_MAX_ATTEMPTS") {
            cfg.retry_max_attempts = parse("NNN_MINT_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_RETRY_BASE_DELAY_MS") {
            cfg.retry_base_delay_ms = parse("NNN_MINT_RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_RETRY_MAX_DELAY_MS") {
            cfg.retry_max_delay_ms = parse("NNN_MINT_RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("NNN_MINT_SETTLEMENT_TOKEN").filter(|v| !v.is_empty()) {
            cfg.settlement_token = Some(v);
        }
        if let Some(v) = lookup("NNN_MINT_METRICS_LISTEN").filter(|v| !v.is_empty()) {
            cfg.metrics_listen = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supply_cap == 0 {
            return Err(ConfigError::Zero("supply_cap"));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Zero("retry_max_attempts"));
        }
        if self.claim_timeout_ms == 0 {
            return Err(ConfigError::Zero("claim_timeout_ms"));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE_NAME)
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            supply_cap: self.supply_cap,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            ..LedgerOptions::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
            0.25,
        )
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    };
    value.trim().parse().map_err(|_| invalid())
}
