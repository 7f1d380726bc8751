// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use rusqlite::ErrorCode;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Database(#[source] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Another writer holds the database lock past the busy timeout.
    #[error("ledger busy: {0}")]
    Busy(#[source] rusqlite::Error),

    #[error("claimant {claimant} already holds a slot")]
    DuplicateClaimant { claimant: String },

    /// Two writers computed the same next slot number.
    #[error("slot {slot_number} already assigned")]
    SlotConflict { slot_number: u32 },

    /// Rejected by the storage-level supply cap guard.
    #[error("supply cap {supply_cap} reached")]
    CapReached { supply_cap: u32 },

    #[error("ledger was created with supply cap {stored}, configured cap is {configured}")]
    SupplyCapMismatch { stored: u32, configured: u32 },

    #[error("ledger schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("no claim recorded for {claimant}")]
    ClaimNotFound { claimant: String },

    #[error("settlement reference for {claimant} already recorded")]
    SettlementConflict { claimant: String },

    #[error("ledger integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("invalid stored value in column {column}")]
    InvalidValue { column: &'static str },
}

impl LedgerError {
    /// Whether the failed operation may succeed if retried from the top.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::SlotConflict { .. })
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Busy(err),
            _ => Self::Database(err),
        }
    }
}
