// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use nnn_mint_core::{
    AddressError, AllocationError, Allocator, ClaimRecord, ClaimantAddress, LedgerError,
    SettlementReference,
};
use serde::Serialize;
use thiserror::Error;

use crate::public_error::{MSG_ADDRESS_INVALID, MSG_ADDRESS_REQUIRED};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    Allocated(ClaimRecord),
    AlreadyClaimed,
    SupplyExhausted,
    InvalidRequest { reason: &'static str },
}

impl AllocationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allocated(_) => "allocated",
            Self::AlreadyClaimed => "already_claimed",
            Self::SupplyExhausted => "supply_exhausted",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }
}

/// Internal faults, reported to clients without detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimFailure {
    /// Storage busy, timed out, or contended past the retry budget. The
    /// client may retry the whole request.
    #[error("transient storage failure")]
    TransientStorageFailure,
    #[error("unexpected failure")]
    UnexpectedFailure,
}

impl ClaimFailure {
    pub fn label(self) -> &'static str {
        match self {
            Self::TransientStorageFailure => "transient_storage_failure",
            Self::UnexpectedFailure => "unexpected_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupplySnapshot {
    pub total_supply: u32,
    pub minted: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled(ClaimRecord),
    NotFound,
    Conflict,
}

pub fn invalid_address_reason(err: AddressError) -> &'static str {
    match err {
        AddressError::Missing => MSG_ADDRESS_REQUIRED,
        AddressError::Malformed => MSG_ADDRESS_INVALID,
    }
}

/// Stateless request boundary over the [`Allocator`].
///
/// Holds no supply state between calls; every answer comes from the ledger.
/// Ledger work runs on the blocking pool under `timeout`.
#[derive(Debug, Clone)]
pub struct AllocationService {
    allocator: Allocator,
    timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl AllocationService {
    pub fn new(allocator: Allocator, timeout: Duration, telemetry: Arc<Telemetry>) -> Self {
        Self {
            allocator,
            timeout,
            telemetry,
        }
    }

    pub fn supply_cap(&self) -> u32 {
        self.allocator.supply_cap()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Validates and case-folds `wallet_address`, then runs one allocation
    /// transaction. Malformed input never reaches the ledger.
    pub async fn claim(
        &self,
        wallet_address: &str,
        social_id: Option<u64>,
    ) -> Result<AllocationOutcome, ClaimFailure> {
        let started = Instant::now();
        let result = self.claim_inner(wallet_address, social_id).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.telemetry.record_claim_latency_ms(latency_ms);
        match &result {
            Ok(outcome) => self.telemetry.record_claim(outcome.label()),
            Err(failure) => self.telemetry.record_claim(failure.label()),
        }
        result
    }

    async fn claim_inner(
        &self,
        wallet_address: &str,
        social_id: Option<u64>,
    ) -> Result<AllocationOutcome, ClaimFailure> {
        let claimant = match ClaimantAddress::parse(wallet_address) {
            Ok(claimant) => claimant,
            Err(err) => {
                return Ok(AllocationOutcome::InvalidRequest {
                    reason: invalid_address_reason(err),
                })
            }
        };
        let allocator = self.allocator.clone();
        let wallet = claimant.clone();
        let allocated = self
            .run_blocking("claim", move || allocator.allocate(&wallet, social_id))
            .await?;
        match allocated {
            Ok(record) => Ok(AllocationOutcome::Allocated(record)),
            Err(AllocationError::AlreadyClaimed) => Ok(AllocationOutcome::AlreadyClaimed),
            Err(AllocationError::SupplyExhausted { .. }) => Ok(AllocationOutcome::SupplyExhausted),
            Err(AllocationError::TransientStorageFailure { attempts, source }) => {
                self.telemetry.record_storage_failure("retry_exhausted");
                tracing::warn!(
                    wallet = %claimant,
                    attempts,
                    error = %source,
                    "claim storage contention"
                );
                Err(ClaimFailure::TransientStorageFailure)
            }
            Err(AllocationError::Unexpected(source)) => {
                self.telemetry.record_storage_failure("unexpected");
                tracing::error!(wallet = %claimant, error = %source, "claim failed");
                Err(ClaimFailure::UnexpectedFailure)
            }
        }
    }

    /// Advisory lookup; never a substitute for the check inside `claim`.
    pub async fn status(
        &self,
        claimant: ClaimantAddress,
    ) -> Result<Option<ClaimRecord>, ClaimFailure> {
        let ledger = Arc::clone(self.allocator.ledger());
        let found = self
            .run_blocking("status", move || ledger.find_by_claimant(&claimant))
            .await?;
        found.map_err(|err| self.ledger_failure("status", err))
    }

    /// Recomputed from the ledger on every call.
    pub async fn supply(&self) -> Result<SupplySnapshot, ClaimFailure> {
        let ledger = Arc::clone(self.allocator.ledger());
        let total_supply = ledger.supply_cap();
        let minted = self
            .run_blocking("supply", move || ledger.count())
            .await?
            .map_err(|err| self.ledger_failure("supply", err))?;
        self.telemetry.set_supply_minted(minted);
        Ok(SupplySnapshot {
            total_supply,
            minted,
            remaining: total_supply.saturating_sub(minted),
        })
    }

    pub async fn settle(
        &self,
        claimant: ClaimantAddress,
        reference: SettlementReference,
    ) -> Result<SettleOutcome, ClaimFailure> {
        let ledger = Arc::clone(self.allocator.ledger());
        let wallet = claimant.clone();
        let attached = self
            .run_blocking("settle", move || {
                ledger.attach_settlement_reference(&wallet, &reference)
            })
            .await?;
        match attached {
            Ok(record) => {
                tracing::info!(
                    target: "nnn_mint.audit",
                    wallet = %claimant,
                    token_id = record.slot_number,
                    transaction_hash = ?record.settlement_reference,
                    "settlement reference attached"
                );
                Ok(SettleOutcome::Settled(record))
            }
            Err(LedgerError::ClaimNotFound { .. }) => Ok(SettleOutcome::NotFound),
            Err(LedgerError::SettlementConflict { .. }) => Ok(SettleOutcome::Conflict),
            Err(err) => Err(self.ledger_failure("settle", err)),
        }
    }

    async fn run_blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, ClaimFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.telemetry.record_storage_failure("task_failed");
                tracing::error!(op, error = %err, "ledger task failed");
                Err(ClaimFailure::UnexpectedFailure)
            }
            Err(_) => {
                // The blocking transaction keeps running and either commits
                // or rolls back on its own.
                self.telemetry.record_storage_failure("timeout");
                tracing::warn!(
                    op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "ledger call timed out; outcome unknown"
                );
                Err(ClaimFailure::TransientStorageFailure)
            }
        }
    }

    fn ledger_failure(&self, op: &'static str, err: LedgerError) -> ClaimFailure {
        if err.is_transient() {
            self.telemetry.record_storage_failure("busy");
            tracing::warn!(op, error = %err, "ledger busy");
            ClaimFailure::TransientStorageFailure
        } else {
            self.telemetry.record_storage_failure("unexpected");
            tracing::error!(op, error = %err, "ledger failure");
            ClaimFailure::UnexpectedFailure
        }
    }
}
