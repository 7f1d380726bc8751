// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::address::ClaimantAddress;
use crate::error::LedgerError;
use crate::ledger::SupplyLedger;
use crate::record::ClaimRecord;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("claimant already holds a slot")]
    AlreadyClaimed,

    #[error("all {supply_cap} slots have been allocated")]
    SupplyExhausted { supply_cap: u32 },

    #[error("ledger unavailable after {attempts} attempts")]
    TransientStorageFailure {
        attempts: u32,
        #[source]
        source: LedgerError,
    },

    #[error("unexpected ledger failure")]
    Unexpected(#[source] LedgerError),
}

/// Why a single attempt did not commit.
enum Attempt {
    Rejected(AllocationError),
    Storage(LedgerError),
}

impl From<LedgerError> for Attempt {
    fn from(err: LedgerError) -> Self {
        Self::Storage(err)
    }
}

/// The allocation transaction: at most one slot per claimant, at most
/// `supply_cap` slots, slot numbers contiguous in commit order.
#[derive(Debug, Clone)]
pub struct Allocator {
    ledger: Arc<SupplyLedger>,
    retry: RetryPolicy,
}

impl Allocator {
    pub fn new(ledger: Arc<SupplyLedger>, retry: RetryPolicy) -> Self {
        Self { ledger, retry }
    }

    pub fn ledger(&self) -> &Arc<SupplyLedger> {
        &self.ledger
    }

    pub fn supply_cap(&self) -> u32 {
        self.ledger.supply_cap()
    }

    /// Allocates the next slot to `claimant`. Blocks on the ledger's writer
    /// lock; call from a blocking context.
    ///
    /// Each attempt runs the existence check, the cap check and the insert in
    /// one `BEGIN IMMEDIATE` transaction. A contended attempt is rolled back
    /// and rerun from the top, so a condition that became true meanwhile
    /// surfaces as [`AllocationError::AlreadyClaimed`] or
    /// [`AllocationError::SupplyExhausted`].
    pub fn allocate(
        &self,
        claimant: &ClaimantAddress,
        social_id: Option<u64>,
    ) -> Result<ClaimRecord, AllocationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(claimant, social_id) {
                Ok(record) => {
                    info!(
                        target: "nnn_mint.audit",
                        wallet = %record.claimant_address,
                        token_id = record.slot_number,
                        fid = ?record.social_id,
                        attempts = attempt,
                        "slot allocated"
                    );
                    return Ok(record);
                }
                Err(Attempt::Rejected(err)) => {
                    debug!(wallet = %claimant, reason = %err, "allocation rejected");
                    return Err(err);
                }
                Err(Attempt::Storage(err)) if err.is_transient() => {
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            wallet = %claimant,
                            attempts = attempt,
                            error = %err,
                            "allocation retry budget exhausted"
                        );
                        return Err(AllocationError::TransientStorageFailure {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(
                        wallet = %claimant,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "allocation contended, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(Attempt::Storage(err)) => {
                    warn!(wallet = %claimant, error = %err, "allocation failed");
                    return Err(AllocationError::Unexpected(err));
                }
            }
        }
    }

    fn attempt(
        &self,
        claimant: &ClaimantAddress,
        social_id: Option<u64>,
    ) -> Result<ClaimRecord, Attempt> {
        self.ledger.write(|txn| {
            if txn.find_by_claimant(claimant)?.is_some() {
                return Err(Attempt::Rejected(AllocationError::AlreadyClaimed));
            }
            let supply_cap = txn.supply_cap();
            if txn.count()? >= supply_cap {
                return Err(Attempt::Rejected(AllocationError::SupplyExhausted { supply_cap }));
            }
            txn.insert_if_unique(claimant, social_id).map_err(|err| match err {
                LedgerError::DuplicateClaimant { .. } => {
                    Attempt::Rejected(AllocationError::AlreadyClaimed)
                }
                LedgerError::CapReached { supply_cap } => {
                    Attempt::Rejected(AllocationError::SupplyExhausted { supply_cap })
                }
                other => Attempt::Storage(other),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerOptions;
    use tempfile::TempDir;

    fn addr(n: u32) -> ClaimantAddress {
        ClaimantAddress::parse(&format!("0x{n:040x}")).expect("address")
    }

    fn allocator(temp: &TempDir, cap: u32) -> Allocator {
        let ledger = SupplyLedger::open(
            temp.path().join("mints.sqlite"),
            LedgerOptions::with_supply_cap(cap),
        )
        .expect("ledger");
        Allocator::new(Arc::new(ledger), RetryPolicy::default())
    }

    #[test]
    fn happy_path_allocates_in_order_then_sells_out() {
        let temp = TempDir::new().expect("temp");
        let alloc = allocator(&temp, 3);
        for n in 1..=3 {
            let record = alloc.allocate(&addr(n), None).expect("allocated");
            assert_eq!(record.slot_number, n);
        }
        let err = alloc.allocate(&addr(4), None).expect_err("sold out");
        assert!(matches!(err, AllocationError::SupplyExhausted { supply_cap: 3 }));
        assert_eq!(alloc.ledger().count().expect("count"), 3);
    }

    #[test]
    fn duplicate_claim_is_rejected_without_write() {
        let temp = TempDir::new().expect("temp");
        let alloc = allocator(&temp, 5);
        let first = alloc.allocate(&addr(1), Some(7)).expect("allocated");
        assert_eq!(first.slot_number, 1);
        let err = alloc.allocate(&addr(1), Some(7)).expect_err("duplicate");
        assert!(matches!(err, AllocationError::AlreadyClaimed));
        assert_eq!(alloc.ledger().count().expect("count"), 1);
    }

    #[test]
    fn already_claimed_wins_over_sold_out() {
        let temp = TempDir::new().expect("temp");
        let alloc = allocator(&temp, 1);
        alloc.allocate(&addr(1), None).expect("allocated");
        let err = alloc.allocate(&addr(1), None).expect_err("duplicate");
        assert!(matches!(err, AllocationError::AlreadyClaimed));
    }

    #[test]
    fn mixed_case_addresses_are_one_claimant() {
        let temp = TempDir::new().expect("temp");
        let alloc = allocator(&temp, 5);
        let upper =
            ClaimantAddress::parse("0xABCDEF0123456789ABCDEF0123456789ABCDEF01").expect("upper");
        let lower =
            ClaimantAddress::parse("0xabcdef0123456789abcdef0123456789abcdef01").expect("lower");
        alloc.allocate(&upper, None).expect("allocated");
        let err = alloc.allocate(&lower, None).expect_err("same claimant");
        assert!(matches!(err, AllocationError::AlreadyClaimed));
    }

    #[test]
    fn lock_held_past_retry_budget_is_transient_failure() {
        let temp = TempDir::new().expect("temp");
        let path = temp.path().join("mints.sqlite");
        let options = LedgerOptions {
            busy_timeout: std::time::Duration::from_millis(1),
            ..LedgerOptions::with_supply_cap(5)
        };
        let ledger = SupplyLedger::open(&path, options).expect("ledger");
        let alloc = Allocator::new(Arc::new(ledger), RetryPolicy::new(3, 1, 2, 0.0));

        let mut blocker = rusqlite::Connection::open(&path).expect("conn");
        let tx = blocker
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .expect("lock");

        let err = alloc.allocate(&addr(1), None).expect_err("busy");
        assert!(matches!(
            err,
            AllocationError::TransientStorageFailure { attempts: 3, .. }
        ));
        drop(tx);

        let record = alloc
            .allocate(&addr(1), None)
            .expect("allocated after release");
        assert_eq!(record.slot_number, 1);
    }
}
