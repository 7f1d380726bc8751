// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Claim allocation engine for a fixed-supply mint.
//!
//! A [`SupplyLedger`] durably stores one [`ClaimRecord`] per claimant. The
//! [`Allocator`] runs the check-and-insert decision inside a single
//! storage-serialized transaction so concurrent claims can never share a slot
//! number, exceed the supply cap, or hand one claimant two slots.

pub mod address;
pub mod allocation;
pub mod error;
pub mod ledger;
pub mod record;
pub mod retry;

pub use address::{AddressError, ClaimantAddress, SettlementReference};
pub use allocation::{AllocationError, Allocator};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{LedgerOptions, SupplyLedger};
pub use record::ClaimRecord;
pub use retry::RetryPolicy;

/// Supply cap of the NNN Survivor mint.
pub const TOTAL_SUPPLY: u32 = 69;
