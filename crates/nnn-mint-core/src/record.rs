// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::address::ClaimantAddress;

/// One committed allocation. Created once by the allocator, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    pub claimant_address: ClaimantAddress,
    /// 1-based, contiguous in commit order.
    pub slot_number: u32,
    /// Social identifier supplied by the identity provider (Farcaster FID).
    pub social_id: Option<u64>,
    /// Downstream transaction hash, attached after allocation.
    pub settlement_reference: Option<String>,
    pub created_at_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
