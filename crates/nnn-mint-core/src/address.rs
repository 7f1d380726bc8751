// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::Serialize;
use thiserror::Error;

const ADDRESS_HEX_LEN: usize = 40;
const TX_HASH_HEX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is missing")]
    Missing,
    #[error("address is malformed")]
    Malformed,
}

/// A claimant's account address, validated and case-folded.
///
/// Equality is on the normalized form, so `0xABC…` and `0xabc…` are the
/// same claimant everywhere the engine compares them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClaimantAddress(String);

impl ClaimantAddress {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Missing);
        }
        parse_prefixed_hex(raw, ADDRESS_HEX_LEN).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ClaimantAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of the downstream on-chain transaction attached to a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SettlementReference(String);

impl SettlementReference {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Missing);
        }
        parse_prefixed_hex(raw, TX_HASH_HEX_LEN).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SettlementReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_prefixed_hex(raw: &str, hex_len: usize) -> Result<String, AddressError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or(AddressError::Malformed)?;
    if digits.len() != hex_len || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AddressError::Malformed);
    }
    let mut normalized = String::with_capacity(hex_len + 2);
    normalized.push_str("0x");
    normalized.push_str(&digits.to_ascii_lowercase());
    Ok(normalized)
}
