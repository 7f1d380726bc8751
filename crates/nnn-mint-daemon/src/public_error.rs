// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use axum::http::StatusCode;

pub const PUBLIC_ERROR_HEADER: &str = "x-nnn-mint-error-code";

pub const MSG_ADDRESS_REQUIRED: &str = "Wallet address is required";
pub const MSG_ADDRESS_INVALID: &str = "Wallet address is invalid";
pub const MSG_FID_INVALID: &str = "Farcaster FID is invalid";
pub const MSG_TX_HASH_INVALID: &str = "Transaction hash is invalid";
pub const MSG_ALREADY_MINTED: &str = "Wallet has already minted";
pub const MSG_SOLD_OUT: &str = "All NFTs have been minted";
pub const MSG_NO_MINT: &str = "No mint recorded for wallet";
pub const MSG_SETTLEMENT_CONFLICT: &str = "Settlement reference already recorded";
pub const MSG_UNAUTHORIZED: &str = "Unauthorized";
pub const MSG_NOT_FOUND: &str = "Not found";
pub const MSG_TRANSIENT: &str = "Mint temporarily unavailable, please retry";
pub const MSG_UNEXPECTED: &str = "An unexpected error occurred";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicErrorCode {
    InvalidInput,
    AlreadyClaimed,
    SupplyExhausted,
    Unauthorized,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl PublicErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::AlreadyClaimed => "ALREADY_CLAIMED",
            Self::SupplyExhausted => "SUPPLY_EXHAUSTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Mint failures are all 400s to match the existing client contract;
    /// storage faults are 500s regardless of cause.
    pub const fn status(self) -> StatusCode {
        match self {
            Self::InvalidInput | Self::AlreadyClaimed | Self::SupplyExhausted => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Unavailable | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_rejections_are_bad_request_and_faults_are_500() {
        for code in [
            PublicErrorCode::InvalidInput,
            PublicErrorCode::AlreadyClaimed,
            PublicErrorCode::SupplyExhausted,
        ] {
            assert_eq!(code.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(
            PublicErrorCode::Unavailable.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PublicErrorCode::Internal.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
