use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use nnn_mint_core::{Allocator, LedgerOptions, RetryPolicy, SupplyLedger};
use serde_json::json;
use tempfile::TempDir;

use crate::claim::AllocationService;
use crate::config::DaemonConfig;
use crate::http_api::{
    build_state, claim_status_impl, health_impl, mint_impl, settle_impl, supply_impl, ApiState,
    MINT_SUCCESS_MESSAGE,
};
use crate::public_error::MSG_TRANSIENT;
use crate::telemetry::Telemetry;

fn state(temp: &TempDir, cfg: DaemonConfig) -> ApiState {
    let ledger = SupplyLedger::open(
        temp.path().join("mints.sqlite"),
        LedgerOptions::with_supply_cap(cfg.supply_cap),
    )
    .expect("ledger");
    let service = AllocationService::new(
        Allocator::new(Arc::new(ledger), RetryPolicy::default()),
        Duration::from_secs(5),
        Arc::new(Telemetry::new()),
    );
    build_state(cfg, service)
}

fn capped(cap: u32) -> DaemonConfig {
    DaemonConfig {
        supply_cap: cap,
        ..DaemonConfig::default()
    }
}

fn wallet(n: u32) -> String {
    format!("0x{n:040x}")
}

fn mint_body(wallet: &str) -> Vec<u8> {
    json!({ "wallet_address": wallet }).to_string().into_bytes()
}

fn settle_body(wallet: &str, transaction_hash: &str) -> Vec<u8> {
    json!({ "wallet_address": wallet, "transaction_hash": transaction_hash })
        .to_string()
        .into_bytes()
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
    );
    headers
}

fn tx_hash(digit: char) -> String {
    format!("0x{}", digit.to_string().repeat(64))
}

#[tokio::test]
async fn mints_in_order_then_reports_sold_out() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));
    for n in 1..=3 {
        let resp = mint_impl(&st, &mint_body(&wallet(n))).await.expect("mint");
        assert!(resp.success);
        assert_eq!(resp.token_id, n);
        assert_eq!(resp.message, MINT_SUCCESS_MESSAGE);
    }
    let err = mint_impl(&st, &mint_body(&wallet(4)))
        .await
        .expect_err("sold out");
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.message(), "All NFTs have been minted");

    let supply = supply_impl(&st).await.expect("supply");
    assert_eq!((supply.minted, supply.remaining), (3, 0));
}

#[tokio::test]
async fn duplicate_wallet_is_rejected_in_any_case() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(5));
    let upper = "0xABCDEF0123456789ABCDEF0123456789ABCDEF01";
    let first = mint_impl(&st, &mint_body(upper)).await.expect("mint");
    assert_eq!(first.wallet_address, upper.to_ascii_lowercase());

    let err = mint_impl(&st, &mint_body(&upper.to_ascii_lowercase()))
        .await
        .expect_err("duplicate");
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.message(), "Wallet has already minted");
    assert_eq!(supply_impl(&st).await.expect("supply").minted, 1);
}

#[tokio::test]
async fn missing_or_undecodable_body_means_missing_address() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));
    let bodies: [&[u8]; 5] = [
        b"",
        b"{}",
        b"garbage",
        b"[\"0xabc\"]",
        br#"{"wallet_address":""}"#,
    ];
    for body in bodies {
        let err = mint_impl(&st, body).await.expect_err("invalid");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Wallet address is required");
    }
    let padded = format!(" {}", wallet(1));
    let err = mint_impl(&st, &mint_body(&padded))
        .await
        .expect_err("whitespace");
    assert_eq!(err.message(), "Wallet address is invalid");
    assert_eq!(supply_impl(&st).await.expect("supply").minted, 0);
}

#[tokio::test]
async fn farcaster_fid_is_validated_and_stored() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));

    let bad = json!({ "wallet_address": wallet(1), "farcaster_fid": "abc" }).to_string();
    let err = mint_impl(&st, bad.as_bytes()).await.expect_err("bad fid");
    assert_eq!(err.message(), "Farcaster FID is invalid");

    let both_bad = json!({ "wallet_address": "", "farcaster_fid": -4 }).to_string();
    let err = mint_impl(&st, both_bad.as_bytes()).await.expect_err("bad");
    assert_eq!(err.message(), "Wallet address is required");

    let good = json!({ "wallet_address": wallet(1), "farcaster_fid": 4242 }).to_string();
    mint_impl(&st, good.as_bytes()).await.expect("mint");
    let stored = st
        .service
        .status(nnn_mint_core::ClaimantAddress::parse(&wallet(1)).expect("addr"))
        .await
        .expect("status")
        .expect("record");
    assert_eq!(stored.social_id, Some(4242));
}

#[tokio::test]
async fn claim_status_reflects_ledger() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));
    let lower = format!("0x{}", "ab".repeat(20));
    let before = claim_status_impl(&st, &lower).await.expect("status");
    assert!(!before.claimed);
    assert_eq!(before.token_id, None);

    mint_impl(&st, &mint_body(&lower)).await.expect("mint");
    let after = claim_status_impl(&st, &format!("0X{}", "AB".repeat(20)))
        .await
        .expect("status");
    assert!(after.claimed);
    assert_eq!(after.token_id, Some(1));
    assert_eq!(after.wallet_address, lower);

    let err = claim_status_impl(&st, "0x1234")
        .await
        .expect_err("malformed");
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn settlement_disabled_without_token() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));
    let body = settle_body(&wallet(1), &tx_hash('a'));
    let err = settle_impl(&st, &bearer("anything"), &body)
        .await
        .expect_err("disabled");
    assert_eq!(err.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn settlement_requires_token_and_records_once() {
    let temp = TempDir::new().expect("temp");
    let st = state(
        &temp,
        DaemonConfig {
            settlement_token: Some("s3cret".to_string()),
            ..capped(3)
        },
    );
    let body = settle_body(&wallet(1), &tx_hash('a'));

    let err = settle_impl(&st, &HeaderMap::new(), &body)
        .await
        .expect_err("no token");
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    let err = settle_impl(&st, &bearer("wrong"), &body)
        .await
        .expect_err("bad token");
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

    let err = settle_impl(&st, &bearer("s3cret"), &body)
        .await
        .expect_err("no mint");
    assert_eq!(err.status(), StatusCode::NOT_FOUND);
    assert_eq!(err.message(), "No mint recorded for wallet");

    mint_impl(&st, &mint_body(&wallet(1))).await.expect("mint");
    let settled = settle_impl(&st, &bearer("s3cret"), &body)
        .await
        .expect("settled");
    assert_eq!(settled.token_id, 1);
    assert_eq!(settled.transaction_hash, tx_hash('a'));
    settle_impl(&st, &bearer("s3cret"), &body)
        .await
        .expect("same hash is idempotent");

    let other = settle_body(&wallet(1), &tx_hash('b'));
    let err = settle_impl(&st, &bearer("s3cret"), &other)
        .await
        .expect_err("conflict");
    assert_eq!(err.status(), StatusCode::CONFLICT);

    let short = settle_body(&wallet(1), "0xabc");
    let err = settle_impl(&st, &bearer("s3cret"), &short)
        .await
        .expect_err("bad hash");
    assert_eq!(err.message(), "Transaction hash is invalid");

    let status = claim_status_impl(&st, &wallet(1)).await.expect("status");
    assert_eq!(status.transaction_hash, Some(tx_hash('a')));
}

#[tokio::test]
async fn health_reports_ok_for_open_ledger() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));
    let (status, body) = health_impl(&st).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.status, "ok");
}

#[tokio::test]
async fn invalid_requests_are_counted() {
    let temp = TempDir::new().expect("temp");
    let st = state(&temp, capped(3));
    let _ = mint_impl(&st, b"{}").await;
    let bad_fid = json!({ "wallet_address": wallet(1), "farcaster_fid": true }).to_string();
    let _ = mint_impl(&st, bad_fid.as_bytes()).await;
    assert_eq!(st.service.telemetry().claims_total("invalid_request"), 2);
}

#[tokio::test]
async fn timed_out_claim_is_transient_and_commits_later() {
    let temp = TempDir::new().expect("temp");
    let path = temp.path().join("mints.sqlite");
    let options = LedgerOptions {
        busy_timeout: Duration::from_secs(10),
        ..LedgerOptions::with_supply_cap(3)
    };
    let ledger = SupplyLedger::open(&path, options).expect("ledger");
    let service = AllocationService::new(
        Allocator::new(Arc::new(ledger), RetryPolicy::default()),
        Duration::from_millis(100),
        Arc::new(Telemetry::new()),
    );
    let st = build_state(capped(3), service);

    let mut blocker = rusqlite::Connection::open(&path).expect("conn");
    let lock = blocker
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .expect("lock");
    let err = mint_impl(&st, &mint_body(&wallet(1)))
        .await
        .expect_err("timed out");
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.message(), MSG_TRANSIENT);
    let metrics = st.service.telemetry().render();
    assert!(metrics.contains("nnn_mint_storage_failures_total{kind=\"timeout\"} 1"));
    lock.rollback().expect("release");

    let mut minted = 0;
    for _ in 0..100 {
        minted = supply_impl(&st).await.expect("supply").minted;
        if minted == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(minted, 1);

    let err = mint_impl(&st, &mint_body(&wallet(1)))
        .await
        .expect_err("retry");
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.message(), "Wallet has already minted");
    assert_eq!(supply_impl(&st).await.expect("supply").minted, 1);
}
