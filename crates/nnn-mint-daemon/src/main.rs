// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nnn_mint_core::{Allocator, SupplyLedger, TOTAL_SUPPLY};
use nnn_mint_daemon::claim::AllocationService;
use nnn_mint_daemon::config::DaemonConfig;
use nnn_mint_daemon::http_api;
use nnn_mint_daemon::telemetry::Telemetry;

#[derive(Debug, Parser)]
#[command(name = "nnn-mint-daemon")]
#[command(about = "Claim-slot allocation service for the NNN mint")]
struct Args {
    #[arg(long, env = "NNN_MINT_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,

    #[arg(long, env = "NNN_MINT_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long, env = "NNN_MINT_SUPPLY_CAP", default_value_t = TOTAL_SUPPLY)]
    supply_cap: u32,

    #[arg(long, env = "NNN_MINT_MAX_BODY_BYTES", default_value_t = 16_384)]
    max_body_bytes: usize,

    #[arg(long, env = "NNN_MINT_CLAIM_TIMEOUT_MS", default_value_t = 5_000)]
    claim_timeout_ms: u64,

    #[arg(long, env = "NNN_MINT_BUSY_TIMEOUT_MS", default_value_t = 250)]
    busy_timeout_ms: u64,

    #[arg(long, env = "NNN_MINT_RETRY_MAX_ATTEMPTS", default_value_t = 8)]
    retry_max_attempts: u32,

    #[arg(long, env = "NNN_MINT_RETRY_BASE_DELAY_MS", default_value_t = 5)]
    retry_base_delay_ms: u64,

    #[arg(long, env = "NNN_MINT_RETRY_MAX_DELAY_MS", default_value_t = 200)]
    retry_max_delay_ms: u64,

    /// Enables `POST /v1/settlements` for bearers of this token.
    #[arg(long, env = "NNN_MINT_SETTLEMENT_TOKEN", hide_env_values = true)]
    settlement_token: Option<String>,

    #[arg(long, env = "NNN_MINT_METRICS_LISTEN")]
    metrics_listen: Option<String>,

    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn into_config(self) -> DaemonConfig {
        DaemonConfig {
            listen: self.listen,
            data_dir: self.data_dir,
            supply_cap: self.supply_cap,
            max_body_bytes: self.max_body_bytes,
            claim_timeout_ms: self.claim_timeout_ms,
            busy_timeout_ms: self.busy_timeout_ms,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
            settlement_token: self.settlement_token.filter(|t| !t.is_empty()),
            metrics_listen: self.metrics_listen.filter(|m| !m.is_empty()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let cfg = args.into_config();
    cfg.validate()?;
    std::fs::create_dir_all(&cfg.data_dir)?;

    let ledger = Arc::new(SupplyLedger::open(cfg.ledger_path(), cfg.ledger_options())?);
    let minted = ledger.verify_integrity()?;
    tracing::info!(
        path = %ledger.path().display(),
        supply_cap = ledger.supply_cap(),
        minted,
        "ledger opened"
    );

    let telemetry = Arc::new(Telemetry::new());
    telemetry.set_supply_minted(minted);
    if let Some(metrics_listen) = cfg.metrics_listen.as_deref() {
        let metrics_addr: SocketAddr = metrics_listen.parse()?;
        telemetry.clone().spawn_metrics_server(metrics_addr).await?;
    }

    let service = AllocationService::new(
        Allocator::new(ledger, cfg.retry_policy()),
        cfg.claim_timeout(),
        telemetry,
    );
    let listener = http_api::bind_listener(&cfg.listen).await?;
    tracing::info!(
        addr = %cfg.listen,
        settlement_enabled = cfg.settlement_token.is_some(),
        retry_max_attempts = cfg.retry_max_attempts,
        "starting NNN mint HTTP server"
    );

    http_api::serve(listener, http_api::build_state(cfg, service), async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutting down"),
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    })
    .await?;

    Ok(())
}
