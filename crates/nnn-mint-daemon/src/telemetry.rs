// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const LATENCY_BUCKETS_MS: [u64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];
const METRICS_PATH: &str = "/metrics";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const METHOD_NOT_ALLOWED: &str = "405 Method Not Allowed";
const METHOD_NOT_ALLOWED_BODY: &str = "mint metrics are read with GET\n";
const NOT_FOUND_BODY: &str = "mint metrics are served at /metrics\n";
const BAD_REQUEST_BODY: &str = "malformed request line\n";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("metrics server failed: {0}")]
    Server(std::io::Error),
}

#[derive(Debug, Default)]
struct TelemetryState {
    claims_total: HashMap<String, u64>,
    claim_latency_ms_bucket: BTreeMap<u64, u64>,
    storage_failures_total: HashMap<String, u64>,
    supply_minted: Option<u32>,
}

/// Observational counters only; nothing here feeds an allocation decision.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claim(&self, outcome: &str) {
        let mut guard = self.state.lock();
        let entry = guard.claims_total.entry(outcome.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_claim_latency_ms(&self, latency_ms: u64) {
        let mut guard = self.state.lock();
        let bucket = LATENCY_BUCKETS_MS
            .into_iter()
            .find(|bound| latency_ms <= *bound)
            .unwrap_or(u64::MAX);
        let entry = guard.claim_latency_ms_bucket.entry(bucket).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_storage_failure(&self, kind: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .storage_failures_total
            .entry(kind.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    /// Last minted count read from the ledger, for the display gauge.
    pub fn set_supply_minted(&self, minted: u32) {
        self.state.lock().supply_minted = Some(minted);
    }

    pub fn claims_total(&self, outcome: &str) -> u64 {
        self.state
            .lock()
            .claims_total
            .get(outcome)
            .copied()
            .unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        out.push_str("# TYPE nnn_mint_claims_total counter\n");
        let mut claims: Vec<_> = guard.claims_total.iter().collect();
        claims.sort();
        for (outcome, value) in claims {
            let _ = writeln!(
                out,
                "nnn_mint_claims_total{{outcome=\"{}\"}} {}",
                outcome, value
            );
        }
        out.push_str("# TYPE nnn_mint_claim_latency_ms_bucket counter\n");
        for (bucket, value) in &guard.claim_latency_ms_bucket {
            let bucket_label = if *bucket == u64::MAX {
                "+Inf".to_string()
            } else {
                bucket.to_string()
            };
            let _ = writeln!(
                out,
                "nnn_mint_claim_latency_ms_bucket{{le=\"{}\"}} {}",
                bucket_label, value
            );
        }
        out.push_str("# TYPE nnn_mint_storage_failures_total counter\n");
        let mut failures: Vec<_> = guard.storage_failures_total.iter().collect();
        failures.sort();
        for (kind, value) in failures {
            let _ = writeln!(
                out,
                "nnn_mint_storage_failures_total{{kind=\"{}\"}} {}",
                kind, value
            );
        }
        if let Some(minted) = guard.supply_minted {
            out.push_str("# TYPE nnn_mint_supply_minted gauge\n");
            let _ = writeln!(out, "nnn_mint_supply_minted {}", minted);
        }
        out
    }

    pub async fn spawn_metrics_server(
        self: Arc<Self>,
        addr: SocketAddr,
    ) -> Result<tokio::task::JoinHandle<()>, TelemetryError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TelemetryError::Server)?;
        tracing::info!(%addr, path = METRICS_PATH, "mint metrics listening");
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        tokio::spawn(self.clone().answer_scrape(socket, peer));
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!(error = %err, "metrics accept failed");
                        break;
                    }
                }
            }
        }))
    }

    async fn answer_scrape(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) {
        let mut buf = vec![0_u8; 2048];
        let n = match socket.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "metrics socket read failed");
                return;
            }
        };
        let head = String::from_utf8_lossy(&buf[..n]);
        let response = match request_target(&head) {
            Some(("GET", path)) if is_metrics_path(path) => {
                tracing::debug!(%peer, path, "metrics scrape");
                http_response("200 OK", PROMETHEUS_CONTENT_TYPE, &self.render())
            }
            Some((method, path)) if is_metrics_path(path) => {
                tracing::debug!(%peer, method, path, "metrics scrape with wrong method");
                http_response(METHOD_NOT_ALLOWED, "text/plain", METHOD_NOT_ALLOWED_BODY)
            }
            Some((_, path)) => {
                tracing::debug!(%peer, path, "unknown metrics path");
                http_response("404 Not Found", "text/plain", NOT_FOUND_BODY)
            }
            None => http_response("400 Bad Request", "text/plain", BAD_REQUEST_BODY),
        };
        if let Err(err) = socket.write_all(response.as_bytes()).await {
            tracing::debug!(%peer, error = %err, "metrics response write failed");
        }
    }
}

/// Method and target from the request line.
fn request_target(head: &str) -> Option<(&str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    Some((parts.next()?, parts.next()?))
}

fn is_metrics_path(target: &str) -> bool {
    target.split_once('?').map_or(target, |(path, _)| path) == METRICS_PATH
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\n\
         connection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_inf_bucket() {
        let t = Telemetry::new();
        t.record_claim("allocated");
        t.record_claim("allocated");
        t.record_claim("supply_exhausted");
        t.record_claim_latency_ms(3);
        t.record_claim_latency_ms(10_000);
        t.record_storage_failure("timeout");
        t.set_supply_minted(2);

        let text = t.render();
        assert!(text.contains("nnn_mint_claims_total{outcome=\"allocated\"} 2"));
        assert!(text.contains("nnn_mint_claims_total{outcome=\"supply_exhausted\"} 1"));
        assert!(text.contains("nnn_mint_claim_latency_ms_bucket{le=\"5\"} 1"));
        assert!(text.contains("nnn_mint_claim_latency_ms_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("nnn_mint_storage_failures_total{kind=\"timeout\"} 1"));
        assert!(text.contains("nnn_mint_supply_minted 2"));
        assert_eq!(t.claims_total("allocated"), 2);
    }

    async fn start_server(t: &Arc<Telemetry>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let reserve = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve");
        let addr = reserve.local_addr().expect("addr");
        drop(reserve);
        let handle = t.clone().spawn_metrics_server(addr).await.expect("server");
        (addr, handle)
    }

    async fn send(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(request).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[tokio::test]
    async fn metrics_server_serves_render_output() {
        let t = Arc::new(Telemetry::new());
        t.record_claim("allocated");
        let (addr, handle) = start_server(&t).await;

        let request = b"GET /metrics?scrape=1 HTTP/1.1\r\nhost: localhost\r\n\r\n";
        let response = send(addr, request).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("content-type: text/plain; version=0.0.4"));
        assert!(response.contains("nnn_mint_claims_total{outcome=\"allocated\"} 1"));
        handle.abort();
    }

    #[tokio::test]
    async fn metrics_server_rejects_other_paths_and_methods() {
        let t = Arc::new(Telemetry::new());
        t.record_claim("allocated");
        let (addr, handle) = start_server(&t).await;

        let missing = send(addr, b"GET /v1/mint HTTP/1.1\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404 Not Found"));
        assert!(missing.ends_with(NOT_FOUND_BODY));
        assert!(!missing.contains("nnn_mint_claims_total"));

        let post = send(addr, b"POST /metrics HTTP/1.1\r\n\r\n").await;
        assert!(post.starts_with("HTTP/1.1 405 Method Not Allowed"));

        let garbage = send(addr, b"GET\r\n\r\n").await;
        assert!(garbage.starts_with("HTTP/1.1 400 Bad Request"));
        handle.abort();
    }

    #[test]
    fn request_target_splits_the_request_line() {
        assert_eq!(
            request_target("GET /metrics HTTP/1.1\r\nhost: x\r\n"),
            Some(("GET", "/metrics"))
        );
        assert_eq!(request_target(""), None);
        assert!(is_metrics_path("/metrics?name[]=x"));
        assert!(!is_metrics_path("/metricsx"));
    }
}
