// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for spider trap integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use spider_trap::admin_auth::AdminAuth;
use spider_trap::content::PageGenerator;
use spider_trap::http::{create_router, HttpSettings, HttpState};
use spider_trap::ip_resolver::IpResolver;
use spider_trap::metrics::TrapMetrics;
use spider_trap::rate_limit::RateLimiter;
use spider_trap::stats_manager::StatsManager;
use spider_trap::storage::StatsStore;

pub const ADMIN_PATH: &str = "/integration-admin";
pub const ADMIN_TOKEN: &str = "integration-token";

/// Builds handler state over `store` with no response delay.
#[allow(dead_code)]
pub fn create_test_state(
    store: Arc<dyn StatsStore>,
    rate_per_sec: f64,
    burst: u32,
    trust_proxy: bool,
) -> HttpState {
    HttpState {
        limiter: Arc::new(RateLimiter::new(rate_per_sec, burst, 1_000)),
        stats: StatsManager::new(store, IpResolver::new(trust_proxy)),
        pages: Arc::new(PageGenerator::default()),
        metrics: TrapMetrics::new(),
        admin: Arc::new(AdminAuth::new(ADMIN_PATH, ADMIN_TOKEN)),
        settings: HttpSettings {
            response_delay: Duration::ZERO,
            ..HttpSettings::default()
        },
    }
}

/// Serves `state` on an ephemeral localhost port.
#[allow(dead_code)]
pub async fn start_server(state: HttpState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    addr
}

/// Minimal HTTP/1.1 GET. Returns the status code and body.
#[allow(dead_code)]
pub async fn http_get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> (u16, String) {
    let (status, _, body) = http_get_with_headers(addr, path, headers).await;
    (status, body)
}

/// Like [`http_get`], also returning the response headers with lowercased
/// names.
#[allow(dead_code)]
pub async fn http_get_with_headers(
    addr: SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> (u16, Vec<(String, String)>, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", path, addr);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();

    let text = String::from_utf8_lossy(&response).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("missing status line");
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
    let response_headers = head
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    (status, response_headers, body.to_string())
}
