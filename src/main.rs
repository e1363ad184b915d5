// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Spider Trap Server
//!
//! An HTTP honeypot that feeds web crawlers endless pages of generated links.
//! Provides:
//! - Trap pages on every path, served slowly and rate limited per client
//! - Request statistics in SQLite or a bounded in-memory store
//! - Token-protected admin endpoints for statistics and Prometheus metrics

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use spider_trap::admin_auth::AdminAuth;
use spider_trap::config::TrapConfig;
use spider_trap::content::{load_wordlist, PageGenerator};
use spider_trap::http::{create_router, HttpSettings, HttpState};
use spider_trap::ip_resolver::IpResolver;
use spider_trap::metrics::TrapMetrics;
use spider_trap::rate_limit::RateLimiter;
use spider_trap::stats_manager::StatsManager;
use spider_trap::storage::{create_stats_store, StatsFlusher};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("spider_trap=info")),
        )
        .init();

    let config = TrapConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    info!("Starting Spider Trap v{}", env!("CARGO_PKG_VERSION"));
    info!("Listen address: {}", config.listen_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!(
        "Rate limit: {}/s, burst {}",
        config.rate_limit_per_sec, config.rate_limit_burst
    );
    if config.trust_proxy {
        info!("Trusting X-Forwarded-For / X-Real-IP headers");
    }

    let wordlist = match &config.wordlist_path {
        Some(path) => match load_wordlist(path) {
            Ok(words) if words.is_empty() => {
                warn!(file = %path.display(), "Wordlist is empty, using random links");
                words
            }
            Ok(words) => {
                info!(file = %path.display(), entries = words.len(), "Loaded wordlist");
                words
            }
            Err(e) => {
                error!(error = %e, "Failed to load wordlist");
                return ExitCode::FAILURE;
            }
        },
        None => Vec::new(),
    };

    // Legacy files are migrated (SQLite) or the snapshot loaded (memory) here
    let store = match tokio::task::spawn_blocking({
        let backend = config.storage_backend;
        let data_dir = config.data_dir.clone();
        let limits = config.memory_limits();
        move || create_stats_store(backend, Some(&data_dir), limits)
    })
    .await
    {
        Ok(Ok(store)) => store,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to open stats storage");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "Storage initialization task failed");
            return ExitCode::FAILURE;
        }
    };

    let admin = match AdminAuth::generate() {
        Ok(admin) => Arc::new(admin.with_secure_cookie(config.secure_cookie)),
        Err(e) => {
            error!(error = %e, "Failed to generate admin credentials");
            return ExitCode::FAILURE;
        }
    };

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_sec,
        config.rate_limit_burst,
        config.max_tracked_keys,
    ));
    let sweeper = limiter.spawn_sweeper(config.sweep_interval());

    let flusher = store
        .requires_flush()
        .then(|| StatsFlusher::spawn(store.clone(), config.flush_interval()));

    let state = HttpState {
        limiter: limiter.clone(),
        stats: StatsManager::new(store.clone(), IpResolver::new(config.trust_proxy)),
        pages: Arc::new(PageGenerator::new(wordlist, config.form_endpoint.clone())),
        metrics: TrapMetrics::new(),
        admin: admin.clone(),
        settings: HttpSettings {
            response_delay: config.response_delay(),
            top_items: config.top_items,
            max_label_length: config.max_label_length,
            recent_display: config.recent_display,
            max_body_bytes: config.max_body_bytes,
        },
    };

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };

    let base = format!("http://localhost:{}", config.listen_addr.port());
    info!("Admin login: {}", admin.login_url(&base));
    info!("HTTP server listening on {}", config.listen_addr);

    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    limiter.stop();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Rate limiter sweep task failed");
    }
    if let Some(flusher) = flusher {
        flusher.shutdown().await;
    }

    match served {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "HTTP server error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
