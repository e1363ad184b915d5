// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP Server
//!
//! Every path serves a trap page except the admin subtree, which exposes
//! statistics and metrics behind a token. Request bodies are capped and a
//! panicking handler answers 500 instead of dropping the connection.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error, warn};

use crate::admin_auth::AdminAuth;
use crate::content::PageGenerator;
use crate::metrics::TrapMetrics;
use crate::rate_limit::RateLimiter;
use crate::stats_manager::{ChartData, IncomingRequest, StatsManager};
use crate::storage::RequestRecord;

/// Tunables for the handlers.
#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub response_delay: Duration,
    pub top_items: usize,
    pub max_label_length: usize,
    pub recent_display: usize,
    pub max_body_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            response_delay: Duration::from_millis(350),
            top_items: 10,
            max_label_length: 50,
            recent_display: 50,
            max_body_bytes: 1 << 20,
        }
    }
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub limiter: Arc<RateLimiter>,
    pub stats: StatsManager,
    pub pages: Arc<PageGenerator>,
    pub metrics: TrapMetrics,
    pub admin: Arc<AdminAuth>,
    pub settings: HttpSettings,
}

/// Middleware requiring the admin token on every admin route.
async fn admin_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.admin.authorize(request.headers(), request.uri()) {
        debug!(path = %request.uri().path(), "Rejected admin request");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            "Unauthorized",
        )
            .into_response();
    }

    next.run(request).await
}

/// Content security policy for admin responses. They carry no markup of
/// their own, so nothing is allowed to load.
pub const ADMIN_CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";

/// Exchanges `?token=` for the session cookie and redirects to the overview.
async fn login_handler(State(state): State<HttpState>, uri: Uri) -> Response {
    match state.admin.login(&uri) {
        Some(cookie) => (
            StatusCode::SEE_OTHER,
            [
                (header::LOCATION, state.admin.path().to_string()),
                (header::SET_COOKIE, cookie),
            ],
        )
            .into_response(),
        None => {
            warn!("Rejected admin login with invalid or missing token");
            (
                StatusCode::FORBIDDEN,
                Html("Invalid or missing authentication token."),
            )
                .into_response()
        }
    }
}

/// Adds the browser hardening headers to every admin response.
fn with_security_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(ADMIN_CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic payload"
    };
    error!(panic = %detail, "Handler panicked");

    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Caps request bodies at `max_body_bytes` and turns handler panics into 500s.
fn harden(router: Router, max_body_bytes: usize) -> Router {
    router
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
}

/// Creates the router: admin routes under the admin path, trap everywhere else.
pub fn create_router(state: HttpState) -> Router {
    let protected = Router::new()
        .route("/", get(admin_overview_handler))
        .route("/data", get(chart_data_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));
    let admin = with_security_headers(
        Router::new()
            .route("/login", get(login_handler))
            .merge(protected),
    );

    let max_body_bytes = state.settings.max_body_bytes;
    let router = Router::new()
        .nest(state.admin.path(), admin)
        .fallback(trap_handler)
        .with_state(state);

    harden(router, max_body_bytes)
}

/// Serves a trap page to any admitted client.
async fn trap_handler(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let started = Instant::now();

    let client_key = state.stats.client_key(&headers, peer);
    let allowed = state.limiter.allow(&client_key);
    state.metrics.tracked_keys.set(state.limiter.tracked_keys() as i64);
    if !allowed {
        state.metrics.rate_limited.inc();
        debug!(client = %client_key, "Rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    record(&state, peer, headers, uri.path().to_string()).await;

    // Dropping the connection drops this future, which ends the wait early.
    tokio::time::sleep(state.settings.response_delay).await;

    let page = state.pages.generate_page();
    state.metrics.requests_total.inc();
    state
        .metrics
        .response_duration
        .observe(started.elapsed().as_secs_f64());

    Html(page).into_response()
}

/// Records the request off the async runtime.
///
/// The token is cancelled if the handler is dropped mid-write, so an
/// abandoned request leaves nothing half-recorded.
async fn record(state: &HttpState, peer: SocketAddr, headers: HeaderMap, path: String) {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let stats = state.stats.clone();

    let result = tokio::task::spawn_blocking(move || {
        stats.record_request(
            &cancel,
            IncomingRequest {
                peer,
                headers: &headers,
                path: &path,
            },
        )
    })
    .await;
    guard.disarm();

    match result {
        Ok(Ok(())) => {}
        Ok(Err(_)) => state.metrics.record_failures.inc(),
        Err(e) => {
            warn!(error = %e, "Recording task failed");
            state.metrics.record_failures.inc();
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsView {
    uptime_secs: u64,
    total_requests: u64,
    unique_ips: usize,
    unique_user_agents: usize,
}

#[derive(Debug, Serialize)]
struct OverviewView {
    stats: StatsView,
    charts: ChartData,
    recent_requests: Vec<RequestRecord>,
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Statistics unavailable").into_response()
}

async fn admin_overview_handler(State(state): State<HttpState>) -> Response {
    let settings = state.settings;
    let stats = state.stats.clone();

    let overview = tokio::task::spawn_blocking(move || {
        let cancel = CancellationToken::new();
        let traffic = stats.stats(&cancel)?;
        let charts = stats.chart_data(&cancel, settings.top_items, settings.max_label_length)?;
        let recent_requests = stats.recent_requests(&cancel, settings.recent_display)?;
        Ok::<_, crate::error::StatsError>(OverviewView {
            stats: StatsView {
                uptime_secs: traffic.uptime.as_secs(),
                total_requests: traffic.total_requests,
                unique_ips: traffic.unique_client_keys,
                unique_user_agents: traffic.unique_user_agents,
            },
            charts,
            recent_requests,
        })
    })
    .await;

    match overview {
        Ok(Ok(view)) => Json(view).into_response(),
        _ => unavailable(),
    }
}

async fn chart_data_handler(State(state): State<HttpState>) -> Response {
    let settings = state.settings;
    let stats = state.stats.clone();

    let charts = tokio::task::spawn_blocking(move || {
        stats.chart_data(
            &CancellationToken::new(),
            settings.top_items,
            settings.max_label_length,
        )
    })
    .await;

    match charts {
        Ok(Ok(data)) => Json(data).into_response(),
        _ => unavailable(),
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}
