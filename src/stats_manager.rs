// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Stats Manager
//!
//! Backend-agnostic entry point for recording requests and reading the
//! aggregates back out. The concrete [`StatsStore`] is chosen once at startup
//! and injected here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::CountEntry;
use crate::error::StatsError;
use crate::ip_resolver::IpResolver;
use crate::storage::{RequestRecord, StatsStore};

/// Marker appended to truncated chart labels.
pub const ELLIPSIS: &str = "...";

/// The parts of an HTTP request the statistics care about.
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest<'a> {
    pub peer: SocketAddr,
    pub headers: &'a HeaderMap,
    pub path: &'a str,
}

/// Uptime, totals and cardinalities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficStats {
    pub uptime: Duration,
    pub total_requests: u64,
    pub unique_client_keys: usize,
    pub unique_user_agents: usize,
}

/// One ranked series for a chart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub data: Vec<u64>,
}

impl ChartSeries {
    fn from_entries(entries: Vec<CountEntry>, max_label_length: Option<usize>) -> Self {
        let mut series = ChartSeries::default();
        for entry in entries {
            let label = match max_label_length {
                Some(max_len) => truncate_label(&entry.label, max_len),
                None => entry.label,
            };
            series.labels.push(label);
            series.data.push(entry.count);
        }
        series
    }
}

/// Top client keys and top user agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChartData {
    #[serde(rename = "topIPs")]
    pub top_client_keys: ChartSeries,
    #[serde(rename = "topUserAgents")]
    pub top_user_agents: ChartSeries,
}

/// Shortens `label` to exactly `max_len` characters ending in [`ELLIPSIS`]
/// when it is longer than `max_len`.
pub fn truncate_label(label: &str, max_len: usize) -> String {
    if label.chars().count() <= max_len {
        return label.to_string();
    }
    if max_len <= ELLIPSIS.len() {
        return ELLIPSIS[..max_len].to_string();
    }

    let mut truncated: String = label.chars().take(max_len - ELLIPSIS.len()).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Records requests and serves aggregate queries over one store.
#[derive(Clone)]
pub struct StatsManager {
    store: Arc<dyn StatsStore>,
    resolver: IpResolver,
}

impl StatsManager {
    pub fn new(store: Arc<dyn StatsStore>, resolver: IpResolver) -> Self {
        StatsManager { store, resolver }
    }

    /// Resolves the client key for a request.
    pub fn client_key(&self, headers: &HeaderMap, peer: SocketAddr) -> String {
        self.resolver.client_key(headers, peer)
    }

    /// Records one request.
    ///
    /// The user agent defaults to `Unknown` and the timestamp is taken now.
    pub fn record_request(
        &self,
        cancel: &CancellationToken,
        request: IncomingRequest<'_>,
    ) -> Result<(), StatsError> {
        let client_key = self.resolver.client_key(request.headers, request.peer);
        let user_agent = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());

        let record = RequestRecord::new(client_key, user_agent, request.path, Utc::now());
        self.store
            .record(cancel, &record)
            .inspect_err(|e| log_failure("record request", e))
    }

    /// Returns uptime, total requests and unique key / user agent counts.
    pub fn stats(&self, cancel: &CancellationToken) -> Result<TrafficStats, StatsError> {
        let summary = self
            .store
            .summary(cancel)
            .inspect_err(|e| log_failure("read stats", e))?;

        let uptime = (Utc::now() - summary.start_time)
            .to_std()
            .unwrap_or_default();

        Ok(TrafficStats {
            uptime,
            total_requests: summary.total_requests,
            unique_client_keys: summary.unique_client_keys,
            unique_user_agents: summary.unique_user_agents,
        })
    }

    /// Returns at most `limit` requests, most recent first.
    pub fn recent_requests(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StatsError> {
        self.store
            .recent_requests(cancel, limit)
            .inspect_err(|e| log_failure("read recent requests", e))
    }

    /// Returns the `top_n` client keys and user agents by count. User agent
    /// labels are truncated to `max_label_length` characters; client keys are
    /// returned whole.
    pub fn chart_data(
        &self,
        cancel: &CancellationToken,
        top_n: usize,
        max_label_length: usize,
    ) -> Result<ChartData, StatsError> {
        let top_keys = self
            .store
            .top_client_keys(cancel, top_n)
            .inspect_err(|e| log_failure("read top client keys", e))?;
        let top_agents = self
            .store
            .top_user_agents(cancel, top_n)
            .inspect_err(|e| log_failure("read top user agents", e))?;

        Ok(ChartData {
            top_client_keys: ChartSeries::from_entries(top_keys, None),
            top_user_agents: ChartSeries::from_entries(top_agents, Some(max_label_length)),
        })
    }
}

fn log_failure(operation: &str, error: &StatsError) {
    if error.is_cancelled() {
        debug!(operation, "Stats operation cancelled");
    } else {
        warn!(operation, error = %error, "Stats operation failed");
    }
}
