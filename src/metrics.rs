// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics for the Spider Trap
//!
//! Counters for trapped traffic, served on the admin metrics endpoint.

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Spider trap metrics.
#[derive(Clone)]
pub struct TrapMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,
    /// Trap requests admitted and served.
    pub requests_total: IntCounter,
    /// Trap requests refused with 429.
    pub rate_limited: IntCounter,
    /// Requests whose recording failed.
    pub record_failures: IntCounter,
    /// Client keys currently held by the rate limiter.
    pub tracked_keys: IntGauge,
    /// Time to produce a trap response, including the deliberate delay.
    pub response_duration: Histogram,
}

// Names and help texts are static, so registration only fails on duplicates.
fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric registered twice");
    collector
}

impl TrapMetrics {
    /// Creates a new metrics instance with all collectors registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "trap_requests_total",
                "Total trap requests served",
            ))
            .expect("valid metric"),
        );

        let rate_limited = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "trap_rate_limited_total",
                "Total trap requests rejected by the rate limiter",
            ))
            .expect("valid metric"),
        );

        let record_failures = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "trap_record_failures_total",
                "Total requests that could not be recorded",
            ))
            .expect("valid metric"),
        );

        let tracked_keys = register(
            &registry,
            IntGauge::with_opts(Opts::new(
                "trap_tracked_keys",
                "Client keys currently tracked by the rate limiter",
            ))
            .expect("valid metric"),
        );

        let response_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "trap_response_duration_seconds",
                    "Trap response duration in seconds",
                )
                .buckets(vec![0.05, 0.1, 0.25, 0.35, 0.5, 1.0, 2.5, 5.0]),
            )
            .expect("valid metric"),
        );

        TrapMetrics {
            registry: Arc::new(registry),
            requests_total,
            rate_limited,
            record_failures,
            tracked_keys,
            response_duration,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for TrapMetrics {
    fn default() -> Self {
        Self::new()
    }
}
