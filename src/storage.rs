// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Statistics Storage
//!
//! Storage backends for recorded requests and their aggregates.
//! Supports both a bounded in-memory store (snapshotted to disk periodically)
//! and SQLite (every request committed in its own transaction).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::aggregate::CountEntry;
pub use crate::memory_store::{MemoryLimits, MemoryStatsStore};
pub use crate::sqlite_store::SqliteStatsStore;

use crate::error::StatsError;
use crate::migration;

/// User agent recorded when a request carries none.
pub const UNKNOWN_USER_AGENT: &str = "Unknown";

/// File name of the SQLite database inside the data directory.
pub const DATABASE_FILE_NAME: &str = "spidertrap.db";
/// Line-delimited request log, appended by the in-memory backend and imported
/// into SQLite on startup.
pub const REQUESTS_LOG_FILE_NAME: &str = "requests.ndjson";
/// Aggregate snapshot; also the in-memory store's flush target.
pub const SNAPSHOT_FILE_NAME: &str = "stats.json";

/// A single recorded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(rename = "IP")]
    pub client_key: String,
    #[serde(rename = "UserAgent")]
    pub user_agent: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl RequestRecord {
    /// Creates a record, substituting [`UNKNOWN_USER_AGENT`] for a blank agent.
    pub fn new(
        client_key: impl Into<String>,
        user_agent: Option<&str>,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let user_agent = user_agent
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .unwrap_or(UNKNOWN_USER_AGENT);

        RequestRecord {
            client_key: client_key.into(),
            user_agent: user_agent.to_string(),
            path: path.into(),
            timestamp,
        }
    }
}

/// Totals kept by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSummary {
    pub start_time: DateTime<Utc>,
    pub total_requests: u64,
    pub unique_client_keys: usize,
    pub unique_user_agents: usize,
}

/// On-disk snapshot of the aggregates (`stats.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStats {
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ip_counts: HashMap<String, u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_agents: HashMap<String, u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub recent_requests: Vec<RequestRecord>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Returns `Err(Cancelled)` once `cancel` has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<(), StatsError> {
    if cancel.is_cancelled() {
        Err(StatsError::Cancelled)
    } else {
        Ok(())
    }
}

/// Trait for statistics storage backends.
///
/// Every operation takes a cancellation token. A cancelled operation returns
/// [`StatsError::Cancelled`] and leaves no partial state behind.
pub trait StatsStore: Send + Sync {
    /// Records one request: appends it to the request log and folds it into
    /// the per-key and per-user-agent aggregates and the total.
    fn record(&self, cancel: &CancellationToken, record: &RequestRecord)
        -> Result<(), StatsError>;

    /// Returns start time, total requests and aggregate cardinalities.
    fn summary(&self, cancel: &CancellationToken) -> Result<StatsSummary, StatsError>;

    /// Returns at most `limit` records, most recent first.
    fn recent_requests(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StatsError>;

    /// Returns the `limit` most active client keys, highest count first.
    fn top_client_keys(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError>;

    /// Returns the `limit` most common user agents, highest count first.
    fn top_user_agents(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError>;

    /// Whether this backend relies on periodic [`StatsStore::flush`] calls
    /// for durability.
    fn requires_flush(&self) -> bool {
        false
    }

    /// Persists buffered state. A no-op for backends that write through.
    fn flush(&self) -> Result<(), StatsError> {
        Ok(())
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Bounded in-memory storage, snapshotted to `stats.json`.
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// A storage backend name other than `memory` or `sqlite`.
#[derive(Debug, thiserror::Error)]
#[error("unknown storage backend: {0}")]
pub struct UnknownBackend(pub String);

impl std::str::FromStr for StorageBackend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Creates a stats store based on the backend type.
///
/// For SQLite, legacy flat files in `data_dir` are migrated into the new
/// database first. For memory, an existing snapshot is loaded. With no data
/// directory the SQLite store lives in memory and the memory store is never
/// written to disk.
pub fn create_stats_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
    limits: MemoryLimits,
) -> Result<Arc<dyn StatsStore>, StatsError> {
    if let Some(dir) = data_dir {
        std::fs::create_dir_all(dir)?;
    }

    match backend {
        StorageBackend::Memory => {
            let store = match data_dir {
                Some(dir) => MemoryStatsStore::with_snapshot(limits, dir.join(SNAPSHOT_FILE_NAME))
                    .with_request_log(&dir.join(REQUESTS_LOG_FILE_NAME))?,
                None => MemoryStatsStore::new(limits),
            };
            match store.load_snapshot() {
                Ok(true) => info!("Loaded existing stats snapshot"),
                Ok(false) => debug!("No stats snapshot to load"),
                // A corrupt snapshot must not keep the trap from starting
                Err(e) => warn!(error = %e, "Failed to load stats snapshot"),
            }
            Ok(Arc::new(store))
        }
        StorageBackend::Sqlite => {
            let store = match data_dir {
                Some(dir) => SqliteStatsStore::open(dir.join(DATABASE_FILE_NAME))?,
                None => SqliteStatsStore::in_memory()?,
            };
            if let Some(dir) = data_dir {
                match migration::migrate_legacy_files(&store, dir, &CancellationToken::new()) {
                    Ok(report) if report.is_empty() => {}
                    Ok(report) => info!(
                        imported = report.imported,
                        skipped = report.skipped,
                        "Migrated legacy request files"
                    ),
                    Err(e) => warn!(error = %e, "Legacy file migration failed"),
                }
            }
            Ok(Arc::new(store))
        }
    }
}

/// Returns the snapshot path used by the memory backend for `data_dir`.
pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_FILE_NAME)
}

// ============================================================================
// Periodic Flush
// ============================================================================

/// Background task that periodically calls [`StatsStore::flush`].
///
/// Stopping triggers one final flush before the task exits.
pub struct StatsFlusher {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatsFlusher {
    /// Spawns the flush loop on the current tokio runtime.
    pub fn spawn(store: Arc<dyn StatsStore>, interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = flush_blocking(store.clone()).await {
                            warn!(error = %e, "Failed to save stats periodically");
                        }
                    }
                    _ = token.cancelled() => {
                        if let Err(e) = flush_blocking(store.clone()).await {
                            warn!(error = %e, "Failed to save stats on shutdown");
                        }
                        debug!("Stats flusher stopped");
                        break;
                    }
                }
            }
        });

        StatsFlusher { shutdown, handle }
    }

    /// Signals the flusher to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stops the flusher and waits for its final flush.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Stats flusher task failed");
        }
    }
}

async fn flush_blocking(store: Arc<dyn StatsStore>) -> Result<(), StatsError> {
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(result) => result,
        Err(e) => Err(StatsError::Io(std::io::Error::other(e))),
    }
}

// ============================================================================
// Tests
// ============================================================================
