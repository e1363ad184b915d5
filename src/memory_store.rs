// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded In-Memory Statistics
//!
//! All state sits behind one `RwLock`: request recording takes the write
//! lock, dashboard reads take the read lock. Aggregate cardinality and the
//! recent-request window are capped. Aggregates are made durable by periodic
//! snapshots written to `stats.json`; every request is also appended to
//! `requests.ndjson` so a later switch to SQLite can import the full history.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::aggregate::{CountAggregate, CountEntry};
use crate::error::StatsError;
use crate::storage::{
    ensure_active, PersistedStats, RequestRecord, StatsStore, StatsSummary,
};

/// Capacity limits for the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Maximum distinct client keys tracked.
    pub max_client_keys: usize,
    /// Maximum distinct user agents tracked.
    pub max_user_agents: usize,
    /// Size of the recent-request window.
    pub max_recent_requests: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        MemoryLimits {
            max_client_keys: 10_000,
            max_user_agents: 1_000,
            max_recent_requests: 100,
        }
    }
}

struct MemoryStats {
    start_time: DateTime<Utc>,
    total_requests: u64,
    client_keys: CountAggregate,
    user_agents: CountAggregate,
    recent: VecDeque<RequestRecord>,
}

impl MemoryStats {
    fn new(limits: &MemoryLimits) -> Self {
        MemoryStats {
            start_time: Utc::now(),
            total_requests: 0,
            client_keys: CountAggregate::new(limits.max_client_keys),
            user_agents: CountAggregate::new(limits.max_user_agents),
            recent: VecDeque::with_capacity(limits.max_recent_requests),
        }
    }
}

/// In-memory statistics with bounded growth.
pub struct MemoryStatsStore {
    state: RwLock<MemoryStats>,
    limits: MemoryLimits,
    snapshot_path: Option<PathBuf>,
    request_log: Option<Mutex<File>>,
}

impl MemoryStatsStore {
    /// Creates an empty store that is never written to disk.
    pub fn new(limits: MemoryLimits) -> Self {
        MemoryStatsStore {
            state: RwLock::new(MemoryStats::new(&limits)),
            limits,
            snapshot_path: None,
            request_log: None,
        }
    }

    /// Creates an empty store that flushes to `path`.
    ///
    /// Call [`MemoryStatsStore::load_snapshot`] to warm-start from it.
    pub fn with_snapshot(limits: MemoryLimits, path: impl Into<PathBuf>) -> Self {
        MemoryStatsStore {
            snapshot_path: Some(path.into()),
            ..Self::new(limits)
        }
    }

    /// Appends every recorded request to the line-delimited log at `path`,
    /// creating the file if needed.
    pub fn with_request_log(mut self, path: &Path) -> Result<Self, StatsError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.request_log = Some(Mutex::new(file));
        Ok(self)
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryStats> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryStats> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies the current state into its serializable form.
    pub fn to_persisted(&self) -> PersistedStats {
        let state = self.read();
        PersistedStats {
            start_time: state.start_time,
            total_requests: state.total_requests,
            ip_counts: state.client_keys.to_counts(),
            user_agents: state.user_agents.to_counts(),
            recent_requests: state.recent.iter().cloned().collect(),
        }
    }

    /// Replaces the aggregates with a snapshot's contents.
    ///
    /// The current start time is kept. Counts are inserted heaviest first so
    /// that a snapshot larger than the configured ceilings keeps its most
    /// active keys.
    pub fn restore(&self, persisted: PersistedStats) {
        let mut restored = MemoryStats::new(&self.limits);
        let mut state = self.write();
        restored.start_time = state.start_time;
        restored.total_requests = persisted.total_requests;

        let seen_at = persisted.start_time;
        for (key, count) in ranked(persisted.ip_counts) {
            restored.client_keys.add(&key, count, seen_at);
        }
        for (ua, count) in ranked(persisted.user_agents) {
            restored.user_agents.add(&ua, count, seen_at);
        }

        let skip = persisted
            .recent_requests
            .len()
            .saturating_sub(self.limits.max_recent_requests);
        restored.recent = persisted.recent_requests.into_iter().skip(skip).collect();

        *state = restored;
    }

    /// Loads the snapshot file if one exists.
    ///
    /// Returns `Ok(false)` when there is no snapshot path or no file.
    pub fn load_snapshot(&self) -> Result<bool, StatsError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(false);
        };

        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let persisted: PersistedStats = serde_json::from_slice(&data)?;
        self.restore(persisted);
        Ok(true)
    }

    /// Writes the snapshot file, replacing any previous one atomically.
    pub fn save_snapshot(&self) -> Result<(), StatsError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        // Serialize from a copy so the lock is not held during I/O
        let persisted = self.to_persisted();
        let data = serde_json::to_vec_pretty(&persisted)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn append_to_log(&self, record: &RequestRecord) {
        let Some(log) = &self.request_log else {
            return;
        };

        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode request log entry");
                return;
            }
        };
        line.push(b'\n');

        let mut file = log.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = file.write_all(&line) {
            // The aggregates already hold the request
            warn!(error = %e, "Failed to append to request log");
        }
    }

    /// Returns the current count for a client key, if tracked.
    pub fn client_key_count(&self, key: &str) -> Option<u64> {
        self.read().client_keys.count(key)
    }

    /// Returns the current count for a user agent, if tracked.
    pub fn user_agent_count(&self, user_agent: &str) -> Option<u64> {
        self.read().user_agents.count(user_agent)
    }
}

fn ranked(counts: std::collections::HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

impl StatsStore for MemoryStatsStore {
    fn record(
        &self,
        cancel: &CancellationToken,
        record: &RequestRecord,
    ) -> Result<(), StatsError> {
        ensure_active(cancel)?;
        {
            let mut state = self.write();
            ensure_active(cancel)?;

            state.total_requests += 1;
            state
                .client_keys
                .increment(&record.client_key, record.timestamp);
            state
                .user_agents
                .increment(&record.user_agent, record.timestamp);

            state.recent.push_back(record.clone());
            while state.recent.len() > self.limits.max_recent_requests {
                state.recent.pop_front();
            }
        }

        self.append_to_log(record);
        Ok(())
    }

    fn summary(&self, cancel: &CancellationToken) -> Result<StatsSummary, StatsError> {
        ensure_active(cancel)?;
        let state = self.read();
        ensure_active(cancel)?;

        Ok(StatsSummary {
            start_time: state.start_time,
            total_requests: state.total_requests,
            unique_client_keys: state.client_keys.len(),
            unique_user_agents: state.user_agents.len(),
        })
    }

    fn recent_requests(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StatsError> {
        ensure_active(cancel)?;
        let state = self.read();
        ensure_active(cancel)?;

        Ok(state.recent.iter().rev().take(limit).cloned().collect())
    }

    fn top_client_keys(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError> {
        ensure_active(cancel)?;
        let state = self.read();
        ensure_active(cancel)?;

        Ok(state.client_keys.top(limit))
    }

    fn top_user_agents(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError> {
        ensure_active(cancel)?;
        let state = self.read();
        ensure_active(cancel)?;

        Ok(state.user_agents.top(limit))
    }

    fn requires_flush(&self) -> bool {
        true
    }

    fn flush(&self) -> Result<(), StatsError> {
        self.save_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, ua: &str, secs: i64) -> RequestRecord {
        let ts = DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap();
        RequestRecord::new(key, Some(ua), "/", ts)
    }

    fn limits(keys: usize, uas: usize, recent: usize) -> MemoryLimits {
        MemoryLimits {
            max_client_keys: keys,
            max_user_agents: uas,
            max_recent_requests: recent,
        }
    }

    #[test]
    fn test_key_ceiling_scenario() {
        let store = MemoryStatsStore::new(limits(2, 100, 100));
        let cancel = CancellationToken::new();

        for (i, key) in ["A", "B", "C", "A"].iter().enumerate() {
            store.record(&cancel, &record(key, "bot", i as i64)).unwrap();
        }

        let summary = store.summary(&cancel).unwrap();
        assert_eq!(summary.unique_client_keys, 2);
        assert_eq!(summary.total_requests, 4);
        assert_eq!(store.client_key_count("A"), Some(2));
        assert_eq!(store.client_key_count("B"), Some(1));
        assert_eq!(store.client_key_count("C"), None);
    }

    #[test]
    fn test_ceilings_are_independent() {
        let store = MemoryStatsStore::new(limits(10, 1, 100));
        let cancel = CancellationToken::new();

        store.record(&cancel, &record("A", "ua-1", 0)).unwrap();
        store.record(&cancel, &record("B", "ua-2", 1)).unwrap();
        store.record(&cancel, &record("C", "ua-1", 2)).unwrap();

        let summary = store.summary(&cancel).unwrap();
        assert_eq!(summary.unique_client_keys, 3);
        assert_eq!(summary.unique_user_agents, 1);
        assert_eq!(store.user_agent_count("ua-1"), Some(2));
        assert_eq!(store.user_agent_count("ua-2"), None);
    }

    #[test]
    fn test_recent_window_is_fifo() {
        let store = MemoryStatsStore::new(limits(10, 10, 3));
        let cancel = CancellationToken::new();

        for i in 0..5 {
            store
                .record(&cancel, &record(&format!("k{}", i), "bot", i))
                .unwrap();
        }

        let recent = store.recent_requests(&cancel, 10).unwrap();
        let keys: Vec<&str> = recent.iter().map(|r| r.client_key.as_str()).collect();
        assert_eq!(keys, vec!["k4", "k3", "k2"]);
    }

    #[test]
    fn test_top_tie_break_is_insertion_order() {
        let store = MemoryStatsStore::new(MemoryLimits::default());
        let cancel = CancellationToken::new();

        for (i, key) in ["c", "a", "b"].iter().enumerate() {
            store.record(&cancel, &record(key, "bot", i as i64)).unwrap();
        }

        let top = store.top_client_keys(&cancel, 3).unwrap();
        let labels: Vec<&str> = top.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let cancel = CancellationToken::new();

        {
            let store = MemoryStatsStore::with_snapshot(MemoryLimits::default(), &path);
            store.record(&cancel, &record("A", "bot", 0)).unwrap();
            store.record(&cancel, &record("A", "bot", 1)).unwrap();
            store.record(&cancel, &record("B", "crawler", 2)).unwrap();
            store.save_snapshot().unwrap();
        }

        let store = MemoryStatsStore::with_snapshot(MemoryLimits::default(), &path);
        assert!(store.load_snapshot().unwrap());

        let summary = store.summary(&cancel).unwrap();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(store.client_key_count("A"), Some(2));
        assert_eq!(store.user_agent_count("crawler"), Some(1));

        let recent = store.recent_requests(&cancel, 1).unwrap();
        assert_eq!(recent[0].client_key, "B");
    }

    #[test]
    fn test_restore_honours_ceilings() {
        let store = MemoryStatsStore::new(limits(2, 10, 2));
        let mut persisted = PersistedStats {
            start_time: Utc::now(),
            total_requests: 10,
            ip_counts: Default::default(),
            user_agents: Default::default(),
            recent_requests: (0..5).map(|i| record("x", "bot", i)).collect(),
        };
        persisted.ip_counts.insert("light".into(), 1);
        persisted.ip_counts.insert("heavy".into(), 6);
        persisted.ip_counts.insert("medium".into(), 3);

        store.restore(persisted);

        assert_eq!(store.client_key_count("heavy"), Some(6));
        assert_eq!(store.client_key_count("medium"), Some(3));
        assert_eq!(store.client_key_count("light"), None);

        let cancel = CancellationToken::new();
        let recent = store.recent_requests(&cancel, 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, record("x", "bot", 4).timestamp);
    }

    #[test]
    fn test_missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MemoryStatsStore::with_snapshot(MemoryLimits::default(), dir.path().join("none.json"));
        assert!(!store.load_snapshot().unwrap());
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = MemoryStatsStore::with_snapshot(MemoryLimits::default(), &path);
        assert!(matches!(
            store.load_snapshot(),
            Err(StatsError::Serialization(_))
        ));
    }

    #[test]
    fn test_request_log_appends_one_line_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.ndjson");
        std::fs::write(&path, "").unwrap();
        let cancel = CancellationToken::new();

        let store = MemoryStatsStore::new(limits(1, 1, 1))
            .with_request_log(&path)
            .unwrap();
        store.record(&cancel, &record("A", "bot", 0)).unwrap();
        store.record(&cancel, &record("B", "crawler", 1)).unwrap();
        drop(store);

        // Ceilings cap the aggregates, not the log
        let reopened = MemoryStatsStore::new(MemoryLimits::default())
            .with_request_log(&path)
            .unwrap();
        reopened.record(&cancel, &record("C", "bot", 2)).unwrap();

        let logged: Vec<RequestRecord> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let keys: Vec<&str> = logged.iter().map(|r| r.client_key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert_eq!(logged[1].user_agent, "crawler");
    }

    #[test]
    fn test_cancelled_record_is_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.ndjson");
        let store = MemoryStatsStore::new(MemoryLimits::default())
            .with_request_log(&path)
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(store.record(&cancel, &record("A", "bot", 0)).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_concurrent_recording() {
        let store = std::sync::Arc::new(MemoryStatsStore::new(MemoryLimits::default()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let cancel = CancellationToken::new();
                    for i in 0..250 {
                        store
                            .record(&cancel, &record(&format!("k{}", i % 10), &format!("ua{}", t), i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let cancel = CancellationToken::new();
        let summary = store.summary(&cancel).unwrap();
        assert_eq!(summary.total_requests, 1000);
        assert_eq!(summary.unique_client_keys, 10);
        assert_eq!(summary.unique_user_agents, 4);
    }
}
