// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SQLite Counter Store
//!
//! Durable statistics. Each recorded request is one transaction over four
//! tables: the append-only request log, the per-IP and per-user-agent
//! aggregates, and the singleton summary row. A single connection behind a
//! mutex is the only writer.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::aggregate::CountEntry;
use crate::error::StatsError;
use crate::storage::{ensure_active, RequestRecord, StatsStore, StatsSummary};

/// Column limits mirrored by the schema's CHECK constraints.
const MAX_IP_LEN: usize = 45;
const MAX_USER_AGENT_LEN: usize = 512;
const MAX_PATH_LEN: usize = 2048;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stats (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    start_time TIMESTAMP NOT NULL,
    total_requests INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS ip_counts (
    ip TEXT PRIMARY KEY CHECK(length(ip) <= 45 AND length(ip) > 0),
    count INTEGER NOT NULL DEFAULT 1 CHECK(count > 0),
    first_seen TIMESTAMP NOT NULL,
    last_seen TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ip_count ON ip_counts(count DESC);

CREATE TABLE IF NOT EXISTS user_agent_counts (
    user_agent TEXT PRIMARY KEY CHECK(length(user_agent) <= 512 AND length(user_agent) > 0),
    count INTEGER NOT NULL DEFAULT 1 CHECK(count > 0),
    first_seen TIMESTAMP NOT NULL,
    last_seen TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ua_count ON user_agent_counts(count DESC);

CREATE TABLE IF NOT EXISTS request_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT NOT NULL CHECK(length(ip) <= 45 AND length(ip) > 0),
    user_agent TEXT CHECK(user_agent IS NULL OR length(user_agent) <= 512),
    path TEXT CHECK(path IS NULL OR length(path) <= 2048),
    timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_request_timestamp ON request_log(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_request_ip ON request_log(ip);
";

/// SQLite-backed persistent statistics.
pub struct SqliteStatsStore {
    conn: Mutex<Connection>,
}

impl SqliteStatsStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StatsError> {
        let conn = Connection::open(path.as_ref())?;

        // WAL lets other connections (an operator's sqlite3 shell) read while the trap writes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute_batch(SCHEMA)?;

        conn.execute(
            "INSERT OR IGNORE INTO stats (id, start_time, total_requests) VALUES (1, ?1, 0)",
            params![Utc::now()],
        )?;

        debug!(path = %path.as_ref().display(), "Stats database initialized");

        Ok(SqliteStatsStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for tests and diskless runs).
    pub fn in_memory() -> Result<Self, StatsError> {
        Self::open(":memory:")
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the recorded start time back to `start_time` if it is earlier.
    ///
    /// Returns true if the row changed.
    pub fn adopt_earlier_start_time(&self, start_time: DateTime<Utc>) -> Result<bool, StatsError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE stats SET start_time = ?1 WHERE id = 1 AND start_time > ?1",
            params![start_time],
        )?;
        Ok(changed > 0)
    }

    /// Returns first and last time an IP was seen.
    pub fn client_key_seen(
        &self,
        client_key: &str,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StatsError> {
        let conn = self.lock();
        let seen = conn
            .query_row(
                "SELECT first_seen, last_seen FROM ip_counts WHERE ip = ?1",
                params![client_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(seen)
    }

    fn top(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError> {
        ensure_active(cancel)?;
        let conn = self.lock();
        ensure_active(cancel)?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![sql_limit(limit)], |row| {
            Ok(CountEntry {
                label: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?;

        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Truncates to at most `max` characters on a char boundary.
fn clamp(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

impl StatsStore for SqliteStatsStore {
    fn record(
        &self,
        cancel: &CancellationToken,
        record: &RequestRecord,
    ) -> Result<(), StatsError> {
        ensure_active(cancel)?;
        let mut conn = self.lock();
        ensure_active(cancel)?;

        let ip = clamp(&record.client_key, MAX_IP_LEN);
        let user_agent = clamp(&record.user_agent, MAX_USER_AGENT_LEN);
        let path = clamp(&record.path, MAX_PATH_LEN);
        let ts = record.timestamp;

        // Dropping `tx` on any early return rolls the whole request back
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO request_log (ip, user_agent, path, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![ip, user_agent, path, ts],
        )?;
        ensure_active(cancel)?;

        tx.execute(
            "INSERT INTO ip_counts (ip, count, first_seen, last_seen)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(ip) DO UPDATE SET
                count = count + 1,
                last_seen = MAX(last_seen, excluded.last_seen)",
            params![ip, ts],
        )?;
        ensure_active(cancel)?;

        tx.execute(
            "INSERT INTO user_agent_counts (user_agent, count, first_seen, last_seen)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(user_agent) DO UPDATE SET
                count = count + 1,
                last_seen = MAX(last_seen, excluded.last_seen)",
            params![user_agent, ts],
        )?;
        ensure_active(cancel)?;

        tx.execute(
            "UPDATE stats SET total_requests = total_requests + 1, updated_at = ?1 WHERE id = 1",
            params![Utc::now()],
        )?;
        ensure_active(cancel)?;

        tx.commit()?;
        Ok(())
    }

    fn summary(&self, cancel: &CancellationToken) -> Result<StatsSummary, StatsError> {
        ensure_active(cancel)?;
        let conn = self.lock();
        ensure_active(cancel)?;

        let (start_time, total_requests) = conn.query_row(
            "SELECT start_time, total_requests FROM stats WHERE id = 1",
            [],
            |row| Ok((row.get::<_, DateTime<Utc>>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let unique_client_keys: i64 =
            conn.query_row("SELECT COUNT(*) FROM ip_counts", [], |row| row.get(0))?;
        let unique_user_agents: i64 =
            conn.query_row("SELECT COUNT(*) FROM user_agent_counts", [], |row| row.get(0))?;

        Ok(StatsSummary {
            start_time,
            total_requests: total_requests as u64,
            unique_client_keys: unique_client_keys as usize,
            unique_user_agents: unique_user_agents as usize,
        })
    }

    fn recent_requests(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StatsError> {
        ensure_active(cancel)?;
        let conn = self.lock();
        ensure_active(cancel)?;

        let mut stmt = conn.prepare(
            "SELECT ip, user_agent, path, timestamp
             FROM request_log
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![sql_limit(limit)], |row| {
            Ok(RequestRecord {
                client_key: row.get(0)?,
                user_agent: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                timestamp: row.get(3)?,
            })
        })?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn top_client_keys(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError> {
        self.top(
            cancel,
            "SELECT ip, count FROM ip_counts ORDER BY count DESC LIMIT ?1",
            limit,
        )
    }

    fn top_user_agents(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<CountEntry>, StatsError> {
        self.top(
            cancel,
            "SELECT user_agent, count FROM user_agent_counts ORDER BY count DESC LIMIT ?1",
            limit,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
