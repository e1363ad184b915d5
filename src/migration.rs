// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Legacy File Migration
//!
//! Imports the flat files written by file-based releases (`requests.ndjson`
//! and `stats.json`) into the SQLite store. Aggregates are rebuilt by
//! replaying every logged request; the snapshot only contributes its start
//! time. Each file is renamed to `*.migrated` once its import has finished,
//! so running the migration again is a no-op.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StatsError;
use crate::sqlite_store::SqliteStatsStore;
use crate::storage::{
    PersistedStats, RequestRecord, StatsStore, REQUESTS_LOG_FILE_NAME, SNAPSHOT_FILE_NAME,
};

/// Suffix appended to legacy files once imported.
pub const MIGRATED_SUFFIX: &str = ".migrated";

/// Outcome of a migration run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Requests replayed into the store.
    pub imported: usize,
    /// Lines that could not be parsed or recorded.
    pub skipped: usize,
    /// Whether the snapshot moved the store's start time back.
    pub start_time_adopted: bool,
    /// Legacy files that were consumed.
    pub files_migrated: Vec<PathBuf>,
}

impl MigrationReport {
    /// True when there was nothing to migrate.
    pub fn is_empty(&self) -> bool {
        self.files_migrated.is_empty()
    }
}

/// Migrates legacy files in `data_dir` into `store`.
///
/// Malformed lines are logged and skipped. Cancellation aborts before the
/// current file is renamed, so an interrupted import is retried on the next
/// run rather than lost.
pub fn migrate_legacy_files(
    store: &SqliteStatsStore,
    data_dir: &Path,
    cancel: &CancellationToken,
) -> Result<MigrationReport, StatsError> {
    let requests_file = data_dir.join(REQUESTS_LOG_FILE_NAME);
    let stats_file = data_dir.join(SNAPSHOT_FILE_NAME);
    let mut report = MigrationReport::default();

    let requests_exist = requests_file.is_file();
    let stats_exist = stats_file.is_file();
    if !requests_exist && !stats_exist {
        debug!("No legacy data files to migrate");
        return Ok(report);
    }

    info!(
        requests_file = requests_exist,
        stats_file = stats_exist,
        "Starting migration from legacy files"
    );

    if requests_exist {
        migrate_request_log(store, &requests_file, cancel, &mut report)?;
        mark_migrated(&requests_file, &mut report);
    }

    if stats_exist {
        migrate_snapshot(store, &stats_file, &mut report)?;
        mark_migrated(&stats_file, &mut report);
    }

    info!(
        imported = report.imported,
        skipped = report.skipped,
        "Migration completed"
    );
    Ok(report)
}

fn migrate_request_log(
    store: &SqliteStatsStore,
    path: &Path,
    cancel: &CancellationToken,
    report: &mut MigrationReport,
) -> Result<(), StatsError> {
    let reader = BufReader::new(File::open(path)?);

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let legacy: RequestRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping unparsable request line");
                report.skipped += 1;
                continue;
            }
        };
        let record = RequestRecord::new(
            legacy.client_key,
            Some(&legacy.user_agent),
            legacy.path,
            legacy.timestamp,
        );

        match store.record(cancel, &record) {
            Ok(()) => report.imported += 1,
            Err(StatsError::Cancelled) => return Err(StatsError::Cancelled),
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Failed to import request");
                report.skipped += 1;
            }
        }

        if report.imported > 0 && report.imported % 1000 == 0 {
            debug!(requests = report.imported, "Migration progress");
        }
    }

    info!(count = report.imported, "Migrated requests from request log");
    Ok(())
}

fn migrate_snapshot(
    store: &SqliteStatsStore,
    path: &Path,
    report: &mut MigrationReport,
) -> Result<(), StatsError> {
    let data = std::fs::read(path)?;
    let persisted: PersistedStats = serde_json::from_slice(&data)?;

    report.start_time_adopted = store.adopt_earlier_start_time(persisted.start_time)?;
    info!(start_time = %persisted.start_time, "Migrated stats snapshot");
    Ok(())
}

fn mark_migrated(path: &Path, report: &mut MigrationReport) {
    let mut backup = path.as_os_str().to_owned();
    backup.push(MIGRATED_SUFFIX);
    let backup = PathBuf::from(backup);

    match std::fs::rename(path, &backup) {
        Ok(()) => {
            info!(backup = %backup.display(), "Backed up legacy file");
            report.files_migrated.push(backup);
        }
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to back up legacy file"),
    }
}
