// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error Types
//!
//! Errors surfaced by the statistics stores and by configuration loading.

use thiserror::Error;

/// Errors from recording or reading request statistics.
#[derive(Debug, Error)]
pub enum StatsError {
    /// The caller cancelled the operation before it completed.
    ///
    /// Nothing was applied: durable writes are rolled back.
    #[error("operation cancelled")]
    Cancelled,

    /// SQLite failure (transaction, constraint, I/O inside the engine).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure while reading or writing snapshot/legacy files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or legacy record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StatsError {
    /// Returns true if this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StatsError::Cancelled)
    }
}

/// Invalid startup configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("rate limit must be positive (got {0})")]
    InvalidRate(f64),

    #[error("rate limit burst must be positive")]
    InvalidBurst,

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("max label length must be at least 4 (got {0})")]
    LabelTooShort(usize),

    #[error("listen port must not be 0")]
    InvalidPort,

    #[error("wordlist {path}: {reason}")]
    Wordlist { path: String, reason: String },
}
