// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Spider Trap Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::memory_store::MemoryLimits;
use crate::storage::StorageBackend;

/// Spider trap configuration.
#[derive(Debug, Clone)]
pub struct TrapConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Sustained requests per second allowed per client key.
    pub rate_limit_per_sec: f64,
    /// Requests a fresh client may make at once.
    pub rate_limit_burst: u32,
    /// Ceiling on distinct client keys (rate limiter and aggregates).
    pub max_tracked_keys: usize,
    /// Ceiling on distinct user agents in memory mode.
    pub max_tracked_user_agents: usize,
    /// Recent requests kept in memory mode.
    pub max_recent_requests: usize,
    /// Honor X-Forwarded-For / X-Real-IP.
    pub trust_proxy: bool,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Rate limiter sweep interval in seconds.
    pub sweep_interval_secs: u64,
    /// Memory-mode snapshot interval in seconds.
    pub flush_interval_secs: u64,
    /// Delay before each trap response, in milliseconds.
    pub response_delay_ms: u64,
    /// Entries per chart series on the admin endpoints.
    pub top_items: usize,
    /// Chart labels longer than this are truncated.
    pub max_label_length: usize,
    /// Recent requests shown on the admin overview.
    pub recent_display: usize,
    /// Optional wordlist for generated links.
    pub wordlist_path: Option<PathBuf>,
    /// Optional form action added to generated pages.
    pub form_endpoint: Option<String>,
    /// Largest accepted request body, in bytes.
    pub max_body_bytes: usize,
    /// Mark the admin session cookie `Secure` (set when served over HTTPS).
    pub secure_cookie: bool,
}

impl Default for TrapConfig {
    fn default() -> Self {
        let limits = MemoryLimits::default();
        TrapConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 20,
            max_tracked_keys: limits.max_client_keys,
            max_tracked_user_agents: limits.max_user_agents,
            max_recent_requests: limits.max_recent_requests,
            trust_proxy: false,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            sweep_interval_secs: 60,
            flush_interval_secs: 300, // 5 minutes
            response_delay_ms: 350,
            top_items: 10,
            max_label_length: 50,
            recent_display: 50,
            wordlist_path: None,
            form_endpoint: None,
            max_body_bytes: 1 << 20, // 1 MiB
            secure_cookie: false,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var = name, value = %val, "Ignoring unparsable environment value"),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl TrapConfig {
    /// Loads configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("TRAP_LISTEN_ADDR", &mut config.listen_addr);
        env_parse("TRAP_RATE_LIMIT", &mut config.rate_limit_per_sec);
        env_parse("TRAP_RATE_BURST", &mut config.rate_limit_burst);
        env_parse("TRAP_MAX_TRACKED_KEYS", &mut config.max_tracked_keys);
        env_parse(
            "TRAP_MAX_TRACKED_USER_AGENTS",
            &mut config.max_tracked_user_agents,
        );
        env_parse("TRAP_MAX_RECENT_REQUESTS", &mut config.max_recent_requests);
        env_parse("TRAP_SWEEP_INTERVAL", &mut config.sweep_interval_secs);
        env_parse("TRAP_FLUSH_INTERVAL", &mut config.flush_interval_secs);
        env_parse("TRAP_RESPONSE_DELAY_MS", &mut config.response_delay_ms);
        env_parse("TRAP_TOP_ITEMS", &mut config.top_items);
        env_parse("TRAP_MAX_LABEL_LENGTH", &mut config.max_label_length);
        env_parse("TRAP_RECENT_DISPLAY", &mut config.recent_display);
        env_parse("TRAP_MAX_BODY_BYTES", &mut config.max_body_bytes);

        if let Ok(val) = std::env::var("TRAP_TRUST_PROXY") {
            config.trust_proxy = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("TRAP_SECURE_COOKIE") {
            config.secure_cookie = parse_bool(&val);
        }

        env_parse("TRAP_STORAGE_BACKEND", &mut config.storage_backend);

        if let Ok(val) = std::env::var("TRAP_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config.wordlist_path = env_nonempty("TRAP_WORDLIST").map(PathBuf::from);
        config.form_endpoint = env_nonempty("TRAP_FORM_ENDPOINT");

        config
    }

    /// Rejects values the trap cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate_limit_per_sec.is_finite() && self.rate_limit_per_sec > 0.0) {
            return Err(ConfigError::InvalidRate(self.rate_limit_per_sec));
        }
        if self.rate_limit_burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        if f64::from(self.rate_limit_burst) < self.rate_limit_per_sec {
            warn!(
                rate = self.rate_limit_per_sec,
                burst = self.rate_limit_burst,
                "Burst is below the sustained rate; clients can never use the full rate at once"
            );
        }

        for (name, value) in [
            ("max tracked keys", self.max_tracked_keys),
            ("max tracked user agents", self.max_tracked_user_agents),
            ("max recent requests", self.max_recent_requests),
            ("max body bytes", self.max_body_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit(name));
            }
        }

        if self.max_label_length < 4 {
            return Err(ConfigError::LabelTooShort(self.max_label_length));
        }
        if self.listen_addr.port() == 0 {
            return Err(ConfigError::InvalidPort);
        }

        Ok(())
    }

    /// Ceilings for the in-memory backend.
    pub fn memory_limits(&self) -> MemoryLimits {
        MemoryLimits {
            max_client_keys: self.max_tracked_keys,
            max_user_agents: self.max_tracked_user_agents,
            max_recent_requests: self.max_recent_requests,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(
        val.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
