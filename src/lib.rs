// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod admin_auth;
pub mod aggregate;
pub mod config;
pub mod content;
pub mod error;
pub mod http;
pub mod ip_resolver;
pub mod memory_store;
pub mod metrics;
pub mod migration;
pub mod rate_limit;
pub mod sqlite_store;
pub mod stats_manager;
pub mod storage;
