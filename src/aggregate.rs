// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded Count Aggregates
//!
//! A key → count map with a cardinality ceiling. Once the ceiling is reached,
//! unseen keys are dropped while known keys keep counting.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A label and its request count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountEntry {
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone)]
struct AggregateEntry {
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    /// Insertion order, used as the ranking tie-break.
    seq: u64,
}

/// Request counts per key, capped at `max_keys` distinct keys.
#[derive(Debug, Clone)]
pub struct CountAggregate {
    entries: HashMap<String, AggregateEntry>,
    max_keys: usize,
    next_seq: u64,
}

impl CountAggregate {
    pub fn new(max_keys: usize) -> Self {
        CountAggregate {
            entries: HashMap::new(),
            max_keys,
            next_seq: 0,
        }
    }

    /// Counts one request for `key` seen at `at`.
    ///
    /// Returns false if the key is new and the ceiling has been reached.
    pub fn increment(&mut self, key: &str, at: DateTime<Utc>) -> bool {
        self.add(key, 1, at)
    }

    /// Adds `count` requests for `key`, used when restoring a snapshot.
    pub fn add(&mut self, key: &str, count: u64, at: DateTime<Utc>) -> bool {
        if count == 0 {
            return false;
        }

        if let Some(entry) = self.entries.get_mut(key) {
            entry.count += count;
            entry.last_seen = entry.last_seen.max(at);
            return true;
        }

        if self.entries.len() >= self.max_keys {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.to_string(),
            AggregateEntry {
                count,
                first_seen: at,
                last_seen: at,
                seq,
            },
        );
        true
    }

    pub fn count(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.count)
    }

    /// First and last time `key` was counted.
    pub fn seen(&self, key: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.entries.get(key).map(|e| (e.first_seen, e.last_seen))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the `limit` highest counts, descending. Equal counts keep
    /// first-insertion order.
    pub fn top(&self, limit: usize) -> Vec<CountEntry> {
        let mut ranked: Vec<(&String, &AggregateEntry)> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.1.seq.cmp(&b.1.seq)));
        ranked
            .into_iter()
            .take(limit)
            .map(|(label, entry)| CountEntry {
                label: label.clone(),
                count: entry.count,
            })
            .collect()
    }

    /// Plain key → count view for serialization.
    pub fn to_counts(&self) -> HashMap<String, u64> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_drops_new_keys_only() {
        let now = Utc::now();
        let mut agg = CountAggregate::new(2);

        assert!(agg.increment("A", now));
        assert!(agg.increment("B", now));
        assert!(!agg.increment("C", now));
        assert!(agg.increment("A", now));

        assert_eq!(agg.len(), 2);
        assert_eq!(agg.count("A"), Some(2));
        assert_eq!(agg.count("B"), Some(1));
        assert_eq!(agg.count("C"), None);
    }

    #[test]
    fn test_top_orders_by_count_then_insertion() {
        let now = Utc::now();
        let mut agg = CountAggregate::new(100);
        for key in ["z", "y", "x"] {
            agg.increment(key, now);
        }
        agg.increment("x", now);

        let top = agg.top(10);
        let labels: Vec<&str> = top.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["x", "z", "y"]);
        assert_eq!(top[0].count, 2);
    }

    #[test]
    fn test_top_limit() {
        let now = Utc::now();
        let mut agg = CountAggregate::new(100);
        for i in 0..20 {
            agg.increment(&format!("k{}", i), now);
        }
        assert_eq!(agg.top(5).len(), 5);
        assert_eq!(agg.top(0).len(), 0);
    }

    #[test]
    fn test_seen_timestamps() {
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(30);
        let mut agg = CountAggregate::new(10);

        agg.increment("A", first);
        agg.increment("A", later);

        assert_eq!(agg.seen("A"), Some((first, later)));
    }

    #[test]
    fn test_add_zero_is_ignored() {
        let mut agg = CountAggregate::new(10);
        assert!(!agg.add("A", 0, Utc::now()));
        assert!(agg.is_empty());
    }
}
