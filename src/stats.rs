//! In-memory statistics counters (C7), exposed as `/Stats.json`.
//!
//! Grounded on `server/server.c`'s `stats_t` and
//! `fills_json_with_get_stats` / `fills_json_with_post_stats` /
//! `answer_global_stats`. Counters are monotonic and safe for
//! concurrent increment; a snapshot is not required to be a
//! consistent instant across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

const ORDER: Ordering = Ordering::Relaxed;

/// Process-wide request and ingest counters.
#[derive(Default)]
pub struct Stats {
    get_total: AtomicU64,
    post_total: AtomicU64,
    unknown_total: AtomicU64,
    meta_bytes_received: AtomicU64,
    dedup_bytes_received: AtomicU64,
    saved_files: AtomicU64,
    total_declared_size: AtomicU64,
    per_url: Mutex<FxHashMap<String, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn record_get(&self, url: &str) {
        self.get_total.fetch_add(1, ORDER);
        self.bump_url(url);
    }

    pub fn record_post(&self, url: &str) {
        self.post_total.fetch_add(1, ORDER);
        self.bump_url(url);
    }

    pub fn record_unknown(&self, url: &str) {
        self.unknown_total.fetch_add(1, ORDER);
        self.bump_url(url);
    }

    fn bump_url(&self, url: &str) {
        let mut per_url = self.per_url.lock();
        *per_url.entry(url.to_string()).or_insert(0) += 1;
    }

    pub fn add_meta_bytes(&self, n: u64) {
        self.meta_bytes_received.fetch_add(n, ORDER);
    }

    pub fn add_dedup_bytes(&self, n: u64) {
        self.dedup_bytes_received.fetch_add(n, ORDER);
    }

    pub fn add_saved_file(&self) {
        self.saved_files.fetch_add(1, ORDER);
    }

    pub fn add_declared_size(&self, n: u64) {
        self.total_declared_size.fetch_add(n, ORDER);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            get_total: self.get_total.load(ORDER),
            post_total: self.post_total.load(ORDER),
            unknown_total: self.unknown_total.load(ORDER),
            meta_bytes_received: self.meta_bytes_received.load(ORDER),
            dedup_bytes_received: self.dedup_bytes_received.load(ORDER),
            saved_files: self.saved_files.load(ORDER),
            total_declared_size: self.total_declared_size.load(ORDER),
            per_url: self.per_url.lock().clone(),
        }
    }
}

/// A point-in-time (not transactionally consistent) snapshot, ready
/// for JSON serialization.
#[derive(Serialize)]
pub struct StatsSnapshot {
    get_total: u64,
    post_total: u64,
    unknown_total: u64,
    meta_bytes_received: u64,
    dedup_bytes_received: u64,
    saved_files: u64,
    total_declared_size: u64,
    per_url: FxHashMap<String, u64>,
}
