//! Worker and IP ban accounting.
//!
//! Two independent structures. The worker ban list maps lowercased worker
//! names to an expiry (zero means permanent) and persists through the
//! atomic record stream in `store`. The reconnect guard is purely in
//! memory: a per-IP sliding window of connection attempts that temporarily
//! bans addresses hammering the accept loop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::BanConfig;
use crate::error::Result;
use crate::store::{atomic_write, encode_records, read_records};
use crate::tracing::prelude::*;

/// A persisted worker ban. `until == 0` is permanent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanEntry {
    pub worker: String,
    pub until: u64,
    pub reason: String,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Persisted list of banned workers.
pub struct BanList {
    path: PathBuf,
    entries: Mutex<HashMap<String, BanEntry>>,
}

impl BanList {
    pub fn load(path: PathBuf) -> Result<Self> {
        let records: Vec<BanEntry> = read_records(&path)?;
        let mut entries = HashMap::new();
        for record in records {
            entries.insert(record.worker.to_lowercase(), record);
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "Loaded worker ban list");
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Ban a worker. `duration` of `None` is permanent.
    pub fn ban(&self, worker: &str, duration: Option<Duration>, reason: &str) {
        let key = worker.to_lowercase();
        let until = duration.map(|d| unix_now() + d.as_secs()).unwrap_or(0);
        warn!(worker = %key, until, reason, "Banning worker");
        self.entries.lock().insert(
            key.clone(),
            BanEntry {
                worker: key,
                until,
                reason: reason.to_string(),
            },
        );
    }

    pub fn is_banned(&self, worker: &str) -> bool {
        self.is_banned_at(worker, unix_now())
    }

    fn is_banned_at(&self, worker: &str, now: u64) -> bool {
        match self.entries.lock().get(&worker.to_lowercase()) {
            Some(entry) => entry.until == 0 || entry.until >= now,
            None => false,
        }
    }

    /// Drop expired entries and atomically rewrite the file.
    ///
    /// Permanent entries (`until == 0`) always survive.
    pub fn persist(&self) -> Result<()> {
        let now = unix_now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.until == 0 || entry.until >= now);
        let bytes = encode_records(entries.values())?;
        atomic_write(&self.path, &bytes)
    }

    #[cfg(test)]
    fn insert_raw(&self, entry: BanEntry) {
        self.entries
            .lock()
            .insert(entry.worker.to_lowercase(), entry);
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<BanEntry> {
        let mut entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.worker.cmp(&b.worker));
        entries
    }
}

#[derive(Debug)]
struct IpRecord {
    attempts: Vec<Instant>,
    banned_until: Option<Instant>,
    last_seen: Instant,
}

/// Sliding-window counter of reconnect attempts per IP.
///
/// Exceeding the threshold inside the window bans the address from new
/// accepts. Idle entries are garbage-collected; the map is hard-capped, and
/// arbitrary excess is dropped rather than letting a spray of spoofed
/// sources exhaust memory.
pub struct ReconnectGuard {
    window: Duration,
    threshold: u32,
    ban_duration: Duration,
    max_entries: usize,
    records: Mutex<HashMap<IpAddr, IpRecord>>,
}

impl ReconnectGuard {
    pub fn new(config: &BanConfig) -> Self {
        Self {
            window: Duration::from_secs(config.reconnect_window_secs),
            threshold: config.reconnect_threshold,
            ban_duration: Duration::from_secs(config.reconnect_duration_secs),
            max_entries: config.reconnect_max_entries,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connection attempt; returns false when the IP is banned.
    pub fn allow(&self, ip: IpAddr, now: Instant) -> bool {
        let mut records = self.records.lock();

        // Opportunistic GC of long-idle entries.
        let idle_cutoff = self.window * 2;
        records.retain(|_, record| now.duration_since(record.last_seen) < idle_cutoff);

        if records.len() >= self.max_entries && !records.contains_key(&ip) {
            // At capacity: drop an arbitrary entry to make room.
            if let Some(&victim) = records.keys().next() {
                records.remove(&victim);
            }
        }
        let record = records.entry(ip).or_insert_with(|| IpRecord {
            attempts: Vec::new(),
            banned_until: None,
            last_seen: now,
        });

        record.last_seen = now;

        if let Some(until) = record.banned_until {
            if now < until {
                return false;
            }
            record.banned_until = None;
            record.attempts.clear();
        }

        let window = self.window;
        record
            .attempts
            .retain(|&attempt| now.duration_since(attempt) < window);
        record.attempts.push(now);

        if record.attempts.len() as u32 > self.threshold {
            warn!(ip = %ip, attempts = record.attempts.len(), "Reconnect ban");
            record.banned_until = Some(now + self.ban_duration);
            return false;
        }

        true
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.records.lock().len()
    }
}
