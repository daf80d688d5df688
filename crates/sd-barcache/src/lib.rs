//! Shared bar cache: per-(symbol, timeframe) ordered bar store with TTL,
//! deduplication, and single-flight repository loads.
//!
//! # Concurrency
//!
//! The outer map is a short-critical-section `RwLock`; each entry sits
//! behind its own async `Mutex`. A miss that loads from the repository
//! holds only its entry's lock, so other keys are never blocked, and a
//! second request for the same key awaits the same lock and finds the
//! entry populated — load deduplication falls out of the lock shape
//! rather than extra bookkeeping.
//!
//! # Invariants
//!
//! Bars in every entry are strictly ascending by timestamp with no
//! duplicates. TTL governs staleness only; every insert goes to the
//! repository first, so an evicted entry is never data loss.

mod monitor;

pub use monitor::{CacheMonitor, MonitorConfig};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use sd_db::{BarRepository, RepoResult};
use sd_schemas::{Bar, Timeframe};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Default)]
struct CacheEntry {
    bars: Vec<Bar>,
    /// 0 = never loaded; u32::MAX marks an unlimited load.
    loaded_limit: u32,
    last_access_ms: i64,
    hits: u64,
    misses: u64,
}

impl CacheEntry {
    fn covers(&self, limit: u32) -> bool {
        if self.loaded_limit == 0 {
            return false;
        }
        if self.loaded_limit == u32::MAX {
            return true;
        }
        limit != 0 && limit <= self.loaded_limit
    }

    fn tail(&self, limit: u32) -> Vec<Bar> {
        if limit == 0 || self.bars.len() <= limit as usize {
            self.bars.clone()
        } else {
            self.bars[self.bars.len() - limit as usize..].to_vec()
        }
    }

    /// Merge keeping ascending order and dropping duplicate timestamps.
    fn merge(&mut self, incoming: &[Bar]) {
        for bar in incoming {
            match self.bars.binary_search_by_key(&bar.ts, |b| b.ts) {
                Ok(_) => {}
                Err(pos) => self.bars.insert(pos, *bar),
            }
        }
    }

    fn memory_bytes(&self) -> usize {
        self.bars.capacity() * size_of::<Bar>() + size_of::<Self>()
    }
}

/// Per-entry statistics snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntryStats {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_bytes: usize,
    pub last_access_ms: i64,
}

pub struct BarCache {
    repo: Arc<dyn BarRepository>,
    ttl_ms: i64,
    entries: RwLock<HashMap<CacheKey, Arc<Mutex<CacheEntry>>>>,
}

impl BarCache {
    pub fn new(repo: Arc<dyn BarRepository>, ttl_ms: u64) -> Self {
        Self {
            repo,
            ttl_ms: ttl_ms as i64,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, symbol: &str, timeframe: Timeframe) -> Arc<Mutex<CacheEntry>> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            timeframe,
        };
        if let Some(e) = self.entries.read().get(&key) {
            return Arc::clone(e);
        }
        let mut map = self.entries.write();
        Arc::clone(map.entry(key).or_default())
    }

    /// Up to `limit` bars, ascending, newest last. `limit` 0 = unlimited.
    ///
    /// Serves from cache while the entry is fresh and covers the request;
    /// otherwise loads from the repository and repopulates.
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> RepoResult<Vec<Bar>> {
        let entry = self.entry(symbol, timeframe);
        let mut e = entry.lock().await;
        let now = now_ms();

        let fresh = e.loaded_limit != 0 && now - e.last_access_ms < self.ttl_ms;
        if fresh && e.covers(limit) {
            e.hits += 1;
            e.last_access_ms = now;
            return Ok(e.tail(limit));
        }

        e.misses += 1;
        debug!(symbol, %timeframe, limit, "bar cache miss, loading from repository");
        let bars = self.repo.fetch_bars(symbol, timeframe, limit).await?;
        e.bars = bars.clone();
        e.loaded_limit = if limit == 0 { u32::MAX } else { limit };
        e.last_access_ms = now;
        Ok(bars)
    }

    /// Bars with `from_ts ≤ ts ≤ to_ts`, ascending.
    ///
    /// Served from a fresh fully-loaded entry when possible, otherwise
    /// straight from the repository (partial ranges never populate the
    /// entry, so the full-load invariant holds).
    pub async fn get_bars_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ts: i64,
        to_ts: i64,
    ) -> RepoResult<Vec<Bar>> {
        let entry = self.entry(symbol, timeframe);
        let mut e = entry.lock().await;
        let now = now_ms();

        let fresh = e.loaded_limit == u32::MAX && now - e.last_access_ms < self.ttl_ms;
        if fresh {
            e.hits += 1;
            e.last_access_ms = now;
            return Ok(e
                .bars
                .iter()
                .filter(|b| b.ts >= from_ts && b.ts <= to_ts)
                .copied()
                .collect());
        }

        e.misses += 1;
        self.repo
            .fetch_bars_range(symbol, timeframe, from_ts, to_ts)
            .await
    }

    /// Persist bars (idempotent upsert), merge them into any live entry,
    /// and return the number of rows actually inserted.
    pub async fn insert_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> RepoResult<u64> {
        let entry = self.entry(symbol, timeframe);
        let mut e = entry.lock().await;
        let inserted = self.repo.upsert_bars(symbol, timeframe, bars).await?;
        if e.loaded_limit != 0 {
            e.merge(bars);
        }
        Ok(inserted)
    }

    /// Drop matching entries; `None` arguments mean "all".
    pub fn clear(&self, symbol: Option<&str>, timeframe: Option<Timeframe>) {
        self.entries.write().retain(|key, _| {
            let sym_match = symbol.map_or(true, |s| s == key.symbol);
            let tf_match = timeframe.map_or(true, |tf| tf == key.timeframe);
            !(sym_match && tf_match)
        });
    }

    /// Evict entries idle for at least `inactivity_ms`. Returns evictions.
    pub fn evict_idle(&self, inactivity_ms: i64) -> usize {
        let now = now_ms();
        let mut evicted = 0;
        self.entries.write().retain(|_, entry| {
            // An entry whose lock is held is in use; keep it regardless.
            match entry.try_lock() {
                Ok(e) => {
                    let keep = now - e.last_access_ms <= inactivity_ms;
                    if !keep {
                        evicted += 1;
                    }
                    keep
                }
                Err(_) => true,
            }
        });
        evicted
    }

    /// Per-entry statistics. Entries whose lock is held are skipped.
    pub fn stats(&self) -> Vec<CacheEntryStats> {
        let map = self.entries.read();
        let mut out = Vec::with_capacity(map.len());
        for (key, entry) in map.iter() {
            if let Ok(e) = entry.try_lock() {
                let total = e.hits + e.misses;
                out.push(CacheEntryStats {
                    symbol: key.symbol.clone(),
                    timeframe: key.timeframe,
                    bar_count: e.bars.len(),
                    hits: e.hits,
                    misses: e.misses,
                    hit_rate: if total == 0 {
                        0.0
                    } else {
                        e.hits as f64 / total as f64
                    },
                    memory_bytes: e.memory_bytes(),
                    last_access_ms: e.last_access_ms,
                });
            }
        }
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Retention sweep in the repository; cached entries are not touched
    /// (they age out via TTL).
    pub async fn delete_old_bars(
        &self,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
        cutoff_ts: i64,
    ) -> RepoResult<u64> {
        self.repo.delete_old_bars(symbol, timeframe, cutoff_ts).await
    }
}
