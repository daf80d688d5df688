//! Background cache monitor: periodic stats, warnings, idle eviction, and
//! the repository retention sweep.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{now_ms, BarCache};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Entries idle longer than this are evicted.
    pub inactivity_ms: i64,
    /// Aggregate memory above this triggers a warning.
    pub memory_warn_bytes: usize,
    /// Bars older than `now − retention` are swept from the repository.
    pub retention_ms: i64,
    /// Warn when hit rate drops below this over at least `min_requests`.
    pub hit_rate_warn: f64,
    pub min_requests: u64,
}

impl MonitorConfig {
    pub fn from_settings(log_stats_interval_ms: u64, bar_retention_days: u32) -> Self {
        Self {
            interval_ms: log_stats_interval_ms,
            inactivity_ms: 30 * 60 * 1000,
            memory_warn_bytes: 256 * 1024 * 1024,
            retention_ms: i64::from(bar_retention_days) * 86_400_000,
            hit_rate_warn: 0.70,
            min_requests: 100,
        }
    }
}

/// Periodic monitor task. Stopped via the shutdown watch channel; the
/// spawned task exits on the next tick or shutdown signal, whichever
/// comes first.
pub struct CacheMonitor {
    cache: Arc<BarCache>,
    config: MonitorConfig,
}

impl CacheMonitor {
    pub fn new(cache: Arc<BarCache>, config: MonitorConfig) -> Self {
        Self { cache, config }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(self.config.interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("cache monitor stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// One monitor pass. Public so tests can drive it without timers.
    pub async fn tick(&self) {
        let stats = self.cache.stats();

        let total_bars: usize = stats.iter().map(|s| s.bar_count).sum();
        let total_memory: usize = stats.iter().map(|s| s.memory_bytes).sum();
        let hits: u64 = stats.iter().map(|s| s.hits).sum();
        let misses: u64 = stats.iter().map(|s| s.misses).sum();
        let requests = hits + misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64
        };

        info!(
            entries = stats.len(),
            total_bars,
            total_memory,
            hit_rate = format!("{:.1}%", hit_rate * 100.0),
            "bar cache stats"
        );

        if requests >= self.config.min_requests && hit_rate < self.config.hit_rate_warn {
            warn!(
                hit_rate = format!("{:.1}%", hit_rate * 100.0),
                requests, "bar cache hit rate below threshold"
            );
        }
        if total_memory > self.config.memory_warn_bytes {
            warn!(
                total_memory,
                limit = self.config.memory_warn_bytes,
                "bar cache memory above threshold"
            );
        }

        let evicted = self.cache.evict_idle(self.config.inactivity_ms);
        if evicted > 0 {
            info!(evicted, "evicted idle bar cache entries");
        }

        let cutoff = now_ms() - self.config.retention_ms;
        match self.cache.delete_old_bars(None, None, cutoff).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, cutoff, "bar retention sweep"),
            Err(e) => warn!(error = %e, "bar retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_db::MemoryRepository;
    use sd_schemas::{Bar, Timeframe};

    fn bar(ts: i64) -> Bar {
        Bar {
            ts,
            open: 1.0,
            high: 1.5,
            low: 0.5,
            close: 1.0,
            volume: 1,
        }
    }

    #[tokio::test]
    async fn tick_runs_retention_sweep() {
        let cache = Arc::new(BarCache::new(Arc::new(MemoryRepository::new()), 60_000));
        let tf: Timeframe = "5m".parse().unwrap();
        let now = now_ms();
        cache
            .insert_bars("AAPL", tf, &[bar(now - 400 * 86_400_000), bar(now - 1000)])
            .await
            .unwrap();

        let config = MonitorConfig::from_settings(1000, 365);
        let monitor = CacheMonitor::new(Arc::clone(&cache), config);
        monitor.tick().await;

        cache.clear(None, None);
        let remaining = cache.get_bars("AAPL", tf, 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn idle_entries_evicted() {
        let cache = Arc::new(BarCache::new(Arc::new(MemoryRepository::new()), 60_000));
        let tf: Timeframe = "5m".parse().unwrap();
        cache.insert_bars("AAPL", tf, &[bar(1)]).await.unwrap();
        cache.get_bars("AAPL", tf, 0).await.unwrap();
        assert_eq!(cache.stats().len(), 1);

        // Zero inactivity window: everything is idle.
        let mut config = MonitorConfig::from_settings(1000, 365);
        config.inactivity_ms = -1;
        let monitor = CacheMonitor::new(Arc::clone(&cache), config);
        monitor.tick().await;
        assert!(cache.stats().is_empty());
    }
}
