//! Scenario: bar cache seed behaviors.
//!
//! 1. Dedup — inserting the same bar twice counts once, stores once.
//! 2. Range — an inclusive range query returns exactly the bars inside.
//! 3. Retention — the sweep deletes only rows older than the cutoff.
//! 4. Monotonic — bars come back strictly ascending regardless of insert
//!    order.

use std::sync::Arc;

use sd_barcache::BarCache;
use sd_db::MemoryRepository;
use sd_schemas::{Bar, Timeframe};

fn tf() -> Timeframe {
    "5m".parse().unwrap()
}

fn bar(ts: i64) -> Bar {
    Bar {
        ts,
        open: 100.0,
        high: 101.0,
        low: 99.0,
        close: 100.5,
        volume: 500,
    }
}

fn cache() -> BarCache {
    BarCache::new(Arc::new(MemoryRepository::new()), 60_000)
}

#[tokio::test]
async fn dedup_on_double_insert() {
    let c = cache();
    let bars = vec![bar(1_000_000)];
    assert_eq!(c.insert_bars("TEST", tf(), &bars).await.unwrap(), 1);
    assert_eq!(
        c.insert_bars("TEST", tf(), &bars).await.unwrap(),
        0,
        "second insert of the same bar must count zero"
    );
    let got = c.get_bars("TEST", tf(), 0).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].ts, 1_000_000);
}

#[tokio::test]
async fn range_query_returns_only_contained_bars() {
    let c = cache();
    let bars: Vec<Bar> = [1_000_000i64, 2_000_000, 3_000_000]
        .iter()
        .map(|&t| bar(t))
        .collect();
    c.insert_bars("TEST", tf(), &bars).await.unwrap();

    let got = c
        .get_bars_range("TEST", tf(), 1_500_000, 2_500_000)
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].ts, 2_000_000);
}

#[tokio::test]
async fn retention_deletes_only_expired_rows() {
    let c = cache();
    let now = now_ms();
    let old = bar(now - 366 * 86_400_000);
    let recent = bar(now - 86_400_000);
    c.insert_bars("AAPL", tf(), &[old, recent]).await.unwrap();

    let deleted = c
        .delete_old_bars(Some("AAPL"), Some(tf()), now - 365 * 86_400_000)
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    c.clear(None, None);
    let got = c.get_bars("AAPL", tf(), 0).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].ts, recent.ts);
}

#[tokio::test]
async fn bars_always_strictly_ascending() {
    let c = cache();
    // Deliberately shuffled inserts across two batches.
    c.insert_bars("TEST", tf(), &[bar(5_000_000), bar(1_000_000)])
        .await
        .unwrap();
    c.insert_bars("TEST", tf(), &[bar(3_000_000), bar(2_000_000), bar(4_000_000)])
        .await
        .unwrap();

    let got = c.get_bars("TEST", tf(), 0).await.unwrap();
    let ts: Vec<i64> = got.iter().map(|b| b.ts).collect();
    let mut sorted = ts.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ts, sorted, "cache must return strictly ascending bars");
    assert_eq!(ts.len(), 5);
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as i64
}
