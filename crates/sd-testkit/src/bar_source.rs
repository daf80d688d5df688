//! Scripted real-time bar source for orchestrator scenarios.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

use sd_schemas::{Bar, Timeframe};

type Key = (String, Timeframe);

/// Test-controlled bar feed. Tests push bars; engines subscribed through
/// the orchestrator's router receive them.
#[derive(Default)]
pub struct ScriptedBarSource {
    channels: Mutex<HashMap<Key, broadcast::Sender<Bar>>>,
    subscribe_count: Mutex<HashMap<Key, usize>>,
    unsubscribe_count: Mutex<HashMap<Key, usize>>,
}

impl ScriptedBarSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, symbol: &str, timeframe: Timeframe) -> broadcast::Sender<Bar> {
        self.channels
            .lock()
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Push a live bar; returns receiver count.
    pub fn push(&self, symbol: &str, timeframe: Timeframe, bar: Bar) -> usize {
        self.sender(symbol, timeframe).send(bar).unwrap_or(0)
    }

    pub fn subscriptions(&self, symbol: &str, timeframe: Timeframe) -> usize {
        *self
            .subscribe_count
            .lock()
            .get(&(symbol.to_string(), timeframe))
            .unwrap_or(&0)
    }

    pub fn unsubscriptions(&self, symbol: &str, timeframe: Timeframe) -> usize {
        *self
            .unsubscribe_count
            .lock()
            .get(&(symbol.to_string(), timeframe))
            .unwrap_or(&0)
    }
}

impl sd_orchestrator::RealtimeBarSource for ScriptedBarSource {
    fn subscribe(&self, symbol: &str, timeframe: Timeframe) -> broadcast::Receiver<Bar> {
        *self
            .subscribe_count
            .lock()
            .entry((symbol.to_string(), timeframe))
            .or_default() += 1;
        self.sender(symbol, timeframe).subscribe()
    }

    fn unsubscribe(&self, symbol: &str, timeframe: Timeframe) {
        *self
            .unsubscribe_count
            .lock()
            .entry((symbol.to_string(), timeframe))
            .or_default() += 1;
    }
}
