//! Real-time bar multiplexing.
//!
//! One [`RealtimeBarSource`] serves every engine; the router keeps exactly
//! one upstream subscription per live `(symbol, timeframe)` key and fans
//! bars into the orchestrator's single event loop, so engine processing
//! stays serialized no matter how many streams are open.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sd_schemas::{Bar, Timeframe};

/// Key for one bar stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

/// Provider of live bars (the market-data client is an external
/// collaborator; tests script one).
pub trait RealtimeBarSource: Send + Sync {
    fn subscribe(&self, symbol: &str, timeframe: Timeframe) -> broadcast::Receiver<Bar>;
    fn unsubscribe(&self, symbol: &str, timeframe: Timeframe);
}

/// Source that never produces a bar. Used when no market-data client is
/// wired (dry-run and repository-only deployments): engines still run on
/// the historical fetch path.
pub struct NullBarSource;

impl RealtimeBarSource for NullBarSource {
    fn subscribe(&self, _symbol: &str, _timeframe: Timeframe) -> broadcast::Receiver<Bar> {
        let (tx, rx) = broadcast::channel(1);
        // The sender is dropped immediately; receivers observe Closed and
        // the forwarder task exits.
        drop(tx);
        rx
    }

    fn unsubscribe(&self, _symbol: &str, _timeframe: Timeframe) {}
}

struct Subscription {
    forwarder: JoinHandle<()>,
}

/// Maintains upstream subscriptions to match the set of keys engines
/// currently need.
pub struct StreamRouter {
    source: std::sync::Arc<dyn RealtimeBarSource>,
    live_tx: mpsc::Sender<(StreamKey, Bar)>,
    subs: HashMap<StreamKey, Subscription>,
}

impl StreamRouter {
    pub fn new(
        source: std::sync::Arc<dyn RealtimeBarSource>,
        live_tx: mpsc::Sender<(StreamKey, Bar)>,
    ) -> Self {
        Self {
            source,
            live_tx,
            subs: HashMap::new(),
        }
    }

    /// Reconcile subscriptions against the wanted key set.
    pub fn sync(&mut self, wanted: impl IntoIterator<Item = StreamKey>) {
        let wanted: std::collections::HashSet<StreamKey> = wanted.into_iter().collect();

        let stale: Vec<StreamKey> = self
            .subs
            .keys()
            .filter(|k| !wanted.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.drop_subscription(&key);
        }

        for key in wanted {
            if self.subs.contains_key(&key) {
                continue;
            }
            let mut rx = self.source.subscribe(&key.symbol, key.timeframe);
            let tx = self.live_tx.clone();
            let fwd_key = key.clone();
            debug!(symbol = %key.symbol, timeframe = %key.timeframe, "bar stream subscribed");
            let forwarder = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(bar) => {
                            if tx.send((fwd_key.clone(), bar)).await.is_err() {
                                return; // orchestrator gone
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(symbol = %fwd_key.symbol, skipped = n, "bar stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
            self.subs.insert(key, Subscription { forwarder });
        }
    }

    pub fn active_keys(&self) -> Vec<StreamKey> {
        self.subs.keys().cloned().collect()
    }

    fn drop_subscription(&mut self, key: &StreamKey) {
        if let Some(sub) = self.subs.remove(key) {
            sub.forwarder.abort();
            self.source.unsubscribe(&key.symbol, key.timeframe);
            debug!(symbol = %key.symbol, timeframe = %key.timeframe, "bar stream unsubscribed");
        }
    }

    /// Drop everything (graceful shutdown stops streaming first).
    pub fn shutdown(&mut self) {
        let keys: Vec<StreamKey> = self.subs.keys().cloned().collect();
        for key in keys {
            self.drop_subscription(&key);
        }
    }
}
