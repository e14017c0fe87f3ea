//! Background task that periodically runs [`ContextStore::sweep`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::ContextStore;

/// Periodic TTL + LRU eviction.
pub struct Sweeper {
    store: Arc<ContextStore>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<ContextStore>) -> Self {
        let interval = store.config().sweep_interval;
        Self { store, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_ms = self.interval.as_millis() as u64, "sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.store.sweep(Utc::now());
                    if !report.is_empty() {
                        info!(
                            expired = report.expired.len(),
                            evicted = report.evicted.len(),
                            collected = report.collected.len(),
                            remaining = self.store.len(),
                            "sweep removed contexts"
                        );
                    }
                }
                () = cancel.cancelled() => {
                    debug!("sweeper stopped");
                    return;
                }
            }
        }
    }
}
