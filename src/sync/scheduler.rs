use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::prefetch::{MediaPrefetcher, NetworkHints, NoHints};
use super::SyncEngine;

/// Event wiring around the engine: flush on outbox changes, on regained
/// connectivity, and on visibility loss, with a jittered fallback interval
/// that idles once the outbox drains. Prefetch polls on its own cadence.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    prefetcher: Arc<MediaPrefetcher>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self::with_hints(engine, Arc::new(NoHints))
    }

    pub fn with_hints(engine: Arc<SyncEngine>, hints: Arc<dyn NetworkHints>) -> Self {
        let prefetcher = Arc::new(MediaPrefetcher::new(
            engine.store.clone(),
            engine.api.clone(),
            engine.clock.clone(),
            hints,
            engine.online_changed(),
        ));
        Self { engine, prefetcher }
    }

    pub fn prefetcher(&self) -> &Arc<MediaPrefetcher> {
        &self.prefetcher
    }

    /// Drives the engine until `shutdown` flips. All handlers are
    /// reentrancy-safe: the flush latch turns overlapping triggers into
    /// no-ops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let engine = &self.engine;
        let mut outbox_rx = engine.store.outbox_changed();
        let mut online_rx = engine.online_changed();
        let mut visible_rx = engine.visibility_changed();

        let mut prefetch_tick = tokio::time::interval(Duration::from_millis(
            engine.config.prefetch_poll_ms.max(100),
        ));
        prefetch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let depth = engine.store.outbox_depth().unwrap_or(0);
            let base = if depth > 0 {
                engine.config.flush_interval_fast_ms
            } else {
                engine.config.flush_interval_idle_ms
            };
            let jitter = rand::thread_rng().gen_range(0..=base / 10);
            let fallback = tokio::time::sleep(Duration::from_millis(base + jitter));

            tokio::select! {
                _ = fallback => {
                    if depth > 0 {
                        self.flush_quietly().await;
                    }
                }
                changed = outbox_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.flush_quietly().await;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online_rx.borrow() {
                        debug!("back online; flushing and reconciling");
                        self.flush_quietly().await;
                        if let Err(err) = engine.full_pull(false).await {
                            warn!(%err, "full pull after reconnect failed");
                        }
                        if let Err(err) = self.prefetcher.tick().await {
                            debug!(%err, "prefetch tick failed");
                        }
                    }
                }
                changed = visible_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*visible_rx.borrow() {
                        // Going hidden: push pending work out while we can.
                        self.flush_quietly().await;
                    }
                }
                _ = prefetch_tick.tick() => {
                    if let Err(err) = self.prefetcher.tick().await {
                        debug!(%err, "prefetch tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn flush_quietly(&self) {
        if let Err(err) = self.engine.flush_outbox_once().await {
            warn!(%err, "flush pass failed");
        }
    }
}
