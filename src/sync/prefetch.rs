use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use super::client::ApiTransport;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;

/// Coarse link quality, in the shape connection APIs report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
    Unknown,
}

/// Injected network condition hints; prefetch concurrency adapts to them.
pub trait NetworkHints: Send + Sync {
    fn effective_type(&self) -> EffectiveType {
        EffectiveType::Unknown
    }
    fn save_data(&self) -> bool {
        false
    }
}

/// Default hints: no information, full concurrency.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHints;

impl NetworkHints for NoHints {}

/// What one prefetch tick did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PrefetchReport {
    pub examined: usize,
    pub fetched: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub offline: bool,
    pub paused: bool,
}

/// Background loop downloading referenced uploads into the content cache.
pub struct MediaPrefetcher {
    store: Arc<Store>,
    api: Arc<dyn ApiTransport>,
    clock: Arc<dyn Clock>,
    hints: Arc<dyn NetworkHints>,
    online: watch::Receiver<bool>,
}

enum FetchOutcome {
    CacheHit,
    Fetched,
    Failed,
}

impl MediaPrefetcher {
    pub fn new(
        store: Arc<Store>,
        api: Arc<dyn ApiTransport>,
        clock: Arc<dyn Clock>,
        hints: Arc<dyn NetworkHints>,
        online: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            hints,
            online,
        }
    }

    /// 1 for 2g or save-data, 2 for 3g, else 3.
    pub fn concurrency(&self) -> usize {
        if self.hints.save_data() {
            return 1;
        }
        match self.hints.effective_type() {
            EffectiveType::Slow2g | EffectiveType::TwoG => 1,
            EffectiveType::ThreeG => 2,
            EffectiveType::FourG | EffectiveType::Unknown => 3,
        }
    }

    /// One poll: reads a bounded batch of non-`ok` assets under the fail
    /// cap and resolves each from the content cache or the network.
    pub async fn tick(&self) -> Result<PrefetchReport> {
        let mut report = PrefetchReport::default();
        if !*self.online.borrow() {
            report.offline = true;
            return Ok(report);
        }
        if self.store.media_prefetch_paused()? {
            report.paused = true;
            return Ok(report);
        }

        let concurrency = self.concurrency();
        let assets = self.store.fetchable_media_assets(3 * concurrency)?;
        report.examined = assets.len();
        if assets.is_empty() {
            return Ok(report);
        }

        for batch in assets.chunks(concurrency) {
            let mut set: JoinSet<FetchOutcome> = JoinSet::new();
            for asset in batch {
                let store = self.store.clone();
                let api = self.api.clone();
                let url = asset.url.clone();
                let now_ms = self.clock.now_ms();
                set.spawn(async move { fetch_one(store, api, url, now_ms).await });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(FetchOutcome::CacheHit) => report.cache_hits += 1,
                    Ok(FetchOutcome::Fetched) => report.fetched += 1,
                    Ok(FetchOutcome::Failed) => report.failed += 1,
                    Err(err) => {
                        debug!(%err, "prefetch task panicked");
                        report.failed += 1;
                    }
                }
            }
            if !*self.online.borrow() {
                break;
            }
        }
        Ok(report)
    }
}

async fn fetch_one(
    store: Arc<Store>,
    api: Arc<dyn ApiTransport>,
    url: String,
    now_ms: u64,
) -> FetchOutcome {
    match store.media_blob_exists(&url) {
        Ok(true) => {
            // Already cached; no network needed.
            let _ = store.mark_media_ok(&url, now_ms);
            return FetchOutcome::CacheHit;
        }
        Ok(false) => {}
        Err(err) => {
            debug!(url, %err, "content cache probe failed");
        }
    }
    match api.fetch_upload(&url).await {
        Ok(fetch) => {
            let stored = store
                .put_media_blob(&url, &fetch.bytes, fetch.mime.as_deref(), now_ms)
                .and_then(|()| store.mark_media_ok(&url, now_ms));
            match stored {
                Ok(()) => FetchOutcome::Fetched,
                Err(err) => {
                    let _ = store.mark_media_error(&url, &err.to_string(), now_ms);
                    FetchOutcome::Failed
                }
            }
        }
        Err(err) => {
            let _ = store.mark_media_error(&url, &err.to_string(), now_ms);
            FetchOutcome::Failed
        }
    }
}
