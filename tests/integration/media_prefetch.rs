mod common;

use std::sync::Arc;

use common::{open_store, ScriptedApi};
use tempfile::tempdir;
use tokio::sync::watch;

use arbor::clock::ManualClock;
use arbor::store::MediaStatus;
use arbor::sync::{EffectiveType, MediaPrefetcher, NetworkHints, NoHints};

struct SlowLink;
impl NetworkHints for SlowLink {
    fn effective_type(&self) -> EffectiveType {
        EffectiveType::TwoG
    }
}

struct DataSaver;
impl NetworkHints for DataSaver {
    fn save_data(&self) -> bool {
        true
    }
}

fn prefetcher(
    store: Arc<arbor::Store>,
    api: Arc<ScriptedApi>,
    hints: Arc<dyn NetworkHints>,
    online: bool,
) -> (MediaPrefetcher, watch::Sender<bool>) {
    let clock = Arc::new(ManualClock::new(42));
    let (tx, rx) = watch::channel(online);
    (
        MediaPrefetcher::new(store, api, clock, hints, rx),
        tx,
    )
}

fn seed_asset(store: &arbor::Store, url: &str) {
    store
        .replace_article_media_refs("a1", &[url.to_string()].into_iter().collect())
        .unwrap();
}

#[tokio::test]
async fn fetches_needed_assets_into_the_content_cache() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    seed_asset(&store, "/uploads/pic.png");
    api.uploads
        .lock()
        .unwrap()
        .insert("/uploads/pic.png".into(), vec![1, 2, 3]);

    let (prefetcher, _online) = prefetcher(store.clone(), api, Arc::new(NoHints), true);
    let report = prefetcher.tick().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.failed, 0);

    let asset = store.get_media_asset("/uploads/pic.png").unwrap().unwrap();
    assert_eq!(asset.status, MediaStatus::Ok);
    assert_eq!(asset.fetched_at_ms, Some(42));
    let blob = store.get_media_blob("/uploads/pic.png").unwrap().unwrap();
    assert_eq!(blob.bytes, vec![1, 2, 3]);
    assert_eq!(blob.mime.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn cached_blob_skips_the_network() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    seed_asset(&store, "/uploads/pic.png");
    // Blob already cached; the scripted server has no copy, so a network
    // attempt would fail.
    store
        .put_media_blob("/uploads/pic.png", &[9], Some("image/png"), 1)
        .unwrap();

    let (prefetcher, _online) = prefetcher(store.clone(), api.clone(), Arc::new(NoHints), true);
    let report = prefetcher.tick().await.unwrap();
    assert_eq!(report.cache_hits, 1);
    assert_eq!(report.failed, 0);
    assert!(api.calls().is_empty());
    assert_eq!(
        store
            .get_media_asset("/uploads/pic.png")
            .unwrap()
            .unwrap()
            .status,
        MediaStatus::Ok
    );
}

#[tokio::test]
async fn failures_count_and_eventually_retire_an_asset() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    seed_asset(&store, "/uploads/missing.png");

    let (prefetcher, _online) = prefetcher(store.clone(), api, Arc::new(NoHints), true);
    for expected in 1..=5 {
        let report = prefetcher.tick().await.unwrap();
        assert_eq!(report.failed, 1, "attempt {expected}");
        let asset = store
            .get_media_asset("/uploads/missing.png")
            .unwrap()
            .unwrap();
        assert_eq!(asset.status, MediaStatus::Error);
        assert_eq!(asset.fail_count, expected);
        assert!(asset.last_error.is_some());
    }

    // Capped: the sixth tick no longer sees the asset.
    let report = prefetcher.tick().await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn paused_and_offline_ticks_do_nothing() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    seed_asset(&store, "/uploads/pic.png");

    let (prefetcher, online) = prefetcher(store.clone(), api.clone(), Arc::new(NoHints), false);
    let report = prefetcher.tick().await.unwrap();
    assert!(report.offline);
    assert!(api.calls().is_empty());

    online.send(true).unwrap();
    store.set_media_prefetch_paused(true).unwrap();
    let report = prefetcher.tick().await.unwrap();
    assert!(report.paused);
    assert!(api.calls().is_empty());

    store.set_media_prefetch_paused(false).unwrap();
    api.uploads
        .lock()
        .unwrap()
        .insert("/uploads/pic.png".into(), vec![7]);
    let report = prefetcher.tick().await.unwrap();
    assert_eq!(report.fetched, 1);
}

#[tokio::test]
async fn concurrency_adapts_to_network_hints() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();

    let (fast, _a) = prefetcher(store.clone(), api.clone(), Arc::new(NoHints), true);
    assert_eq!(fast.concurrency(), 3);
    let (slow, _b) = prefetcher(store.clone(), api.clone(), Arc::new(SlowLink), true);
    assert_eq!(slow.concurrency(), 1);
    let (saver, _c) = prefetcher(store, api, Arc::new(DataSaver), true);
    assert_eq!(saver.concurrency(), 1);
}
