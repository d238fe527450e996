mod common;

use std::sync::Arc;

use common::{doc_with_sections, engine_with, open_store, server_article, ScriptedApi};
use tempfile::tempdir;

use arbor::clock::ManualClock;
use arbor::doc::extract_sections;
use arbor::store::OpType;
use arbor::QuickNotesBridge;

#[tokio::test]
async fn pending_notes_enqueue_oldest_first_with_fresh_seqs() {
    // Scenario E5.
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = engine_with(store.clone(), api.clone(), clock.clone());
    let bridge = QuickNotesBridge::new(store.clone(), clock.clone());

    let n1 = bridge.capture("first").unwrap();
    clock.advance(10);
    let n2 = bridge.capture("second").unwrap();
    clock.advance(10);
    let n3 = bridge.capture("third").unwrap();

    let queued = bridge.enqueue_pending_for_sync(&engine).unwrap();
    assert_eq!(queued, 3);

    let ops = store.read_ops(50).unwrap();
    assert_eq!(ops.len(), 3);
    let ids: Vec<&str> = ops.iter().map(|o| o.payload["sectionId"].as_str().unwrap()).collect();
    assert_eq!(ids, vec![n1.as_str(), n2.as_str(), n3.as_str()]);
    for op in &ops {
        assert_eq!(op.op_type, OpType::SectionUpsertContent);
        assert_eq!(op.article_id, "inbox");
        assert_eq!(op.payload["seq"], 1);
    }
}

#[tokio::test]
async fn flush_drains_acknowledged_notes() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = engine_with(store.clone(), api.clone(), clock.clone());
    let bridge = QuickNotesBridge::new(store.clone(), clock.clone());

    bridge.capture("offline thought").unwrap();
    bridge.enqueue_pending_for_sync(&engine).unwrap();
    assert_eq!(store.list_quick_notes().unwrap().len(), 1);

    engine.flush_outbox_once().await.unwrap();
    assert!(store.read_ops(50).unwrap().is_empty());
    assert!(store.list_quick_notes().unwrap().is_empty());
}

#[test]
fn overlay_shows_pending_notes_newest_first() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let clock = Arc::new(ManualClock::new(1_000));
    let bridge = QuickNotesBridge::new(store.clone(), clock.clone());

    store
        .cache_article_under_id(
            &server_article(
                "inbox",
                "2024-06-01T00:01:00Z",
                Some(doc_with_sections(&[("old", "synced note", "")])),
            ),
            "inbox",
        )
        .unwrap();

    let a = bridge.capture("alpha").unwrap();
    clock.advance(5);
    let b = bridge.capture("beta").unwrap();

    let cached = store.get_cached_article("inbox").unwrap().unwrap();
    let overlaid = bridge.overlay_inbox_doc(cached.doc_json.as_ref()).unwrap();
    let rows = extract_sections(&overlaid);
    let ids: Vec<&str> = rows.iter().map(|r| r.section_id.as_str()).collect();
    assert_eq!(ids, vec![b.as_str(), a.as_str(), "old"]);
    assert_eq!(rows[0].title, "beta");
}

#[test]
fn overlay_skips_notes_already_in_the_tree() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let clock = Arc::new(ManualClock::new(1_000));
    let bridge = QuickNotesBridge::new(store.clone(), clock);

    let id = bridge.capture("note").unwrap();
    let synced = doc_with_sections(&[(id.as_str(), "note", "")]);
    let overlaid = bridge.overlay_inbox_doc(Some(&synced)).unwrap();
    assert_eq!(extract_sections(&overlaid).len(), 1);
}
