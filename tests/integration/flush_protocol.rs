mod common;

use std::sync::Arc;

use common::{
    doc_with_sections, engine_with, open_store, server_article, ScriptErr, ScriptedApi,
};
use serde_json::json;
use tempfile::tempdir;

use arbor::clock::ManualClock;
use arbor::doc::{extract_sections, flatten_structure};
use arbor::store::OpType;
use arbor::sync::wire::{
    CompactResponse, SnapshotResponse, SnapshotStatus, UpsertAck, UpsertResult,
};
use arbor::SyncEvent;

const T0: &str = "2024-06-01T00:00:00Z";

fn setup() -> (
    tempfile::TempDir,
    Arc<arbor::Store>,
    Arc<ScriptedApi>,
    Arc<ManualClock>,
    Arc<arbor::SyncEngine>,
) {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let api = ScriptedApi::new();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let engine = engine_with(store.clone(), api.clone(), clock.clone());
    (dir, store, api, clock, engine)
}

/// Scenario E1: an offline edit flushes as compact-then-structure, and the
/// cache converges on the server's timestamps with the draft cleared.
#[tokio::test]
async fn offline_edit_flushes_in_order() {
    let (_dir, store, api, _clock, engine) = setup();
    let doc = doc_with_sections(&[("s1", "Hello", "world")]);
    store.cache_article(&server_article("a1", T0, Some(doc.clone()))).unwrap();

    let edited = doc_with_sections(&[("s1", "Hello v2", "world v2")]);
    engine.stage_local_doc("a1", &edited).unwrap();
    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("Hello v2"),
            arbor::doc::body_with_text("world v2"),
        )
        .unwrap();
    engine
        .enqueue_structure_snapshot("a1", flatten_structure(&edited))
        .unwrap();
    assert!(store.get_cached_article("a1").unwrap().unwrap().local_draft);

    let report = engine.flush_outbox_once().await.unwrap();
    assert_eq!(report.acked, 2);
    assert_eq!(report.conflicts, 0);

    // Compact first, snapshot strictly after.
    let calls = api.calls();
    let compact_at = calls.iter().position(|c| c == "compact:a1").unwrap();
    let snapshot_at = calls.iter().position(|c| c == "snapshot:a1").unwrap();
    assert!(compact_at < snapshot_at);

    let upsert_seq = api.compact_requests.lock().unwrap()[0].1.upserts[0].seq;
    assert_eq!(upsert_seq, 1);

    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert!(!got.local_draft);
    assert!(got.updated_at > T0.to_string());
    assert_eq!(got.outline_structure_rev, 1);
    assert!(store.read_ops(50).unwrap().is_empty());
    let rows = extract_sections(&got.doc_json.unwrap());
    assert_eq!(rows[0].title, "Hello v2");
}

/// Scenario E2: a conflicting upsert is preserved as a sibling copy and
/// re-queued; subscribers hear about it.
#[tokio::test]
async fn conflict_materializes_a_copy() {
    let (_dir, store, api, _clock, engine) = setup();
    let doc = doc_with_sections(&[("s1", "Mine", "local body")]);
    store.cache_article(&server_article("a1", T0, Some(doc.clone()))).unwrap();
    let mut events = engine.subscribe();

    let op_id = engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("Mine"),
            arbor::doc::body_with_text("local body"),
        )
        .unwrap();
    api.compact_script.lock().unwrap().push_back(Ok(CompactResponse {
        updated_at: "2024-06-01T00:05:00Z".into(),
        delete_acks: vec![],
        upsert_acks: vec![UpsertAck {
            op_id,
            section_id: "s1".into(),
            result: UpsertResult::Conflict,
        }],
    }));

    let report = engine.flush_outbox_once().await.unwrap();
    assert_eq!(report.conflicts, 1);

    // The copy sits right after the original, marked in the heading.
    let got = store.get_cached_article("a1").unwrap().unwrap();
    let rows = extract_sections(&got.doc_json.unwrap());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].section_id, "s1");
    let copy = &rows[1];
    assert_ne!(copy.section_id, "s1");
    assert!(copy.title.starts_with("Conflict copy: "), "{}", copy.title);
    assert!(copy.title.contains("Mine"));

    // The copy's sequence starts fresh.
    assert_eq!(
        store.current_section_seq("a1", &copy.section_id).unwrap(),
        Some(1)
    );

    let event = events.try_recv().ok().and_then(|e| match e {
        SyncEvent::OutlineSyncConflict {
            article_id,
            original_section_id,
            conflict_copy_section_id,
        } => Some((article_id, original_section_id, conflict_copy_section_id)),
        _ => None,
    });
    let (article_id, original, copy_id) = event.expect("conflict event");
    assert_eq!(article_id, "a1");
    assert_eq!(original, "s1");
    assert_eq!(copy_id, copy.section_id);
}

/// Scenario E3 (and boundary 14): a queued delete wins over a queued
/// upsert for the same section; the transport carries only the delete.
#[tokio::test]
async fn delete_beats_queued_upsert() {
    let (_dir, store, api, _clock, engine) = setup();
    let doc = doc_with_sections(&[("s1", "Doomed", ""), ("s2", "Stays", "")]);
    store.cache_article(&server_article("a1", T0, Some(doc))).unwrap();

    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("Doomed"),
            arbor::doc::body_with_text("edit"),
        )
        .unwrap();
    engine
        .enqueue_delete_sections("a1", vec!["s1".into()])
        .unwrap();

    engine.flush_outbox_once().await.unwrap();

    let reqs = api.compact_requests.lock().unwrap();
    assert_eq!(reqs.len(), 1);
    let (_, req) = &reqs[0];
    assert!(req.upserts.is_empty());
    assert_eq!(req.deletes.len(), 1);
    assert_eq!(req.deletes[0].section_ids, vec!["s1".to_string()]);
    drop(reqs);

    assert!(store.read_ops(50).unwrap().is_empty());
    let got = store.get_cached_article("a1").unwrap().unwrap();
    let ids: Vec<String> = extract_sections(&got.doc_json.unwrap())
        .into_iter()
        .map(|r| r.section_id)
        .collect();
    assert_eq!(ids, vec!["s2"]);
}

/// Scenario E4: a stale structure snapshot stays queued and resends with
/// the refreshed base revision.
#[tokio::test]
async fn stale_structure_retries_after_refresh() {
    let (_dir, store, api, clock, engine) = setup();
    let doc = doc_with_sections(&[("s1", "x", "")]);
    let mut art = server_article("a1", T0, Some(doc.clone()));
    art.outline_structure_rev = 7;
    store.cache_article(&art).unwrap();

    engine
        .enqueue_structure_snapshot("a1", flatten_structure(&doc))
        .unwrap();
    api.snapshot_script.lock().unwrap().push_back(Ok(SnapshotResponse {
        status: SnapshotStatus::Stale,
        updated_at: None,
        new_structure_rev: None,
        current_structure_rev: Some(9),
    }));

    engine.flush_outbox_once().await.unwrap();
    assert_eq!(api.snapshot_requests.lock().unwrap()[0].1.base_structure_rev, Some(7));
    let ops = store.read_ops(50).unwrap();
    assert_eq!(ops.len(), 1, "stale snapshot stays queued");
    assert_eq!(ops[0].attempts, 1);

    // A pull refreshes the local revision (same updatedAt: draftless
    // accept path), then the next flush resends and succeeds.
    let mut refreshed = server_article("a1", "2024-06-01T00:06:00Z", Some(doc));
    refreshed.outline_structure_rev = 9;
    store.cache_article(&refreshed).unwrap();

    clock.advance(10_000);
    engine.flush_outbox_once().await.unwrap();
    let reqs = api.snapshot_requests.lock().unwrap();
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[1].1.base_structure_rev, Some(9));
    drop(reqs);
    assert!(store.read_ops(50).unwrap().is_empty());
    assert_eq!(
        store.get_cached_article("a1").unwrap().unwrap().outline_structure_rev,
        10
    );
}

/// Boundary 13: flushing while offline has no transport side effects.
#[tokio::test]
async fn offline_flush_is_inert() {
    let (_dir, store, api, _clock, engine) = setup();
    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("x"),
            arbor::doc::body_with_text(""),
        )
        .unwrap();
    engine.set_online(false);

    let report = engine.flush_outbox_once().await.unwrap();
    assert!(report.skipped_offline);
    assert!(api.calls().is_empty());
    assert_eq!(store.read_ops(50).unwrap().len(), 1);
}

#[tokio::test]
async fn retryable_failure_stops_the_pass_and_keeps_ops() {
    let (_dir, store, api, _clock, engine) = setup();
    store
        .cache_article(&server_article("a1", T0, Some(doc_with_sections(&[("s1", "x", "")]))))
        .unwrap();
    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("x"),
            arbor::doc::body_with_text("y"),
        )
        .unwrap();
    api.compact_script
        .lock()
        .unwrap()
        .push_back(Err(ScriptErr::Retryable));

    let report = engine.flush_outbox_once().await.unwrap();
    assert!(report.stopped_retryable);
    let ops = store.read_ops(50).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].attempts, 1);
    assert!(ops[0].last_error.is_some());
}

#[tokio::test]
async fn auth_failure_blocks_the_queue_and_emits() {
    let (_dir, store, api, _clock, engine) = setup();
    let mut events = engine.subscribe();
    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("x"),
            arbor::doc::body_with_text(""),
        )
        .unwrap();
    api.compact_script
        .lock()
        .unwrap()
        .push_back(Err(ScriptErr::Auth));

    let report = engine.flush_outbox_once().await.unwrap();
    assert!(report.auth_required);
    assert_eq!(store.read_ops(50).unwrap().len(), 1);
    assert!(matches!(events.try_recv(), Ok(SyncEvent::AuthRequired)));
}

#[tokio::test]
async fn gone_target_drops_the_ops_silently() {
    let (_dir, store, api, _clock, engine) = setup();
    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("x"),
            arbor::doc::body_with_text(""),
        )
        .unwrap();
    api.compact_script
        .lock()
        .unwrap()
        .push_back(Err(ScriptErr::Gone));

    let report = engine.flush_outbox_once().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert!(store.read_ops(50).unwrap().is_empty());
}

/// The per-article throttle defers a second flush entry inside the
/// 2-second window.
#[tokio::test]
async fn per_article_flush_entries_are_throttled() {
    let (_dir, store, api, clock, engine) = setup();
    store
        .cache_article(&server_article("a1", T0, Some(doc_with_sections(&[("s1", "x", "")]))))
        .unwrap();
    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("one"),
            arbor::doc::body_with_text(""),
        )
        .unwrap();
    engine.flush_outbox_once().await.unwrap();
    assert_eq!(api.compact_requests.lock().unwrap().len(), 1);

    engine
        .enqueue_section_upsert(
            "a1",
            "s1",
            arbor::doc::heading_with_text("two"),
            arbor::doc::body_with_text(""),
        )
        .unwrap();
    engine.flush_outbox_once().await.unwrap();
    assert_eq!(
        api.compact_requests.lock().unwrap().len(),
        1,
        "second entry inside the window must wait"
    );

    clock.advance(2_100);
    engine.flush_outbox_once().await.unwrap();
    assert_eq!(api.compact_requests.lock().unwrap().len(), 2);
}

/// Non-outline tree ops drain one at a time after outline work.
#[tokio::test]
async fn article_ops_drain_after_outline_work() {
    let (_dir, store, api, _clock, engine) = setup();
    engine
        .enqueue_article_op(OpType::IndentArticle, "a1", json!({ "levels": 1 }))
        .unwrap();
    engine
        .enqueue_article_op(OpType::MoveArticleUp, "a2", json!({ "direction": "up" }))
        .unwrap();

    let report = engine.flush_outbox_once().await.unwrap();
    assert_eq!(report.acked, 2);
    let calls = api.calls();
    assert!(calls.contains(&"tree_op:a1:indent".to_string()));
    assert!(calls.contains(&"tree_op:a2:move".to_string()));
    assert!(store.read_ops(50).unwrap().is_empty());
}
