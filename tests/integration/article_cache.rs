mod common;

use common::{doc_with_sections, open_store, server_article};
use serde_json::json;
use tempfile::tempdir;

use arbor::store::{CacheWriteOutcome, EnqueueRequest, OpType};

#[test]
fn cache_and_read_round_trip() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let doc = doc_with_sections(&[("s1", "Hello", "world")]);
    let article = server_article("a1", "2024-06-01T00:01:00Z", Some(doc.clone()));
    assert_eq!(
        store.cache_article(&article).unwrap(),
        CacheWriteOutcome::Inserted
    );

    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert_eq!(got.title, "Article a1");
    assert_eq!(got.updated_at, "2024-06-01T00:01:00Z");
    assert_eq!(got.doc_json.unwrap(), doc);
    assert!(!got.local_draft);
}

#[test]
fn updated_at_never_regresses() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    store
        .cache_article(&server_article("a1", "2024-06-01T00:05:00Z", None))
        .unwrap();

    let outcome = store
        .cache_article(&server_article("a1", "2024-06-01T00:01:00Z", None))
        .unwrap();
    assert_eq!(outcome, CacheWriteOutcome::SkippedOlder);
    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert_eq!(got.updated_at, "2024-06-01T00:05:00Z");
}

#[test]
fn local_draft_protected_while_outline_ops_pending() {
    // Scenario E6, pending-ops branch.
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let t = "2024-06-01T00:01:00Z";
    store
        .cache_article(&server_article("a1", t, Some(doc_with_sections(&[("s1", "x", "")]))))
        .unwrap();

    let local = doc_with_sections(&[("s1", "local edit", "body")]);
    store
        .update_cached_doc_json("a1", Some(&local), None)
        .unwrap();
    assert!(store.get_cached_article("a1").unwrap().unwrap().local_draft);

    store
        .enqueue_op(
            EnqueueRequest {
                op_type: OpType::SectionUpsertContent,
                article_id: "a1".into(),
                payload: json!({"sectionId": "s1"}),
                coalesce_key: None,
            },
            1,
        )
        .unwrap();

    // Same updatedAt, different server doc: scalars merge, tree survives.
    let mut incoming = server_article("a1", t, Some(doc_with_sections(&[("s1", "server", "")])));
    incoming.title = "Renamed".into();
    incoming.outline_structure_rev = 4;
    let outcome = store.cache_article(&incoming).unwrap();
    assert_eq!(outcome, CacheWriteOutcome::MergedScalars);

    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert!(got.local_draft);
    assert_eq!(got.title, "Renamed");
    assert_eq!(got.outline_structure_rev, 4);
    assert_eq!(got.doc_json.unwrap(), local);
}

#[test]
fn confirmed_draft_yields_to_the_server_copy() {
    // Scenario E6, empty-outbox branch: keeping the draft would resurrect
    // deleted content on reload.
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let t = "2024-06-01T00:01:00Z";
    store
        .cache_article(&server_article("a1", t, Some(doc_with_sections(&[("s1", "x", "")]))))
        .unwrap();
    let local = doc_with_sections(&[("s1", "local", ""), ("s2", "extra", "")]);
    store
        .update_cached_doc_json("a1", Some(&local), None)
        .unwrap();

    let server_doc = doc_with_sections(&[("s1", "server", "")]);
    let outcome = store
        .cache_article(&server_article("a1", t, Some(server_doc.clone())))
        .unwrap();
    assert_eq!(outcome, CacheWriteOutcome::Accepted);

    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert!(!got.local_draft);
    assert_eq!(got.doc_json.unwrap(), server_doc);
}

#[test]
fn local_save_never_clears_updated_at() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let t = "2024-06-01T00:01:00Z";
    store.cache_article(&server_article("a1", t, None)).unwrap();

    store
        .update_cached_doc_json("a1", Some(&doc_with_sections(&[("s1", "x", "")])), None)
        .unwrap();
    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert_eq!(got.updated_at, t);
    assert!(got.local_draft);
}

#[test]
fn derived_indices_follow_every_cache_write() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let doc = json!({
        "type": "doc",
        "content": [
            {
                "type": "outlineSection",
                "attrs": { "sectionId": "s1", "collapsed": false },
                "content": [
                    { "type": "outlineHeading", "content": [ { "type": "text", "text": "Pets #cats" } ] },
                    { "type": "outlineBody", "content": [
                        { "type": "paragraph", "content": [
                            { "type": "text", "text": "see #cats and #dogs" },
                            { "type": "image", "attrs": { "src": "/uploads/cat.png" } }
                        ]}
                    ]},
                    { "type": "outlineChildren", "content": [
                        {
                            "type": "outlineSection",
                            "attrs": { "sectionId": "s2", "collapsed": false },
                            "content": [
                                { "type": "outlineHeading", "content": [ { "type": "text", "text": "Nested" } ] },
                                { "type": "outlineBody", "content": [] },
                                { "type": "outlineChildren", "content": [] }
                            ]
                        }
                    ]}
                ]
            }
        ]
    });
    store
        .cache_article(&server_article("a1", "2024-06-01T00:01:00Z", Some(doc)))
        .unwrap();

    // Section rows mirror the tree.
    let sections = store.sections_for_article("a1").unwrap();
    let mut ids: Vec<&str> = sections.iter().map(|s| s.section_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["s1", "s2"]);
    let s1 = sections.iter().find(|s| s.section_id == "s1").unwrap();
    assert_eq!(s1.title, "Pets #cats");
    assert!(s1.text.contains("see #cats and #dogs"));

    // Media refs mirror the uploads referenced by the tree.
    let refs = store.media_refs_for_article("a1").unwrap();
    assert!(refs.contains("/uploads/cat.png"));
    assert!(store.get_media_asset("/uploads/cat.png").unwrap().is_some());

    // Tag counts aggregate over the article.
    let tags = store.tags_global(0).unwrap();
    let cats = tags.iter().find(|t| t.key == "cats").unwrap();
    assert_eq!(cats.count, 2);
    assert!(tags.iter().any(|t| t.key == "dogs"));

    // Replacing the doc rebuilds, rather than accumulates, the indices.
    let smaller = doc_with_sections(&[("s1", "only one", "")]);
    store
        .cache_article(&server_article(
            "a1",
            "2024-06-01T00:02:00Z",
            Some(smaller),
        ))
        .unwrap();
    assert_eq!(store.sections_for_article("a1").unwrap().len(), 1);
    assert!(store.media_refs_for_article("a1").unwrap().is_empty());
}

#[test]
fn index_rows_keep_cached_doc_and_rev() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let doc = doc_with_sections(&[("s1", "x", "")]);
    let mut art = server_article("a1", "2024-06-01T00:01:00Z", Some(doc.clone()));
    art.outline_structure_rev = 7;
    store.cache_article(&art).unwrap();

    store
        .cache_articles_index(&[common::index_row("a1", "2024-06-01T00:09:00Z")])
        .unwrap();
    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert_eq!(got.updated_at, "2024-06-01T00:09:00Z");
    assert_eq!(got.outline_structure_rev, 7);
    assert_eq!(got.doc_json.unwrap(), doc);
}

#[test]
fn structure_rev_is_monotonic() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    store
        .cache_article(&server_article("a1", "2024-06-01T00:01:00Z", None))
        .unwrap();
    store
        .touch_cached_article_outline_structure_rev("a1", 5)
        .unwrap();
    store
        .touch_cached_article_outline_structure_rev("a1", 3)
        .unwrap();
    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert_eq!(got.outline_structure_rev, 5);
}

#[test]
fn soft_delete_drops_derived_rows() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    store
        .cache_article(&server_article(
            "a1",
            "2024-06-01T00:01:00Z",
            Some(doc_with_sections(&[("s1", "x", "")])),
        ))
        .unwrap();
    assert_eq!(store.sections_for_article("a1").unwrap().len(), 1);

    store
        .mark_cached_article_deleted("a1", "2024-06-01T00:02:00Z")
        .unwrap();
    let got = store.get_cached_article("a1").unwrap().unwrap();
    assert_eq!(got.deleted_at.as_deref(), Some("2024-06-01T00:02:00Z"));
    assert!(store.sections_for_article("a1").unwrap().is_empty());
}
