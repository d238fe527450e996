mod common;

use std::collections::HashSet;

use common::open_store;
use proptest::prelude::*;
use serde_json::json;
use tempfile::tempdir;

use arbor::store::{EnqueueRequest, OpType};

fn upsert_req(article: &str, key: Option<&str>, n: u64) -> EnqueueRequest {
    EnqueueRequest {
        op_type: OpType::SectionUpsertContent,
        article_id: article.to_string(),
        payload: json!({ "n": n }),
        coalesce_key: key.map(str::to_string),
    }
}

#[test]
fn reads_are_oldest_first() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    store.enqueue_op(upsert_req("a1", None, 1), 300).unwrap();
    store.enqueue_op(upsert_req("a1", None, 2), 100).unwrap();
    store.enqueue_op(upsert_req("a1", None, 3), 200).unwrap();

    let ops = store.read_ops(50).unwrap();
    let ns: Vec<u64> = ops.iter().map(|o| o.payload["n"].as_u64().unwrap()).collect();
    assert_eq!(ns, vec![2, 3, 1]);
}

#[test]
fn coalescing_supersedes_prior_ops() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    store
        .enqueue_op(upsert_req("a1", Some("k:s1"), 1), 1)
        .unwrap();
    store
        .enqueue_op(upsert_req("a1", Some("k:s1"), 2), 2)
        .unwrap();
    let kept = store
        .enqueue_op(upsert_req("a1", Some("k:s1"), 3), 3)
        .unwrap();

    let ops = store.read_ops(50).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].id, kept);
    assert_eq!(ops[0].payload["n"], 3);
}

#[test]
fn coalescing_is_scoped_to_type_article_and_key() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    store.enqueue_op(upsert_req("a1", Some("k"), 1), 1).unwrap();
    store.enqueue_op(upsert_req("a2", Some("k"), 2), 2).unwrap();
    let mut other_type = upsert_req("a1", Some("k"), 3);
    other_type.op_type = OpType::StructureSnapshot;
    store.enqueue_op(other_type, 3).unwrap();

    assert_eq!(store.read_ops(50).unwrap().len(), 3);
}

#[test]
fn error_marking_counts_attempts() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let id = store.enqueue_op(upsert_req("a1", None, 1), 1).unwrap();
    store.mark_outbox_error(&id, "http 503", 10).unwrap();
    store.mark_outbox_error(&id, "offline", 20).unwrap();

    let op = &store.read_ops(50).unwrap()[0];
    assert_eq!(op.attempts, 2);
    assert_eq!(op.last_error.as_deref(), Some("offline"));
    assert_eq!(op.last_attempt_at_ms, Some(20));
}

#[test]
fn removal_is_unconditional() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let id = store.enqueue_op(upsert_req("a1", None, 1), 1).unwrap();
    store.remove_outbox_op(&id).unwrap();
    assert!(store.read_ops(50).unwrap().is_empty());
}

#[test]
fn outbox_changed_signal_bumps_on_writes() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let rx = store.outbox_changed();
    let before = *rx.borrow();
    let id = store.enqueue_op(upsert_req("a1", None, 1), 1).unwrap();
    assert!(*rx.borrow() > before);
    let mid = *rx.borrow();
    store.remove_outbox_op(&id).unwrap();
    assert!(*rx.borrow() > mid);
}

#[test]
fn section_seqs_strictly_increase() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let a = store.next_section_seq("a1", "s1").unwrap();
    let b = store.next_section_seq("a1", "s1").unwrap();
    let c = store.next_section_seq("a1", "s1").unwrap();
    assert!(a < b && b < c);
    assert_eq!(a, 1);

    // Independent per section.
    assert_eq!(store.next_section_seq("a1", "s2").unwrap(), 1);
    assert_eq!(store.next_section_seq("a2", "s1").unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// After any sequence of enqueues, at most one op exists per
    /// (type, articleId, coalesceKey).
    #[test]
    fn at_most_one_op_per_coalesce_key(
        script in proptest::collection::vec((0u8..3, 0u8..3, proptest::bool::ANY), 1..40)
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for (i, (article, key, coalesce)) in script.iter().enumerate() {
            let article_id = format!("a{article}");
            let key = coalesce.then(|| format!("k{key}"));
            store
                .enqueue_op(upsert_req(&article_id, key.as_deref(), i as u64), i as u64)
                .unwrap();
        }
        let ops = store.read_ops(500).unwrap();
        let mut seen = HashSet::new();
        for op in ops.iter().filter(|o| o.coalesce_key.is_some()) {
            let slot = (
                op.op_type.as_str(),
                op.article_id.clone(),
                op.coalesce_key.clone(),
            );
            prop_assert!(seen.insert(slot), "duplicate op for a coalesce key");
        }
    }
}
