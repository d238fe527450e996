mod common;

use std::collections::HashSet;

use common::{doc_with_sections, section_node};
use serde_json::json;

use arbor::doc::{
    apply_section_upsert, apply_structure, body_with_text, doc_hash, extract_sections,
    extract_tags, extract_upload_refs, flatten_structure, heading_with_text,
    insert_section_after, remove_sections, StructureNode,
};

fn node(section_id: &str, parent_id: Option<&str>, position: i64) -> StructureNode {
    StructureNode {
        section_id: section_id.to_string(),
        parent_id: parent_id.map(str::to_string),
        position,
        collapsed: false,
    }
}

#[test]
fn sections_extract_title_and_joined_text() {
    let doc = doc_with_sections(&[("s1", "Title", "Body text"), ("s2", "Only", "")]);
    let rows = extract_sections(&doc);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].section_id, "s1");
    assert_eq!(rows[0].title, "Title");
    assert_eq!(rows[0].text, "Title Body text");
    assert_eq!(rows[1].text, "Only");
}

#[test]
fn upsert_then_extract_round_trips() {
    let mut doc = doc_with_sections(&[("s1", "old", "old body")]);
    assert!(apply_section_upsert(
        &mut doc,
        "s1",
        heading_with_text("new title"),
        body_with_text("new body"),
    ));
    let rows = extract_sections(&doc);
    assert_eq!(rows[0].title, "new title");
    assert_eq!(rows[0].text, "new title new body");
}

#[test]
fn upsert_preserves_the_children_subtree() {
    let mut parent = section_node("p", "parent", "body");
    parent["content"][2]["content"] = json!([section_node("c", "child", "")]);
    let mut doc = json!({ "type": "doc", "content": [parent] });

    assert!(apply_section_upsert(
        &mut doc,
        "p",
        heading_with_text("renamed"),
        body_with_text(""),
    ));
    let ids: Vec<String> = extract_sections(&doc)
        .into_iter()
        .map(|r| r.section_id)
        .collect();
    assert_eq!(ids, vec!["p", "c"]);
}

#[test]
fn upsert_of_unknown_section_reports_false() {
    let mut doc = doc_with_sections(&[("s1", "x", "")]);
    assert!(!apply_section_upsert(
        &mut doc,
        "nope",
        heading_with_text("y"),
        body_with_text(""),
    ));
}

#[test]
fn remove_sections_filters_whole_subtrees() {
    let mut parent = section_node("p", "parent", "");
    parent["content"][2]["content"] = json!([section_node("c", "child", "")]);
    let mut doc = json!({ "type": "doc", "content": [parent, section_node("s", "sib", "")] });

    let doomed: HashSet<String> = ["p".to_string()].into_iter().collect();
    remove_sections(&mut doc, &doomed);
    let ids: Vec<String> = extract_sections(&doc)
        .into_iter()
        .map(|r| r.section_id)
        .collect();
    assert_eq!(ids, vec!["s"]);
}

#[test]
fn insert_after_lands_next_to_the_sibling() {
    let mut doc = doc_with_sections(&[("s1", "a", ""), ("s2", "b", "")]);
    assert!(insert_section_after(
        &mut doc,
        "s1",
        section_node("s1b", "between", ""),
    ));
    let ids: Vec<String> = extract_sections(&doc)
        .into_iter()
        .map(|r| r.section_id)
        .collect();
    assert_eq!(ids, vec!["s1", "s1b", "s2"]);
}

#[test]
fn upload_refs_are_filtered_to_the_uploads_prefix() {
    let doc = json!({
        "type": "doc",
        "content": [
            { "type": "image", "attrs": { "src": "/uploads/a.png" } },
            { "type": "image", "attrs": { "src": "https://elsewhere.example/b.png" } },
            { "type": "image", "attrs": { "src": "/uploads/a.png" } }
        ]
    });
    let refs = extract_upload_refs(&doc, "/uploads/");
    assert_eq!(refs.len(), 1);
    assert!(refs.contains("/uploads/a.png"));
}

#[test]
fn hashtags_are_collected_case_insensitively() {
    let doc = doc_with_sections(&[("s1", "notes #Rust", "about #rust and #wal-mode, x#not")]);
    let tags = extract_tags(&doc);
    let keys: Vec<&str> = tags.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys.iter().filter(|k| **k == "rust").count(), 2);
    assert!(keys.contains(&"wal-mode"));
    assert!(!keys.contains(&"not"));
}

#[test]
fn structure_reshapes_nesting_and_order() {
    let mut doc = doc_with_sections(&[("a", "a", ""), ("b", "b", ""), ("c", "c", "")]);
    // b becomes a child of a; c moves before a at the root.
    let nodes = vec![
        node("a", None, 1),
        node("b", Some("a"), 0),
        node("c", None, 0),
    ];
    apply_structure(&mut doc, &nodes);

    let flat = flatten_structure(&doc);
    let order: Vec<(&str, Option<&str>)> = flat
        .iter()
        .map(|n| (n.section_id.as_str(), n.parent_id.as_deref()))
        .collect();
    assert_eq!(
        order,
        vec![("c", None), ("a", None), ("b", Some("a"))]
    );
}

#[test]
fn applying_the_same_snapshot_twice_is_a_no_op() {
    let mut doc = doc_with_sections(&[("a", "a", ""), ("b", "b", ""), ("c", "c", "")]);
    let nodes = vec![
        node("b", None, 0),
        node("a", Some("b"), 0),
        node("c", Some("b"), 1),
    ];
    apply_structure(&mut doc, &nodes);
    let first = doc_hash(&doc);
    apply_structure(&mut doc, &nodes);
    assert_eq!(doc_hash(&doc), first);
}

#[test]
fn unmentioned_sections_are_appended_to_the_root() {
    let mut doc = doc_with_sections(&[("a", "a", ""), ("orphan", "o", "")]);
    let outcome = apply_structure(&mut doc, &[node("a", None, 0)]);
    assert_eq!(outcome.orphans_appended, 1);
    let ids: Vec<String> = extract_sections(&doc)
        .into_iter()
        .map(|r| r.section_id)
        .collect();
    assert_eq!(ids, vec!["a", "orphan"]);
}

#[test]
fn snapshot_rows_missing_locally_are_counted() {
    let mut doc = doc_with_sections(&[("a", "a", "")]);
    let outcome = apply_structure(&mut doc, &[node("a", None, 0), node("ghost", None, 1)]);
    assert_eq!(outcome.missing, 1);
    assert_eq!(outcome.placed, 1);
}

#[test]
fn flatten_assigns_dense_positions_per_sibling_group() {
    let mut parent = section_node("p", "p", "");
    parent["content"][2]["content"] =
        json!([section_node("c1", "", ""), section_node("c2", "", "")]);
    let doc = json!({ "type": "doc", "content": [parent, section_node("r2", "", "")] });

    let flat = flatten_structure(&doc);
    let find = |id: &str| flat.iter().find(|n| n.section_id == id).unwrap();
    assert_eq!(find("p").position, 0);
    assert_eq!(find("r2").position, 1);
    assert_eq!(find("c1").position, 0);
    assert_eq!(find("c2").position, 1);
    assert_eq!(find("c1").parent_id.as_deref(), Some("p"));
}
