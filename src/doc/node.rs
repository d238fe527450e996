use serde_json::{json, Map, Value};
use xxhash_rust::xxh64::xxh64;

use super::{
    ATTR_COLLAPSED, ATTR_SECTION_ID, TYPE_BODY, TYPE_CHILDREN, TYPE_DOC, TYPE_HEADING,
    TYPE_SECTION, TYPE_TEXT,
};

pub fn node_type(node: &Value) -> Option<&str> {
    node.get("type").and_then(Value::as_str)
}

pub fn attr_str<'a>(node: &'a Value, name: &str) -> Option<&'a str> {
    node.get("attrs").and_then(|a| a.get(name)).and_then(Value::as_str)
}

/// The stable identity of an `outlineSection` node.
pub fn section_id(node: &Value) -> Option<&str> {
    if node_type(node) == Some(TYPE_SECTION) {
        attr_str(node, ATTR_SECTION_ID)
    } else {
        None
    }
}

pub fn collapsed(node: &Value) -> bool {
    node.get("attrs")
        .and_then(|a| a.get(ATTR_COLLAPSED))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn content(node: &Value) -> Option<&Vec<Value>> {
    node.get("content").and_then(Value::as_array)
}

pub fn content_mut(node: &mut Value) -> Option<&mut Vec<Value>> {
    node.get_mut("content").and_then(Value::as_array_mut)
}

/// First direct child of the given node type, if any.
pub fn child_of_type<'a>(node: &'a Value, ty: &str) -> Option<&'a Value> {
    content(node)?.iter().find(|c| node_type(c) == Some(ty))
}

pub(crate) fn child_of_type_mut<'a>(node: &'a mut Value, ty: &str) -> Option<&'a mut Value> {
    content_mut(node)?.iter_mut().find(|c| node_type(c) == Some(ty))
}

/// Concatenates every `text` leaf under `node`, stack-driven.
pub fn plain_text(node: &Value) -> String {
    let mut out = String::new();
    let mut stack: Vec<&Value> = vec![node];
    while let Some(cur) = stack.pop() {
        if node_type(cur) == Some(TYPE_TEXT) {
            if let Some(text) = cur.get("text").and_then(Value::as_str) {
                if !out.is_empty() && !out.ends_with(' ') {
                    out.push(' ');
                }
                out.push_str(text);
            }
        }
        if let Some(children) = content(cur) {
            for child in children.iter().rev() {
                stack.push(child);
            }
        }
    }
    out.trim().to_string()
}

/// Content hash of a document tree, used by the local-draft comparison.
pub fn doc_hash(doc: &Value) -> u64 {
    // serde_json serialization of the same in-memory tree is stable; two
    // structurally equal trees built through the same paths hash equal.
    let bytes = serde_json::to_vec(doc).unwrap_or_default();
    xxh64(&bytes, 0)
}

pub fn empty_doc() -> Value {
    json!({ "type": TYPE_DOC, "content": [] })
}

pub fn heading_with_text(text: &str) -> Value {
    let content = if text.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "type": TYPE_TEXT, "text": text })]
    };
    json!({ "type": TYPE_HEADING, "content": content })
}

pub fn body_with_text(text: &str) -> Value {
    let content = if text.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "type": TYPE_TEXT, "text": text })]
    };
    json!({ "type": TYPE_BODY, "content": [
        { "type": "paragraph", "content": content }
    ]})
}

/// Builds a fresh section node from a heading and body.
///
/// `body` must already be an `outlineBody` node; the children container is
/// created empty.
pub fn build_section(section_id: &str, heading: Value, body: Value) -> Value {
    let mut attrs = Map::new();
    attrs.insert(ATTR_SECTION_ID.into(), Value::String(section_id.to_string()));
    attrs.insert(ATTR_COLLAPSED.into(), Value::Bool(false));
    json!({
        "type": TYPE_SECTION,
        "attrs": Value::Object(attrs),
        "content": [
            heading,
            body,
            { "type": TYPE_CHILDREN, "content": [] }
        ]
    })
}
