use std::collections::BTreeSet;

use serde_json::Value;

use super::node::{child_of_type, collapsed, content, node_type, plain_text, section_id};
use super::{StructureNode, ATTR_SRC, TYPE_BODY, TYPE_CHILDREN, TYPE_HEADING, TYPE_IMAGE};

/// A derived index row for one outline section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRow {
    pub section_id: String,
    pub title: String,
    pub text: String,
}

/// One hashtag occurrence found in document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagOccurrence {
    /// Lowercased key used for counting.
    pub key: String,
    /// The label as typed, without the leading `#`.
    pub label: String,
}

/// Extracts `(sectionId, title, text)` rows from a document, preorder.
///
/// `title` is the heading's plain text; `text` is title plus body text,
/// which is what the search index stores.
pub fn extract_sections(doc: &Value) -> Vec<SectionRow> {
    let mut rows = Vec::new();
    let mut stack: Vec<&Value> = vec![doc];
    while let Some(node) = stack.pop() {
        if let Some(id) = section_id(node) {
            let title = child_of_type(node, TYPE_HEADING)
                .map(plain_text)
                .unwrap_or_default();
            let body = child_of_type(node, TYPE_BODY)
                .map(plain_text)
                .unwrap_or_default();
            let text = if body.is_empty() {
                title.clone()
            } else if title.is_empty() {
                body
            } else {
                format!("{title} {body}")
            };
            rows.push(SectionRow {
                section_id: id.to_string(),
                title,
                text,
            });
        }
        if let Some(children) = content(node) {
            for child in children.iter().rev() {
                stack.push(child);
            }
        }
    }
    rows
}

/// Extracts every `#tag` token from the document's text leaves.
pub fn extract_tags(doc: &Value) -> Vec<TagOccurrence> {
    let mut tags = Vec::new();
    let mut stack: Vec<&Value> = vec![doc];
    while let Some(node) = stack.pop() {
        if node_type(node) == Some(super::TYPE_TEXT) {
            if let Some(text) = node.get("text").and_then(Value::as_str) {
                scan_hashtags(text, &mut tags);
            }
        }
        if let Some(children) = content(node) {
            for child in children.iter().rev() {
                stack.push(child);
            }
        }
    }
    tags
}

fn scan_hashtags(text: &str, out: &mut Vec<TagOccurrence>) {
    let mut chars = text.char_indices().peekable();
    let mut prev: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        if c == '#' && prev.map_or(true, |p| !p.is_alphanumeric()) {
            let rest = &text[i + 1..];
            let end = rest
                .char_indices()
                .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '-'))
                .map(|(j, _)| j)
                .unwrap_or(rest.len());
            if end > 0 {
                let label = &rest[..end];
                out.push(TagOccurrence {
                    key: label.to_lowercase(),
                    label: label.to_string(),
                });
                // resume the scan past the tag body
                while chars.peek().map_or(false, |(j, _)| *j <= i + end) {
                    chars.next();
                }
            }
        }
        prev = Some(c);
    }
}

/// Collects `image.src` URLs under the uploads prefix, deduplicated.
pub fn extract_upload_refs(doc: &Value, uploads_prefix: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    let mut stack: Vec<&Value> = vec![doc];
    while let Some(node) = stack.pop() {
        if node_type(node) == Some(TYPE_IMAGE) {
            if let Some(src) = super::attr_str(node, ATTR_SRC) {
                if src.starts_with(uploads_prefix) {
                    refs.insert(src.to_string());
                }
            }
        }
        if let Some(children) = content(node) {
            for child in children.iter().rev() {
                stack.push(child);
            }
        }
    }
    refs
}

/// Flattens the tree into structural rows: `(sectionId, parentId,
/// position, collapsed)` with positions dense per sibling group.
pub fn flatten_structure(doc: &Value) -> Vec<StructureNode> {
    let mut rows = Vec::new();
    // (node, parent section id)
    let mut stack: Vec<(&Value, Option<String>)> = vec![(doc, None)];
    while let Some((node, parent)) = stack.pop() {
        let this_parent = match section_id(node) {
            Some(id) => {
                rows.push(StructureNode {
                    section_id: id.to_string(),
                    parent_id: parent.clone(),
                    position: 0,
                    collapsed: collapsed(node),
                });
                Some(id.to_string())
            }
            None => parent,
        };
        // Only descend into the children container of a section, or into
        // non-section wrappers (the doc root, headings are skipped anyway).
        if let Some(children) = content(node) {
            let descend_parent = if section_id(node).is_some() {
                // direct children of a section: only the children container
                for child in children.iter().rev() {
                    if node_type(child) == Some(TYPE_CHILDREN) {
                        stack.push((child, this_parent.clone()));
                    }
                }
                continue;
            } else {
                this_parent
            };
            for child in children.iter().rev() {
                stack.push((child, descend_parent.clone()));
            }
        }
    }
    // Dense positions per sibling group, preorder arrival order.
    let mut next_pos: std::collections::HashMap<Option<String>, i64> =
        std::collections::HashMap::new();
    for row in rows.iter_mut() {
        let slot = next_pos.entry(row.parent_id.clone()).or_insert(0);
        row.position = *slot;
        *slot += 1;
    }
    rows
}
