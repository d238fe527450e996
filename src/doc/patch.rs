use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::node::{child_of_type_mut, content_mut, node_type, section_id};
use super::{StructureNode, ATTR_COLLAPSED, TYPE_CHILDREN};

/// Replaces the heading and body of section `target`, preserving its
/// children subtree. Returns false when the section is not in the tree.
pub fn apply_section_upsert(
    doc: &mut Value,
    target: &str,
    heading: Value,
    body: Value,
) -> bool {
    let mut stack: Vec<&mut Value> = vec![doc];
    while let Some(node) = stack.pop() {
        if section_id(node) == Some(target) {
            let children = content_mut(node)
                .map(|c| {
                    c.iter()
                        .filter(|n| node_type(n) == Some(TYPE_CHILDREN))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let mut rebuilt = vec![heading, body];
            if children.is_empty() {
                rebuilt.push(serde_json::json!({ "type": TYPE_CHILDREN, "content": [] }));
            } else {
                rebuilt.extend(children);
            }
            node["content"] = Value::Array(rebuilt);
            return true;
        }
        if let Some(children) = content_mut(node) {
            for child in children.iter_mut() {
                stack.push(child);
            }
        }
    }
    false
}

/// Filters the given sections (and their whole subtrees) out of the tree.
/// Returns the number of nodes removed.
pub fn remove_sections(doc: &mut Value, ids: &HashSet<String>) -> usize {
    let mut removed = 0;
    let mut stack: Vec<&mut Value> = vec![doc];
    while let Some(node) = stack.pop() {
        if let Some(children) = content_mut(node) {
            let before = children.len();
            children.retain(|c| section_id(c).map_or(true, |id| !ids.contains(id)));
            removed += before - children.len();
            for child in children.iter_mut() {
                stack.push(child);
            }
        }
    }
    removed
}

/// Inserts `section` immediately after its sibling `after`. Returns false
/// when `after` is not in the tree (callers then append at the root).
pub fn insert_section_after(doc: &mut Value, after: &str, section: Value) -> bool {
    let mut stack: Vec<&mut Value> = vec![doc];
    while let Some(node) = stack.pop() {
        if let Some(children) = content_mut(node) {
            if let Some(idx) = children.iter().position(|c| section_id(c) == Some(after)) {
                children.insert(idx + 1, section);
                return true;
            }
            for child in children.iter_mut() {
                stack.push(child);
            }
        }
    }
    false
}

/// Result of reshaping a tree to a structural snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StructureOutcome {
    /// Sections attached at their declared spot.
    pub placed: usize,
    /// Snapshot rows naming sections the local tree does not hold.
    pub missing: usize,
    /// Local sections the snapshot did not mention, appended to the root.
    pub orphans_appended: usize,
}

/// Reshapes `doc` so every section mentioned by `nodes` hangs under its
/// declared parent at its declared position, siblings ordered by
/// `(position, sectionId)`. Applying the same snapshot twice is a no-op.
///
/// Sections present locally but unmentioned by the snapshot are appended
/// to the root rather than dropped; the count is reported and logged so a
/// stricter caller can alarm on it.
pub fn apply_structure(doc: &mut Value, nodes: &[StructureNode]) -> StructureOutcome {
    let mut outcome = StructureOutcome::default();

    // Detach every section from the tree. Children containers are emptied
    // since the snapshot dictates all parent/child edges.
    let mut detached: HashMap<String, Value> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    detach_sections(doc, &mut detached, &mut order);

    // Sibling groups sorted by (position, sectionId).
    let mut by_parent: HashMap<Option<String>, Vec<&StructureNode>> = HashMap::new();
    for n in nodes {
        by_parent.entry(n.parent_id.clone()).or_default().push(n);
    }
    for group in by_parent.values_mut() {
        group.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.section_id.cmp(&b.section_id))
        });
    }

    let mentioned: HashSet<&str> = nodes.iter().map(|n| n.section_id.as_str()).collect();

    // Attach bottom-up: a section is ready once all its mentioned children
    // are built. Kahn-style so arbitrarily deep trees need no recursion.
    let mut pending_children: HashMap<&str, usize> = HashMap::new();
    for n in nodes {
        pending_children.entry(n.section_id.as_str()).or_insert(0);
        if let Some(parent) = n.parent_id.as_deref() {
            if mentioned.contains(parent) {
                *pending_children.entry(parent).or_insert(0) += 1;
            }
        }
    }
    let mut ready: VecDeque<&str> = pending_children
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut built: HashMap<&str, Value> = HashMap::new();
    let mut resolved = 0usize;
    while let Some(id) = ready.pop_front() {
        resolved += 1;
        let row = nodes.iter().find(|n| n.section_id == id);
        let mut section = match detached.remove(id) {
            Some(s) => s,
            None => {
                outcome.missing += 1;
                debug!(section_id = id, "snapshot names a section missing locally");
                bubble_up(row, &mentioned, &mut pending_children, &mut ready);
                continue;
            }
        };
        if let Some(row) = row {
            set_collapsed(&mut section, row.collapsed);
        }
        let children: Vec<Value> = by_parent
            .get(&Some(id.to_string()))
            .map(|group| {
                group
                    .iter()
                    .filter_map(|child| built.remove(child.section_id.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(container) = child_of_type_mut(&mut section, TYPE_CHILDREN) {
            container["content"] = Value::Array(children);
        } else if let Some(c) = content_mut(&mut section) {
            c.push(serde_json::json!({ "type": TYPE_CHILDREN, "content": children }));
        }
        outcome.placed += 1;
        built.insert(id, section);
        bubble_up(row, &mentioned, &mut pending_children, &mut ready);
    }
    if resolved < pending_children.len() {
        warn!(
            unresolved = pending_children.len() - resolved,
            "structure snapshot contains a parent cycle; leftovers go to the root"
        );
    }

    // Root order: mentioned roots (parent null or unmentioned parent) by
    // (position, sectionId), then cycle leftovers, then local orphans.
    let mut roots: Vec<Value> = Vec::new();
    let mut root_rows: Vec<&StructureNode> = nodes
        .iter()
        .filter(|n| n.parent_id.as_deref().map_or(true, |p| !mentioned.contains(p)))
        .collect();
    root_rows.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then_with(|| a.section_id.cmp(&b.section_id))
    });
    for row in root_rows {
        if let Some(section) = built.remove(row.section_id.as_str()) {
            roots.push(section);
        }
    }
    let mut leftovers: Vec<(&str, Value)> = built.drain().collect();
    leftovers.sort_by(|a, b| a.0.cmp(b.0));
    roots.extend(leftovers.into_iter().map(|(_, v)| v));

    for id in order {
        if let Some(section) = detached.remove(&id) {
            outcome.orphans_appended += 1;
            roots.push(section);
        }
    }
    if outcome.orphans_appended > 0 {
        warn!(
            count = outcome.orphans_appended,
            "structure snapshot omitted local sections; appended to root"
        );
    }

    // Non-section content at the doc root (kept by the detach pass) stays
    // in front of the reshaped sections.
    match content_mut(doc) {
        Some(children) => children.extend(roots),
        None => doc["content"] = Value::Array(roots),
    }
    outcome
}

/// Marks the parent of a just-resolved section ready once all of its
/// mentioned children are resolved.
fn bubble_up<'a>(
    row: Option<&'a StructureNode>,
    mentioned: &HashSet<&str>,
    pending_children: &mut HashMap<&'a str, usize>,
    ready: &mut VecDeque<&'a str>,
) {
    let Some(parent) = row.and_then(|n| n.parent_id.as_deref()) else {
        return;
    };
    if !mentioned.contains(parent) {
        return;
    }
    if let Some(count) = pending_children.get_mut(parent) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            ready.push_back(parent);
        }
    }
}

fn set_collapsed(section: &mut Value, value: bool) {
    match section.get_mut("attrs") {
        Some(Value::Object(attrs)) => {
            attrs.insert(ATTR_COLLAPSED.into(), Value::Bool(value));
        }
        _ => {
            let mut attrs = Map::new();
            attrs.insert(ATTR_COLLAPSED.into(), Value::Bool(value));
            section["attrs"] = Value::Object(attrs);
        }
    }
}

/// Pulls every section node out of the tree, emptying children containers.
/// `order` records preorder arrival for the orphan safety net.
fn detach_sections(doc: &mut Value, out: &mut HashMap<String, Value>, order: &mut Vec<String>) {
    // Sections nest through children containers, so detaching is done one
    // level at a time: strip sections out of this node's content, keep the
    // stripped sections' own containers for the next rounds.
    let mut work: Vec<Value> = Vec::new();
    if let Some(children) = content_mut(doc) {
        let drained: Vec<Value> = std::mem::take(children);
        let mut keep = Vec::new();
        for child in drained {
            if section_id(&child).is_some() {
                work.push(child);
            } else {
                keep.push(child);
            }
        }
        *children = keep;
    }
    while let Some(mut section) = work.pop() {
        if let Some(container) = child_of_type_mut(&mut section, TYPE_CHILDREN) {
            if let Some(nested) = content_mut(container) {
                let drained: Vec<Value> = std::mem::take(nested);
                for child in drained {
                    if section_id(&child).is_some() {
                        work.push(child);
                    }
                }
            }
        }
        if let Some(id) = section_id(&section).map(str::to_string) {
            order.push(id.clone());
            out.insert(id, section);
        }
    }
}
