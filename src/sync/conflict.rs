use serde_json::{json, Value};
use tracing::info;

use super::{SyncEngine, SyncEvent};
use crate::doc;
use crate::error::Result;
use crate::store::{EnqueueRequest, OpType, SectionUpsertPayload};

/// Prefix stamped onto the heading of a preserved local edit.
pub const CONFLICT_COPY_PREFIX: &str = "Conflict copy: ";

impl SyncEngine {
    /// Preserves a rejected content upsert as a sibling "conflict copy"
    /// so the local writing is never silently lost:
    ///
    /// 1. a fresh section carrying the local heading (marked) and body is
    ///    inserted right after the original,
    /// 2. the cache is rewritten and the copy's sequence seeded at 1,
    /// 3. a content upsert for the copy and a snapshot of the new tree
    ///    are queued, both coalescing with future edits,
    /// 4. subscribers get an `OutlineSyncConflict` event.
    pub(crate) fn materialize_conflict_copy(
        &self,
        article_id: &str,
        rejected: &SectionUpsertPayload,
    ) -> Result<()> {
        let copy_id = self.new_section_id();
        let marked_heading = prefix_heading(&rejected.heading_json, CONFLICT_COPY_PREFIX);
        let section = doc::build_section(
            &copy_id,
            marked_heading.clone(),
            rejected.body_json.clone(),
        );

        let mut tree = self
            .store
            .get_cached_article(article_id)?
            .and_then(|a| a.doc_json)
            .unwrap_or_else(doc::empty_doc);
        if !doc::insert_section_after(&mut tree, &rejected.section_id, section.clone()) {
            if let Some(content) = doc::content_mut(&mut tree) {
                content.push(section);
            }
        }
        self.store
            .update_cached_doc_json(article_id, Some(&tree), None)?;
        self.store.seed_section_seq(article_id, &copy_id, 1)?;

        let now = self.clock.now_ms();
        let payload = SectionUpsertPayload {
            section_id: copy_id.clone(),
            heading_json: marked_heading,
            body_json: rejected.body_json.clone(),
            seq: 1,
            client_queued_at: Some(now),
        };
        self.store.enqueue_op(
            EnqueueRequest {
                op_type: OpType::SectionUpsertContent,
                article_id: article_id.to_string(),
                payload: serde_json::to_value(&payload)?,
                coalesce_key: Some(format!(
                    "section_upsert_content:{article_id}:{copy_id}"
                )),
            },
            now,
        )?;
        self.enqueue_structure_snapshot(article_id, doc::flatten_structure(&tree))?;

        info!(
            article_id,
            original = %rejected.section_id,
            copy = %copy_id,
            "materialized conflict copy"
        );
        self.note_diag(
            "warn",
            "outline sync conflict",
            Some(json!({
                "articleId": article_id,
                "originalSectionId": rejected.section_id,
                "conflictCopySectionId": copy_id,
            })),
        );
        self.emit(SyncEvent::OutlineSyncConflict {
            article_id: article_id.to_string(),
            original_section_id: rejected.section_id.clone(),
            conflict_copy_section_id: copy_id,
        });
        Ok(())
    }
}

/// Clones a heading node with the marker text prepended to its content.
fn prefix_heading(heading: &Value, marker: &str) -> Value {
    let mut out = heading.clone();
    let text_node = json!({ "type": "text", "text": marker });
    match out.get_mut("content").and_then(Value::as_array_mut) {
        Some(content) => content.insert(0, text_node),
        None => {
            out["content"] = Value::Array(vec![text_node]);
        }
    }
    out
}
