use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Store;
use crate::doc::StructureNode;
use crate::error::StoreError;

/// Every operation the outbox can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    SectionUpsertContent,
    DeleteSections,
    StructureSnapshot,
    SaveDocJson,
    CreateArticle,
    MoveArticleUp,
    MoveArticleDown,
    IndentArticle,
    OutdentArticle,
    MoveArticleTree,
}

/// Outline op types, in the order the flush protocol treats them.
pub(crate) const OUTLINE_TYPES: [&str; 4] = [
    "section_upsert_content",
    "delete_sections",
    "structure_snapshot",
    "save_doc_json",
];

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::SectionUpsertContent => "section_upsert_content",
            OpType::DeleteSections => "delete_sections",
            OpType::StructureSnapshot => "structure_snapshot",
            OpType::SaveDocJson => "save_doc_json",
            OpType::CreateArticle => "create_article",
            OpType::MoveArticleUp => "move_article_up",
            OpType::MoveArticleDown => "move_article_down",
            OpType::IndentArticle => "indent_article",
            OpType::OutdentArticle => "outdent_article",
            OpType::MoveArticleTree => "move_article_tree",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "section_upsert_content" => OpType::SectionUpsertContent,
            "delete_sections" => OpType::DeleteSections,
            "structure_snapshot" => OpType::StructureSnapshot,
            "save_doc_json" => OpType::SaveDocJson,
            "create_article" => OpType::CreateArticle,
            "move_article_up" => OpType::MoveArticleUp,
            "move_article_down" => OpType::MoveArticleDown,
            "indent_article" => OpType::IndentArticle,
            "outdent_article" => OpType::OutdentArticle,
            "move_article_tree" => OpType::MoveArticleTree,
            _ => return None,
        })
    }

    /// Outline ops obey the per-article flush ordering; the rest drain
    /// one at a time after them.
    pub fn is_outline(&self) -> bool {
        matches!(
            self,
            OpType::SectionUpsertContent
                | OpType::DeleteSections
                | OpType::StructureSnapshot
                | OpType::SaveDocJson
        )
    }
}

/// A durable pending operation.
#[derive(Debug, Clone)]
pub struct OutboxOp {
    pub id: String,
    pub created_at_ms: u64,
    pub op_type: OpType,
    pub article_id: String,
    pub payload: Value,
    pub coalesce_key: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at_ms: Option<u64>,
}

/// Arguments for [`Store::enqueue_op`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub op_type: OpType,
    pub article_id: String,
    pub payload: Value,
    /// When set, prior ops with the same `(type, articleId, coalesceKey)`
    /// are superseded.
    pub coalesce_key: Option<String>,
}

/// Payload of a `section_upsert_content` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionUpsertPayload {
    pub section_id: String,
    pub heading_json: Value,
    pub body_json: Value,
    pub seq: i64,
    #[serde(default)]
    pub client_queued_at: Option<u64>,
}

/// Payload of a `delete_sections` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSectionsPayload {
    pub section_ids: Vec<String>,
}

/// Payload of a `structure_snapshot` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureSnapshotPayload {
    pub nodes: Vec<StructureNode>,
}

/// Payload of a bulk `save_doc_json` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDocJsonPayload {
    pub doc_json: Value,
}

impl Store {
    /// Durably appends an op. With a coalesce key, all prior ops of the
    /// same `(type, articleId, coalesceKey)` are deleted in the same
    /// transaction, so "latest wins" holds under concurrent enqueuers.
    pub fn enqueue_op(
        &self,
        req: EnqueueRequest,
        created_at_ms: u64,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(key) = &req.coalesce_key {
                tx.execute(
                    "DELETE FROM outbox
                     WHERE op_type = ?1 AND article_id = ?2 AND coalesce_key = ?3",
                    params![req.op_type.as_str(), req.article_id, key],
                )?;
            }
            tx.execute(
                "INSERT INTO outbox
                   (id, created_at_ms, op_type, article_id, payload, coalesce_key, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    id,
                    created_at_ms as i64,
                    req.op_type.as_str(),
                    req.article_id,
                    req.payload.to_string(),
                    req.coalesce_key,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        self.bump_outbox_gen();
        Ok(id)
    }

    /// Oldest-first bounded read. `limit` is clamped to 1..=500.
    pub fn read_ops(&self, limit: usize) -> Result<Vec<OutboxOp>, StoreError> {
        let limit = limit.clamp(1, 500);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at_ms, op_type, article_id, payload, coalesce_key,
                        attempts, last_error, last_attempt_at_ms
                 FROM outbox ORDER BY created_at_ms ASC, rowid ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_op)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().flatten().collect())
        })
    }

    /// All queued outline ops for one article, oldest first.
    pub fn outline_ops_for_article(&self, article_id: &str) -> Result<Vec<OutboxOp>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at_ms, op_type, article_id, payload, coalesce_key,
                        attempts, last_error, last_attempt_at_ms
                 FROM outbox
                 WHERE article_id = ?1
                   AND op_type IN (?2, ?3, ?4, ?5)
                 ORDER BY created_at_ms ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        article_id,
                        OUTLINE_TYPES[0],
                        OUTLINE_TYPES[1],
                        OUTLINE_TYPES[2],
                        OUTLINE_TYPES[3],
                    ],
                    row_to_op,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().flatten().collect())
        })
    }

    pub fn has_outline_ops(&self, article_id: &str) -> Result<bool, StoreError> {
        Ok(!self.outline_ops_for_article(article_id)?.is_empty())
    }

    /// Removes an op unconditionally.
    pub fn remove_outbox_op(&self, op_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM outbox WHERE id = ?1", params![op_id])?;
            Ok(())
        })?;
        self.bump_outbox_gen();
        Ok(())
    }

    /// Records a failed attempt: bumps `attempts`, stores the error and
    /// the attempt time.
    pub fn mark_outbox_error(
        &self,
        op_id: &str,
        message: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox
                 SET attempts = attempts + 1, last_error = ?2, last_attempt_at_ms = ?3
                 WHERE id = ?1",
                params![op_id, message, now_ms as i64],
            )?;
            Ok(())
        })
    }

    pub fn outbox_depth(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?)
        })
    }
}

fn row_to_op(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<OutboxOp>> {
    let raw_type: String = row.get(2)?;
    let Some(op_type) = OpType::parse(&raw_type) else {
        // Unknown type written by a newer build; skip rather than fail.
        return Ok(None);
    };
    let raw_payload: String = row.get(4)?;
    let payload = serde_json::from_str(&raw_payload).unwrap_or(Value::Null);
    Ok(Some(OutboxOp {
        id: row.get(0)?,
        created_at_ms: row.get::<_, i64>(1)? as u64,
        op_type,
        article_id: row.get(3)?,
        payload,
        coalesce_key: row.get(5)?,
        attempts: row.get::<_, i64>(6)? as u32,
        last_error: row.get(7)?,
        last_attempt_at_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
    }))
}
