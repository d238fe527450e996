//! Request and response bodies of the server contract.
//!
//! Only the fields the engine depends on are modeled; unknown fields are
//! ignored on deserialization. The server's historical name for a section
//! on some endpoints is `blockId`, accepted via serde aliases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::doc::StructureNode;

/// `GET /api/auth/me`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_superuser: bool,
}

/// `PUT /api/articles/{id}/doc-json/save` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDocJsonRequest {
    pub doc_json: Value,
}

/// `PUT /api/articles/{id}/doc-json/save` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAck {
    pub updated_at: String,
    #[serde(default)]
    pub changed_block_ids: Option<Vec<String>>,
    #[serde(default)]
    pub removed_block_ids: Option<Vec<String>>,
}

/// One queued deletion inside a compact request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactDelete {
    pub op_id: String,
    pub section_ids: Vec<String>,
}

/// One queued content upsert inside a compact request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactUpsert {
    pub op_id: String,
    pub section_id: String,
    pub heading_json: Value,
    pub body_json: Value,
    pub seq: i64,
    #[serde(default)]
    pub client_queued_at: Option<u64>,
}

/// `PUT /api/articles/{id}/sync/compact` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactRequest {
    pub deletes: Vec<CompactDelete>,
    pub upserts: Vec<CompactUpsert>,
}

/// `PUT /api/articles/{id}/sync/compact` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactResponse {
    pub updated_at: String,
    #[serde(default)]
    pub delete_acks: Vec<DeleteAck>,
    #[serde(default)]
    pub upsert_acks: Vec<UpsertAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAck {
    pub op_id: String,
    #[serde(default)]
    pub removed_block_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertAck {
    pub op_id: String,
    #[serde(alias = "blockId")]
    pub section_id: String,
    pub result: UpsertResult,
}

/// Per-upsert outcome. `duplicate` is success (the server already holds
/// this seq); `conflict` means the server's seq is ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertResult {
    Ok,
    Duplicate,
    Conflict,
}

/// `PUT /api/articles/{id}/structure/snapshot` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub op_id: String,
    pub nodes: Vec<StructureNode>,
    #[serde(default)]
    pub base_structure_rev: Option<i64>,
}

/// `PUT /api/articles/{id}/structure/snapshot` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub status: SnapshotStatus,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub new_structure_rev: Option<i64>,
    #[serde(default)]
    pub current_structure_rev: Option<i64>,
}

/// `stale` means the snapshot's base revision lags the server; the op
/// stays queued until a pull refreshes the local revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Ok,
    Duplicate,
    Stale,
}

/// `POST /api/articles/{id}/{move|indent|outdent|move-tree}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOpKind {
    Move,
    Indent,
    Outdent,
    MoveTree,
}

impl TreeOpKind {
    pub fn path_segment(&self) -> &'static str {
        match self {
            TreeOpKind::Move => "move",
            TreeOpKind::Indent => "indent",
            TreeOpKind::Outdent => "outdent",
            TreeOpKind::MoveTree => "move-tree",
        }
    }
}

/// `GET /api/articles/{id}/embeddings`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingsResponse {
    #[serde(default)]
    pub embeddings: Vec<EmbeddingWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingWire {
    #[serde(alias = "blockId")]
    pub section_id: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// `GET /api/search/semantic/query-embedding?q=…`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// `POST /api/client/log` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLogEntry {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<Value>,
    pub at_ms: u64,
}
