use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::Store;
use crate::doc;
use crate::error::StoreError;

/// One row of the server's article index (no `docJson`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleIndexRow {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub public_slug: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

/// A cached article, scalars plus the inlined outline tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedArticle {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub public_slug: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(default)]
    pub outline_structure_rev: i64,
    #[serde(default)]
    pub doc_json: Option<Value>,
    #[serde(default)]
    pub local_draft: bool,
}

/// Marshaled scalar fields persisted in the `payload` column. `docJson`
/// and the draft flag live in their own columns so a corrupt payload can
/// still be reconstructed from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScalarPayload {
    id: String,
    title: String,
    updated_at: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    public_slug: Option<String>,
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    deleted_at: Option<String>,
    #[serde(default)]
    outline_structure_rev: i64,
}

impl ScalarPayload {
    fn of(article: &CachedArticle) -> Self {
        Self {
            id: article.id.clone(),
            title: article.title.clone(),
            updated_at: article.updated_at.clone(),
            parent_id: article.parent_id.clone(),
            position: article.position,
            public_slug: article.public_slug.clone(),
            encrypted: article.encrypted,
            deleted_at: article.deleted_at.clone(),
            outline_structure_rev: article.outline_structure_rev,
        }
    }
}

/// What `cache_article` decided about an incoming server write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWriteOutcome {
    /// The article was not cached before.
    Inserted,
    /// The server write was accepted in full.
    Accepted,
    /// Local draft protected: scalars merged, cached `docJson` kept.
    MergedScalars,
    /// The incoming view was older than the cache; nothing written.
    SkippedOlder,
}

/// Summary row for coverage reports and reconciliation pre-scans.
#[derive(Debug, Clone)]
pub struct ArticleState {
    pub id: String,
    pub updated_at: String,
    pub has_doc: bool,
    pub local_draft: bool,
    pub deleted_at: Option<String>,
}

struct PreImage {
    updated_at: String,
    local_draft: bool,
    doc_json: Option<String>,
    payload: String,
}

fn read_pre_image(tx: &Transaction<'_>, id: &str) -> Result<Option<PreImage>, StoreError> {
    tx.query_row(
        "SELECT updated_at, local_draft, doc_json, payload FROM articles WHERE id = ?1",
        params![id],
        |row| {
            Ok(PreImage {
                updated_at: row.get(0)?,
                local_draft: row.get::<_, i64>(1)? != 0,
                doc_json: row.get(2)?,
                payload: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(StoreError::from_sqlite)
}

fn parse_payload(raw: &str, id: &str) -> Option<ScalarPayload> {
    match serde_json::from_str(raw) {
        Ok(p) => Some(p),
        Err(err) => {
            warn!(article_id = id, %err, "corrupt article payload");
            None
        }
    }
}

fn count_outline_ops(tx: &Transaction<'_>, article_id: &str) -> Result<i64, StoreError> {
    let mut total = 0i64;
    for op_type in super::outbox::OUTLINE_TYPES {
        let n: i64 = tx.query_row(
            "SELECT COUNT(*) FROM outbox WHERE op_type = ?1 AND article_id = ?2",
            params![op_type, article_id],
            |row| row.get(0),
        )?;
        total += n;
    }
    Ok(total)
}

impl Store {
    /// Upserts a batch of index rows. Writes land in chunks with one
    /// transaction each so interactive writers interleave between chunks.
    ///
    /// Index rows never carry `docJson`, so the cached tree and draft flag
    /// are always preserved; `updatedAt` only moves forward.
    pub fn cache_articles_index(&self, rows: &[ArticleIndexRow]) -> Result<(), StoreError> {
        let chunk = self.config().index_chunk.max(1);
        for batch in rows.chunks(chunk) {
            self.with_conn(|conn| {
                let tx = conn.transaction()?;
                for row in batch {
                    upsert_index_row(&tx, row)?;
                }
                tx.commit()?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Full article upsert enforcing the local-draft invariant.
    ///
    /// Accepted writes rebuild the derived section / tag / media indices
    /// afterwards, best-effort.
    pub fn cache_article(&self, article: &CachedArticle) -> Result<CacheWriteOutcome, StoreError> {
        let id = article.id.clone();
        self.cache_article_under_id(article, &id)
    }

    /// Like [`Store::cache_article`] but writes under a caller-supplied id
    /// (the `inbox` pseudo-article is cached this way).
    pub fn cache_article_under_id(
        &self,
        article: &CachedArticle,
        id: &str,
    ) -> Result<CacheWriteOutcome, StoreError> {
        let outcome = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let outcome = match read_pre_image(&tx, id)? {
                None => {
                    write_full(&tx, id, article, article.local_draft)?;
                    CacheWriteOutcome::Inserted
                }
                Some(pre) => {
                    if article.updated_at < pre.updated_at {
                        CacheWriteOutcome::SkippedOlder
                    } else if pre.local_draft && article.updated_at == pre.updated_at {
                        let pending = count_outline_ops(&tx, id)?;
                        if pending == 0 {
                            // The draft was already confirmed; clinging to
                            // it would resurrect deleted content on reload.
                            write_full(&tx, id, article, false)?;
                            CacheWriteOutcome::Accepted
                        } else if doc_differs(pre.doc_json.as_deref(), article.doc_json.as_ref()) {
                            merge_scalars(&tx, id, &pre, article)?;
                            CacheWriteOutcome::MergedScalars
                        } else {
                            write_full(&tx, id, article, false)?;
                            CacheWriteOutcome::Accepted
                        }
                    } else {
                        let keep_rev = payload_rev(&pre);
                        let mut merged = article.clone();
                        merged.outline_structure_rev =
                            merged.outline_structure_rev.max(keep_rev);
                        write_full(&tx, id, &merged, article.local_draft)?;
                        CacheWriteOutcome::Accepted
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })?;

        if !matches!(outcome, CacheWriteOutcome::SkippedOlder) {
            self.reindex_article(id);
        }
        Ok(outcome)
    }

    /// Loads a cached article with its inlined tree. A corrupt marshaled
    /// payload is reconstructed from the `docJson` blob instead of erroring.
    pub fn get_cached_article(&self, id: &str) -> Result<Option<CachedArticle>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT payload, doc_json, local_draft, updated_at, deleted_at
                     FROM articles WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, i64>(2)? != 0,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((payload, doc_json, local_draft, updated_at, deleted_at)) = row else {
                return Ok(None);
            };
            let doc_json = doc_json.and_then(|raw| match serde_json::from_str(&raw) {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(article_id = id, %err, "corrupt docJson blob");
                    None
                }
            });
            let article = match parse_payload(&payload, id) {
                Some(p) => CachedArticle {
                    id: p.id,
                    title: p.title,
                    updated_at: p.updated_at,
                    parent_id: p.parent_id,
                    position: p.position,
                    public_slug: p.public_slug,
                    encrypted: p.encrypted,
                    deleted_at: p.deleted_at,
                    outline_structure_rev: p.outline_structure_rev,
                    doc_json,
                    local_draft,
                },
                None => CachedArticle {
                    id: id.to_string(),
                    title: String::new(),
                    updated_at,
                    parent_id: None,
                    position: 0,
                    public_slug: None,
                    encrypted: false,
                    deleted_at,
                    outline_structure_rev: 0,
                    doc_json,
                    local_draft,
                },
            };
            Ok(Some(article))
        })
    }

    /// Writes only `docJson`, marking the article a local draft when the
    /// tree is non-null. A `None` `updated_at` preserves the cached value;
    /// a local save never clears it.
    pub fn update_cached_doc_json(
        &self,
        id: &str,
        doc_json: Option<&Value>,
        updated_at: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let pre = read_pre_image(&tx, id)?;
            let doc_raw = doc_json.map(|v| v.to_string());
            let local_draft = doc_json.is_some();
            match pre {
                Some(pre) => {
                    let next_updated = match updated_at {
                        Some(u) if u > pre.updated_at.as_str() => u.to_string(),
                        _ => pre.updated_at.clone(),
                    };
                    let mut payload = parse_payload(&pre.payload, id)
                        .unwrap_or_else(|| fallback_payload(id, &pre.updated_at));
                    payload.updated_at = next_updated.clone();
                    tx.execute(
                        "UPDATE articles
                         SET doc_json = ?2, local_draft = ?3, updated_at = ?4, payload = ?5
                         WHERE id = ?1",
                        params![
                            id,
                            doc_raw,
                            local_draft as i64,
                            next_updated,
                            serde_json::to_string(&payload)
                                .map_err(|e| StoreError::Unknown(e.to_string()))?,
                        ],
                    )?;
                }
                None => {
                    let updated = updated_at.unwrap_or("").to_string();
                    let payload = fallback_payload(id, &updated);
                    tx.execute(
                        "INSERT INTO articles (id, updated_at, deleted_at, local_draft, payload, doc_json)
                         VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
                        params![
                            id,
                            updated,
                            local_draft as i64,
                            serde_json::to_string(&payload)
                                .map_err(|e| StoreError::Unknown(e.to_string()))?,
                            doc_raw,
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        self.reindex_article(id);
        Ok(())
    }

    /// Soft-deletes: stamps `deletedAt` and drops the derived rows.
    pub fn mark_cached_article_deleted(
        &self,
        id: &str,
        deleted_at: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(pre) = read_pre_image(&tx, id)? {
                let mut payload = parse_payload(&pre.payload, id)
                    .unwrap_or_else(|| fallback_payload(id, &pre.updated_at));
                payload.deleted_at = Some(deleted_at.to_string());
                tx.execute(
                    "UPDATE articles SET deleted_at = ?2, payload = ?3 WHERE id = ?1",
                    params![
                        id,
                        deleted_at,
                        serde_json::to_string(&payload)
                            .map_err(|e| StoreError::Unknown(e.to_string()))?,
                    ],
                )?;
                tx.execute(
                    "DELETE FROM outline_sections WHERE article_id = ?1",
                    params![id],
                )?;
                tx.execute(
                    "DELETE FROM section_embeddings WHERE article_id = ?1",
                    params![id],
                )?;
                tx.execute("DELETE FROM media_refs WHERE article_id = ?1", params![id])?;
                tx.execute(
                    "DELETE FROM tags_by_article WHERE article_id = ?1",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        self.mark_tags_global_stale()?;
        self.invalidate_embeddings_cache();
        Ok(())
    }

    pub fn clear_cached_article_local_draft(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE articles SET local_draft = 0 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    /// Advances `updatedAt`; regressions are ignored.
    pub fn touch_cached_article_updated_at(
        &self,
        id: &str,
        updated_at: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(pre) = read_pre_image(&tx, id)? {
                if updated_at > pre.updated_at.as_str() {
                    let mut payload = parse_payload(&pre.payload, id)
                        .unwrap_or_else(|| fallback_payload(id, &pre.updated_at));
                    payload.updated_at = updated_at.to_string();
                    tx.execute(
                        "UPDATE articles SET updated_at = ?2, payload = ?3 WHERE id = ?1",
                        params![
                            id,
                            updated_at,
                            serde_json::to_string(&payload)
                                .map_err(|e| StoreError::Unknown(e.to_string()))?,
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Advances the structural revision; it never decreases.
    pub fn touch_cached_article_outline_structure_rev(
        &self,
        id: &str,
        rev: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(pre) = read_pre_image(&tx, id)? {
                let mut payload = parse_payload(&pre.payload, id)
                    .unwrap_or_else(|| fallback_payload(id, &pre.updated_at));
                if rev > payload.outline_structure_rev {
                    payload.outline_structure_rev = rev;
                    tx.execute(
                        "UPDATE articles SET payload = ?2 WHERE id = ?1",
                        params![
                            id,
                            serde_json::to_string(&payload)
                                .map_err(|e| StoreError::Unknown(e.to_string()))?,
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Batch-updates parent/position after a tree reorder.
    pub fn update_cached_article_tree_positions(
        &self,
        moves: &[(String, Option<String>, i64)],
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (id, parent_id, position) in moves {
                if let Some(pre) = read_pre_image(&tx, id)? {
                    let mut payload = parse_payload(&pre.payload, id)
                        .unwrap_or_else(|| fallback_payload(id, &pre.updated_at));
                    payload.parent_id = parent_id.clone();
                    payload.position = *position;
                    tx.execute(
                        "UPDATE articles SET payload = ?2 WHERE id = ?1",
                        params![
                            id,
                            serde_json::to_string(&payload)
                                .map_err(|e| StoreError::Unknown(e.to_string()))?,
                        ],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Snapshot of every cached article's sync-relevant state.
    pub fn article_states(&self) -> Result<Vec<ArticleState>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, updated_at, doc_json IS NOT NULL, local_draft, deleted_at
                 FROM articles",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ArticleState {
                        id: row.get(0)?,
                        updated_at: row.get(1)?,
                        has_doc: row.get::<_, i64>(2)? != 0,
                        local_draft: row.get::<_, i64>(3)? != 0,
                        deleted_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Rebuilds the three derived indices for an article, best-effort:
    /// outline sections, tags (marking the global index stale), media refs.
    pub fn reindex_article(&self, id: &str) {
        let doc = match self.get_cached_article(id) {
            Ok(Some(article)) => article.doc_json,
            Ok(None) => None,
            Err(err) => {
                warn!(article_id = id, %err, "reindex skipped: article unreadable");
                return;
            }
        };
        if let Err(err) = self.reindex_sections(id, doc.as_ref()) {
            warn!(article_id = id, %err, "section reindex failed");
        }
        if let Err(err) = self.reindex_tags(id, doc.as_ref()) {
            warn!(article_id = id, %err, "tag reindex failed");
        }
        if let Err(err) = self.reindex_media_refs_from(id, doc.as_ref()) {
            warn!(article_id = id, %err, "media ref reindex failed");
        }
    }

    /// Rebuilds only the media refs for an article, best-effort.
    pub fn reindex_media_refs(&self, id: &str) {
        let doc = match self.get_cached_article(id) {
            Ok(Some(article)) => article.doc_json,
            _ => None,
        };
        if let Err(err) = self.reindex_media_refs_from(id, doc.as_ref()) {
            debug!(article_id = id, %err, "media ref reindex failed");
        }
    }

    fn reindex_sections(&self, id: &str, doc: Option<&Value>) -> Result<(), StoreError> {
        let rows = doc.map(doc::extract_sections).unwrap_or_default();
        let updated_at = self
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT updated_at FROM articles WHERE id = ?1",
                        params![id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })?
            .unwrap_or_default();
        self.replace_article_sections(id, &rows, &updated_at)
    }

    fn reindex_tags(&self, id: &str, doc: Option<&Value>) -> Result<(), StoreError> {
        let occurrences = doc.map(doc::extract_tags).unwrap_or_default();
        self.replace_article_tags(id, &occurrences)?;
        self.mark_tags_global_stale()
    }

    fn reindex_media_refs_from(&self, id: &str, doc: Option<&Value>) -> Result<(), StoreError> {
        let prefix = self.config().uploads_prefix.clone();
        let refs = doc
            .map(|d| doc::extract_upload_refs(d, &prefix))
            .unwrap_or_default();
        self.replace_article_media_refs(id, &refs)
    }
}

fn payload_rev(pre: &PreImage) -> i64 {
    serde_json::from_str::<ScalarPayload>(&pre.payload)
        .map(|p| p.outline_structure_rev)
        .unwrap_or(0)
}

fn doc_differs(cached: Option<&str>, incoming: Option<&Value>) -> bool {
    match (cached, incoming) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(raw), Some(incoming)) => match serde_json::from_str::<Value>(raw) {
            Ok(cached) => doc::doc_hash(&cached) != doc::doc_hash(incoming),
            Err(_) => true,
        },
    }
}

fn fallback_payload(id: &str, updated_at: &str) -> ScalarPayload {
    ScalarPayload {
        id: id.to_string(),
        title: String::new(),
        updated_at: updated_at.to_string(),
        parent_id: None,
        position: 0,
        public_slug: None,
        encrypted: false,
        deleted_at: None,
        outline_structure_rev: 0,
    }
}

fn write_full(
    tx: &Transaction<'_>,
    id: &str,
    article: &CachedArticle,
    local_draft: bool,
) -> Result<(), StoreError> {
    let mut payload = ScalarPayload::of(article);
    payload.id = id.to_string();
    let doc_raw = article.doc_json.as_ref().map(|v| v.to_string());
    tx.execute(
        "INSERT INTO articles (id, updated_at, deleted_at, local_draft, payload, doc_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
           updated_at = excluded.updated_at,
           deleted_at = excluded.deleted_at,
           local_draft = excluded.local_draft,
           payload = excluded.payload,
           doc_json = excluded.doc_json",
        params![
            id,
            article.updated_at,
            article.deleted_at,
            local_draft as i64,
            serde_json::to_string(&payload).map_err(|e| StoreError::Unknown(e.to_string()))?,
            doc_raw,
        ],
    )?;
    Ok(())
}

/// Scalars-only merge for a protected local draft: the cached tree and
/// draft flag survive, `outlineStructureRev` only moves forward.
fn merge_scalars(
    tx: &Transaction<'_>,
    id: &str,
    pre: &PreImage,
    incoming: &CachedArticle,
) -> Result<(), StoreError> {
    let keep_rev = payload_rev(pre);
    let mut payload = ScalarPayload::of(incoming);
    payload.id = id.to_string();
    payload.outline_structure_rev = payload.outline_structure_rev.max(keep_rev);
    tx.execute(
        "UPDATE articles SET payload = ?2, deleted_at = ?3 WHERE id = ?1",
        params![
            id,
            serde_json::to_string(&payload).map_err(|e| StoreError::Unknown(e.to_string()))?,
            incoming.deleted_at,
        ],
    )?;
    Ok(())
}

fn upsert_index_row(tx: &Transaction<'_>, row: &ArticleIndexRow) -> Result<(), StoreError> {
    match read_pre_image(tx, &row.id)? {
        None => {
            let payload = ScalarPayload {
                id: row.id.clone(),
                title: row.title.clone(),
                updated_at: row.updated_at.clone(),
                parent_id: row.parent_id.clone(),
                position: row.position,
                public_slug: row.public_slug.clone(),
                encrypted: row.encrypted,
                deleted_at: None,
                outline_structure_rev: 0,
            };
            tx.execute(
                "INSERT INTO articles (id, updated_at, deleted_at, local_draft, payload, doc_json)
                 VALUES (?1, ?2, NULL, 0, ?3, NULL)",
                params![
                    row.id,
                    row.updated_at,
                    serde_json::to_string(&payload)
                        .map_err(|e| StoreError::Unknown(e.to_string()))?,
                ],
            )?;
        }
        Some(pre) if row.updated_at < pre.updated_at => {}
        Some(pre) => {
            let kept = parse_payload(&pre.payload, &row.id)
                .unwrap_or_else(|| fallback_payload(&row.id, &pre.updated_at));
            let payload = ScalarPayload {
                id: row.id.clone(),
                title: row.title.clone(),
                updated_at: row.updated_at.clone(),
                parent_id: row.parent_id.clone(),
                position: row.position,
                public_slug: row.public_slug.clone(),
                encrypted: row.encrypted,
                deleted_at: kept.deleted_at,
                outline_structure_rev: kept.outline_structure_rev,
            };
            tx.execute(
                "UPDATE articles SET updated_at = ?2, payload = ?3 WHERE id = ?1",
                params![
                    row.id,
                    row.updated_at,
                    serde_json::to_string(&payload)
                        .map_err(|e| StoreError::Unknown(e.to_string()))?,
                ],
            )?;
        }
    }
    Ok(())
}
