use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::Store;
use crate::error::StoreError;

const PREFETCH_PAUSED_KEY: &str = "media_prefetch_paused";

/// A quick-capture note buffered for the inbox article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickNote {
    pub section_id: String,
    pub text: String,
    pub created_at_ms: u64,
}

impl Store {
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn media_prefetch_paused(&self) -> Result<bool, StoreError> {
        Ok(self.get_meta(PREFETCH_PAUSED_KEY)?.as_deref() == Some("1"))
    }

    pub fn set_media_prefetch_paused(&self, paused: bool) -> Result<(), StoreError> {
        self.set_meta(PREFETCH_PAUSED_KEY, if paused { "1" } else { "0" })
    }

    /// Increments and returns the sequence for `(articleId, sectionId)`.
    /// Values are strictly increasing per section across the store's life.
    pub fn next_section_seq(&self, article_id: &str, section_id: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO section_seq (article_id, section_id, seq) VALUES (?1, ?2, 1)
                 ON CONFLICT(article_id, section_id) DO UPDATE SET seq = seq + 1",
                params![article_id, section_id],
            )?;
            let seq = tx.query_row(
                "SELECT seq FROM section_seq WHERE article_id = ?1 AND section_id = ?2",
                params![article_id, section_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(seq)
        })
    }

    pub fn current_section_seq(
        &self,
        article_id: &str,
        section_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT seq FROM section_seq WHERE article_id = ?1 AND section_id = ?2",
                    params![article_id, section_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Seeds a fresh section's counter (conflict copies start at 1).
    pub fn seed_section_seq(
        &self,
        article_id: &str,
        section_id: &str,
        seq: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO section_seq (article_id, section_id, seq)
                 VALUES (?1, ?2, ?3)",
                params![article_id, section_id, seq],
            )?;
            Ok(())
        })
    }

    /// Remembers an article's offline-edited tree for startup recovery.
    pub fn set_outline_queue(
        &self,
        article_id: &str,
        doc_json: &Value,
        queued_at_ms: u64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO outline_queue (article_id, doc_json, queued_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![article_id, doc_json.to_string(), queued_at_ms as i64],
            )?;
            Ok(())
        })
    }

    pub fn get_outline_queue(
        &self,
        article_id: &str,
    ) -> Result<Option<(Value, u64)>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT doc_json, queued_at_ms FROM outline_queue WHERE article_id = ?1",
                    params![article_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(raw, at)| {
                serde_json::from_str(&raw).ok().map(|doc| (doc, at as u64))
            }))
        })
    }

    pub fn clear_outline_queue(&self, article_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM outline_queue WHERE article_id = ?1",
                params![article_id],
            )?;
            Ok(())
        })
    }

    pub fn all_outline_queue(&self) -> Result<Vec<(String, Value, u64)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT article_id, doc_json, queued_at_ms FROM outline_queue")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(id, raw, at)| {
                    serde_json::from_str(&raw).ok().map(|doc| (id, doc, at as u64))
                })
                .collect())
        })
    }

    pub fn add_quick_note(&self, note: &QuickNote) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO quick_notes (section_id, text, created_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![note.section_id, note.text, note.created_at_ms as i64],
            )?;
            Ok(())
        })
    }

    /// Pending notes, oldest first.
    pub fn list_quick_notes(&self) -> Result<Vec<QuickNote>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT section_id, text, created_at_ms FROM quick_notes
                 ORDER BY created_at_ms ASC, section_id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(QuickNote {
                        section_id: row.get(0)?,
                        text: row.get(1)?,
                        created_at_ms: row.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn remove_quick_note(&self, section_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM quick_notes WHERE section_id = ?1",
                params![section_id],
            )?;
            Ok(())
        })
    }

    pub(crate) fn quick_notes_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM quick_notes", [], |row| row.get(0))?)
        })
    }

    pub(crate) fn articles_counts(&self) -> Result<(i64, i64), StoreError> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM articles WHERE deleted_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            let with_doc: i64 = conn.query_row(
                "SELECT COUNT(*) FROM articles WHERE deleted_at IS NULL AND doc_json IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            Ok((total, with_doc))
        })
    }
}
