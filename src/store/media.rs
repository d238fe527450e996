use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::StoreError;

/// Fetch state of one referenced upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Needed,
    Ok,
    Error,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Needed => "needed",
            MediaStatus::Ok => "ok",
            MediaStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "ok" => MediaStatus::Ok,
            "error" => MediaStatus::Error,
            _ => MediaStatus::Needed,
        }
    }
}

/// One tracked upload URL.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub url: String,
    pub status: MediaStatus,
    pub fetched_at_ms: Option<u64>,
    pub fail_count: u32,
    pub last_error: Option<String>,
}

/// A cached media body.
#[derive(Debug, Clone)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

impl Store {
    /// Replaces the `(articleId, url)` ref set for an article with the
    /// current extraction, creating `needed` asset rows for new URLs.
    pub fn replace_article_media_refs(
        &self,
        article_id: &str,
        urls: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM media_refs WHERE article_id = ?1",
                params![article_id],
            )?;
            for url in urls {
                tx.execute(
                    "INSERT OR REPLACE INTO media_refs (key, article_id, url) VALUES (?1, ?2, ?3)",
                    params![format!("{article_id}|{url}"), article_id, url],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO media_assets (url, status, fail_count) VALUES (?1, 'needed', 0)",
                    params![url],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn media_refs_for_article(&self, article_id: &str) -> Result<BTreeSet<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT url FROM media_refs WHERE article_id = ?1")?;
            let rows = stmt
                .query_map(params![article_id], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Assets still worth fetching: not `ok`, failures under the cap,
    /// never-fetched first, then oldest attempts.
    pub fn fetchable_media_assets(&self, limit: usize) -> Result<Vec<MediaAsset>, StoreError> {
        let cap = self.config().prefetch_fail_cap;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url, status, fetched_at_ms, fail_count, last_error
                 FROM media_assets
                 WHERE status != 'ok' AND fail_count < ?1
                 ORDER BY fetched_at_ms IS NOT NULL, fetched_at_ms ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![cap as i64, limit as i64], row_to_asset)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_media_asset(&self, url: &str) -> Result<Option<MediaAsset>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT url, status, fetched_at_ms, fail_count, last_error
                     FROM media_assets WHERE url = ?1",
                    params![url],
                    row_to_asset,
                )
                .optional()?)
        })
    }

    pub fn mark_media_ok(&self, url: &str, now_ms: u64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_assets
                 SET status = 'ok', fetched_at_ms = ?2, last_error = NULL
                 WHERE url = ?1",
                params![url, now_ms as i64],
            )?;
            Ok(())
        })
    }

    pub fn mark_media_error(&self, url: &str, error: &str, now_ms: u64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_assets
                 SET status = 'error', fetched_at_ms = ?2, fail_count = fail_count + 1,
                     last_error = ?3
                 WHERE url = ?1",
                params![url, now_ms as i64, error],
            )?;
            Ok(())
        })
    }

    /// Deletes assets (and cached bodies) whose ref set is empty, bounded
    /// per sweep. Returns how many were pruned.
    pub fn prune_orphan_media_assets(&self, limit: usize) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let orphans: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT url FROM media_assets
                     WHERE url NOT IN (SELECT url FROM media_refs)
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            for url in &orphans {
                tx.execute("DELETE FROM media_assets WHERE url = ?1", params![url])?;
                tx.execute("DELETE FROM media_blobs WHERE url = ?1", params![url])?;
            }
            tx.commit()?;
            Ok(orphans.len())
        })
    }

    /// (ok, needed, error) asset counts for coverage reporting.
    pub fn media_status_counts(&self) -> Result<(i64, i64, i64), StoreError> {
        self.with_conn(|conn| {
            let count = |status: &str| -> Result<i64, rusqlite::Error> {
                conn.query_row(
                    "SELECT COUNT(*) FROM media_assets WHERE status = ?1",
                    params![status],
                    |row| row.get(0),
                )
            };
            Ok((count("ok")?, count("needed")?, count("error")?))
        })
    }

    pub fn put_media_blob(
        &self,
        url: &str,
        bytes: &[u8],
        mime: Option<&str>,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO media_blobs (url, bytes, mime, fetched_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![url, bytes, mime, now_ms as i64],
            )?;
            Ok(())
        })
    }

    pub fn media_blob_exists(&self, url: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM media_blobs WHERE url = ?1",
                params![url],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_media_blob(&self, url: &str) -> Result<Option<MediaBlob>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT bytes, mime FROM media_blobs WHERE url = ?1",
                    params![url],
                    |row| {
                        Ok(MediaBlob {
                            bytes: row.get(0)?,
                            mime: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

fn row_to_asset(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaAsset> {
    Ok(MediaAsset {
        url: row.get(0)?,
        status: MediaStatus::parse(&row.get::<_, String>(1)?),
        fetched_at_ms: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
        fail_count: row.get::<_, i64>(3)? as u32,
        last_error: row.get(4)?,
    })
}
