use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::StoreError;

/// State of a locally buffered upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Error,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "error" => UploadStatus::Error,
            _ => UploadStatus::Pending,
        }
    }
}

/// Binary blob pasted while offline, waiting for server acceptance.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub token: String,
    pub article_id: String,
    pub kind: String,
    pub blob: Vec<u8>,
    pub mime: Option<String>,
    pub file_name: Option<String>,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Store {
    pub fn put_pending_upload(&self, upload: &PendingUpload) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending_uploads
                   (token, article_id, kind, blob, mime, file_name, status, error_message,
                    created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    upload.token,
                    upload.article_id,
                    upload.kind,
                    upload.blob,
                    upload.mime,
                    upload.file_name,
                    upload.status.as_str(),
                    upload.error_message,
                    upload.created_at_ms as i64,
                    upload.updated_at_ms as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_pending_upload(&self, token: &str) -> Result<Option<PendingUpload>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT token, article_id, kind, blob, mime, file_name, status,
                            error_message, created_at_ms, updated_at_ms
                     FROM pending_uploads WHERE token = ?1",
                    params![token],
                    row_to_upload,
                )
                .optional()?)
        })
    }

    /// Oldest-first listing, optionally restricted to one article.
    pub fn list_pending_uploads(
        &self,
        article_id: Option<&str>,
    ) -> Result<Vec<PendingUpload>, StoreError> {
        self.with_conn(|conn| {
            let rows = match article_id {
                Some(article_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT token, article_id, kind, blob, mime, file_name, status,
                                error_message, created_at_ms, updated_at_ms
                         FROM pending_uploads WHERE article_id = ?1
                         ORDER BY created_at_ms ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![article_id], row_to_upload)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT token, article_id, kind, blob, mime, file_name, status,
                                error_message, created_at_ms, updated_at_ms
                         FROM pending_uploads ORDER BY created_at_ms ASC",
                    )?;
                    let rows = stmt
                        .query_map([], row_to_upload)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    /// Purged once the server accepts the upload.
    pub fn remove_pending_upload(&self, token: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM pending_uploads WHERE token = ?1",
                params![token],
            )?;
            Ok(())
        })
    }

    pub fn mark_pending_upload_error(
        &self,
        token: &str,
        message: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_uploads
                 SET status = 'error', error_message = ?2, updated_at_ms = ?3
                 WHERE token = ?1",
                params![token, message, now_ms as i64],
            )?;
            Ok(())
        })
    }

    pub(crate) fn pending_uploads_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM pending_uploads", [], |row| row.get(0))?)
        })
    }
}

fn row_to_upload(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingUpload> {
    Ok(PendingUpload {
        token: row.get(0)?,
        article_id: row.get(1)?,
        kind: row.get(2)?,
        blob: row.get(3)?,
        mime: row.get(4)?,
        file_name: row.get(5)?,
        status: UploadStatus::parse(&row.get::<_, String>(6)?),
        error_message: row.get(7)?,
        created_at_ms: row.get::<_, i64>(8)? as u64,
        updated_at_ms: row.get::<_, i64>(9)? as u64,
    })
}
