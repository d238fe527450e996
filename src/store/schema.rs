use rusqlite::Connection;

use crate::error::StoreError;

/// Bumped whenever a table or index is added. Upgrades are idempotent, so
/// re-running the DDL against any older version is safe.
pub(crate) const SCHEMA_VERSION: i32 = 1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS articles (
  id TEXT PRIMARY KEY,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  local_draft INTEGER NOT NULL DEFAULT 0,
  payload TEXT NOT NULL,
  doc_json TEXT
);
CREATE INDEX IF NOT EXISTS articles_by_updated_at ON articles(updated_at);
CREATE INDEX IF NOT EXISTS articles_by_deleted_at ON articles(deleted_at);

CREATE TABLE IF NOT EXISTS outline_sections (
  section_id TEXT PRIMARY KEY,
  article_id TEXT NOT NULL,
  title TEXT NOT NULL,
  text TEXT NOT NULL,
  updated_at TEXT
);
CREATE INDEX IF NOT EXISTS outline_sections_by_article_id ON outline_sections(article_id);
CREATE INDEX IF NOT EXISTS outline_sections_by_updated_at ON outline_sections(updated_at);

CREATE TABLE IF NOT EXISTS section_embeddings (
  section_id TEXT PRIMARY KEY,
  article_id TEXT NOT NULL,
  updated_at TEXT,
  vec BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS section_embeddings_by_article_id ON section_embeddings(article_id);
CREATE INDEX IF NOT EXISTS section_embeddings_by_updated_at ON section_embeddings(updated_at);

CREATE TABLE IF NOT EXISTS media_assets (
  url TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  fetched_at_ms INTEGER,
  fail_count INTEGER NOT NULL DEFAULT 0,
  last_error TEXT
);
CREATE INDEX IF NOT EXISTS media_assets_by_status ON media_assets(status);
CREATE INDEX IF NOT EXISTS media_assets_by_fetched_at_ms ON media_assets(fetched_at_ms);
CREATE INDEX IF NOT EXISTS media_assets_by_status_fetched_at_ms
  ON media_assets(status, fetched_at_ms);

CREATE TABLE IF NOT EXISTS media_refs (
  key TEXT PRIMARY KEY,
  article_id TEXT NOT NULL,
  url TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS media_refs_by_article_id ON media_refs(article_id);
CREATE INDEX IF NOT EXISTS media_refs_by_url ON media_refs(url);

CREATE TABLE IF NOT EXISTS media_blobs (
  url TEXT PRIMARY KEY,
  bytes BLOB NOT NULL,
  mime TEXT,
  fetched_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
  id TEXT PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  op_type TEXT NOT NULL,
  article_id TEXT NOT NULL,
  payload TEXT NOT NULL,
  coalesce_key TEXT,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  last_attempt_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS outbox_by_created_at_ms ON outbox(created_at_ms);
CREATE INDEX IF NOT EXISTS outbox_by_type_article ON outbox(op_type, article_id);
CREATE INDEX IF NOT EXISTS outbox_by_type_coalesce ON outbox(op_type, coalesce_key);

CREATE TABLE IF NOT EXISTS pending_uploads (
  token TEXT PRIMARY KEY,
  article_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  blob BLOB NOT NULL,
  mime TEXT,
  file_name TEXT,
  status TEXT NOT NULL,
  error_message TEXT,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS pending_uploads_by_article_id ON pending_uploads(article_id);
CREATE INDEX IF NOT EXISTS pending_uploads_by_created_at_ms ON pending_uploads(created_at_ms);

CREATE TABLE IF NOT EXISTS tags_global (
  key TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  count INTEGER NOT NULL,
  last_seen_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS tags_global_by_count ON tags_global(count);
CREATE INDEX IF NOT EXISTS tags_global_by_last_seen_at_ms ON tags_global(last_seen_at_ms);

CREATE TABLE IF NOT EXISTS tags_by_article (
  article_id TEXT PRIMARY KEY,
  tags_json TEXT NOT NULL,
  updated_at TEXT
);
CREATE INDEX IF NOT EXISTS tags_by_article_by_updated_at ON tags_by_article(updated_at);

CREATE TABLE IF NOT EXISTS section_seq (
  article_id TEXT NOT NULL,
  section_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  PRIMARY KEY (article_id, section_id)
);

CREATE TABLE IF NOT EXISTS outline_queue (
  article_id TEXT PRIMARY KEY,
  doc_json TEXT NOT NULL,
  queued_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS quick_notes (
  section_id TEXT PRIMARY KEY,
  text TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);
";

/// Creates missing stores and indices, then stamps the schema version.
///
/// A database stamped with a *newer* version than this build understands
/// is refused rather than downgraded.
pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let found: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::InvalidState(format!(
            "store schema v{found} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    let tx = conn.transaction()?;
    tx.execute_batch(DDL)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}
