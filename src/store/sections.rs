use rusqlite::params;

use super::Store;
use crate::doc::SectionRow;
use crate::error::StoreError;

/// One derived index row of the `outline_sections` store.
#[derive(Debug, Clone)]
pub struct StoredSection {
    pub section_id: String,
    pub article_id: String,
    pub title: String,
    pub text: String,
    pub updated_at: Option<String>,
}

impl Store {
    /// Rebuilds the derived section rows for one article: all prior rows
    /// are deleted, then the extracted set is inserted.
    pub fn replace_article_sections(
        &self,
        article_id: &str,
        rows: &[SectionRow],
        updated_at: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM outline_sections WHERE article_id = ?1",
                params![article_id],
            )?;
            for row in rows {
                tx.execute(
                    "INSERT INTO outline_sections (section_id, article_id, title, text, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(section_id) DO UPDATE SET
                       article_id = excluded.article_id,
                       title = excluded.title,
                       text = excluded.text,
                       updated_at = excluded.updated_at",
                    params![row.section_id, article_id, row.title, row.text, updated_at],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn sections_for_article(&self, article_id: &str) -> Result<Vec<StoredSection>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT section_id, article_id, title, text, updated_at
                 FROM outline_sections WHERE article_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![article_id], row_to_section)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_section(&self, section_id: &str) -> Result<Option<StoredSection>, StoreError> {
        use rusqlite::OptionalExtension;
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT section_id, article_id, title, text, updated_at
                     FROM outline_sections WHERE section_id = ?1",
                    params![section_id],
                    row_to_section,
                )
                .optional()?)
        })
    }

    pub(crate) fn count_sections_for_article(&self, article_id: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM outline_sections WHERE article_id = ?1",
                params![article_id],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_section(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSection> {
    Ok(StoredSection {
        section_id: row.get(0)?,
        article_id: row.get(1)?,
        title: row.get(2)?,
        text: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
