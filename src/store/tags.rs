use std::collections::BTreeMap;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::Store;
use crate::doc::TagOccurrence;
use crate::error::StoreError;

const TAGS_STALE_KEY: &str = "tags_global_stale";

/// One entry of the global tag index.
#[derive(Debug, Clone, Serialize)]
pub struct TagCount {
    pub key: String,
    pub label: String,
    pub count: i64,
    pub last_seen_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagEntry {
    label: String,
    count: i64,
}

impl Store {
    /// Replaces the per-article tag row with the current occurrence set
    /// (aggregated by lowercased key).
    pub fn replace_article_tags(
        &self,
        article_id: &str,
        occurrences: &[TagOccurrence],
    ) -> Result<(), StoreError> {
        let mut agg: BTreeMap<String, TagEntry> = BTreeMap::new();
        for occ in occurrences {
            agg.entry(occ.key.clone())
                .and_modify(|e| e.count += 1)
                .or_insert_with(|| TagEntry {
                    label: occ.label.clone(),
                    count: 1,
                });
        }
        self.with_conn(|conn| {
            if agg.is_empty() {
                conn.execute(
                    "DELETE FROM tags_by_article WHERE article_id = ?1",
                    params![article_id],
                )?;
            } else {
                conn.execute(
                    "INSERT OR REPLACE INTO tags_by_article (article_id, tags_json, updated_at)
                     VALUES (?1, ?2, (SELECT updated_at FROM articles WHERE id = ?1))",
                    params![
                        article_id,
                        serde_json::to_string(&agg)
                            .map_err(|e| StoreError::Unknown(e.to_string()))?,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Flags the global count/label map for rebuild on next read.
    pub fn mark_tags_global_stale(&self) -> Result<(), StoreError> {
        self.set_meta(TAGS_STALE_KEY, "1")
    }

    /// The cached global tag index, rebuilt from the per-article rows when
    /// a write has marked it stale. Ordered by count descending.
    pub fn tags_global(&self, now_ms: u64) -> Result<Vec<TagCount>, StoreError> {
        let stale = self.get_meta(TAGS_STALE_KEY)?.as_deref() == Some("1");
        if stale {
            self.rebuild_tags_global(now_ms)?;
            self.set_meta(TAGS_STALE_KEY, "0")?;
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, label, count, last_seen_at_ms
                 FROM tags_global ORDER BY count DESC, key ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TagCount {
                        key: row.get(0)?,
                        label: row.get(1)?,
                        count: row.get(2)?,
                        last_seen_at_ms: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn rebuild_tags_global(&self, now_ms: u64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut totals: BTreeMap<String, TagEntry> = BTreeMap::new();
            {
                let mut stmt = tx.prepare("SELECT tags_json FROM tags_by_article")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for raw in rows {
                    let raw = raw?;
                    let Ok(per_article) =
                        serde_json::from_str::<BTreeMap<String, TagEntry>>(&raw)
                    else {
                        continue;
                    };
                    for (key, entry) in per_article {
                        totals
                            .entry(key)
                            .and_modify(|e| e.count += entry.count)
                            .or_insert(entry);
                    }
                }
            }
            tx.execute("DELETE FROM tags_global", [])?;
            for (key, entry) in totals {
                tx.execute(
                    "INSERT INTO tags_global (key, label, count, last_seen_at_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, entry.label, entry.count, now_ms as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}
