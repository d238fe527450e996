use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use rusqlite::params;

use super::Store;
use crate::error::StoreError;

/// A stored section embedding. Vectors are L2-normalized on write, so the
/// dot product of two rows is their cosine similarity.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub section_id: String,
    pub article_id: String,
    pub updated_at: Option<String>,
    pub vec: Vec<f32>,
}

/// One semantic-search candidate.
#[derive(Debug, Clone)]
pub struct SectionHit {
    pub section_id: String,
    pub article_id: String,
    pub score: f32,
}

/// Scales to unit length. `None` for zero (or non-finite) magnitude.
pub fn normalize(vec: &[f32]) -> Option<Vec<f32>> {
    let mag = vec.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
    if !mag.is_finite() || mag <= f64::EPSILON {
        return None;
    }
    Some(vec.iter().map(|v| (f64::from(*v) / mag) as f32).collect())
}

/// Inner product; cosine similarity for normalized inputs. Accumulates in
/// f64 so long vectors keep the 1e-6 tolerance.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum::<f64>() as f32
}

fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Input item for [`Store::upsert_article_embeddings`].
#[derive(Debug, Clone)]
pub struct EmbeddingUpsert {
    pub section_id: String,
    pub vec: Vec<f32>,
    pub updated_at: Option<String>,
}

struct HeapEntry {
    score: f32,
    idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    // Reversed so the heap's top is the current minimum.
    fn cmp(&self, other: &Self) -> Ordering {
        other.score.total_cmp(&self.score)
    }
}

impl Store {
    /// Normalizes and writes the embeddings for one article's sections.
    /// Zero vectors are skipped.
    pub fn upsert_article_embeddings(
        &self,
        article_id: &str,
        items: &[EmbeddingUpsert],
    ) -> Result<usize, StoreError> {
        let written = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0usize;
            for item in items {
                let Some(normed) = normalize(&item.vec) else {
                    continue;
                };
                tx.execute(
                    "INSERT INTO section_embeddings (section_id, article_id, updated_at, vec)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(section_id) DO UPDATE SET
                       article_id = excluded.article_id,
                       updated_at = excluded.updated_at,
                       vec = excluded.vec",
                    params![
                        item.section_id,
                        article_id,
                        item.updated_at,
                        vec_to_blob(&normed),
                    ],
                )?;
                written += 1;
            }
            tx.commit()?;
            Ok(written)
        })?;
        self.invalidate_embeddings_cache();
        Ok(written)
    }

    pub fn delete_embeddings_for_sections(&self, section_ids: &[String]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for id in section_ids {
                tx.execute(
                    "DELETE FROM section_embeddings WHERE section_id = ?1",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        self.invalidate_embeddings_cache();
        Ok(())
    }

    /// Memoized load of every embedding row.
    pub fn load_embeddings_cache(&self) -> Result<Arc<Vec<EmbeddingRow>>, StoreError> {
        if let Some(cached) = self.embeddings_cache.lock().clone() {
            return Ok(cached);
        }
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT section_id, article_id, updated_at, vec FROM section_embeddings",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(EmbeddingRow {
                        section_id: row.get(0)?,
                        article_id: row.get(1)?,
                        updated_at: row.get(2)?,
                        vec: blob_to_vec(&row.get::<_, Vec<u8>>(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        let arc = Arc::new(rows);
        *self.embeddings_cache.lock() = Some(arc.clone());
        Ok(arc)
    }

    pub fn invalidate_embeddings_cache(&self) {
        *self.embeddings_cache.lock() = None;
    }

    /// Top-K by dot product over the in-memory cache with a size-K running
    /// heap. `k` is capped by the configured maximum.
    pub fn top_k_similar(&self, query: &[f32], k: usize) -> Result<Vec<SectionHit>, StoreError> {
        let k = k.clamp(1, self.config().search_top_k_max.max(1));
        let rows = self.load_embeddings_cache()?;
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
        for (idx, row) in rows.iter().enumerate() {
            if row.vec.len() != query.len() {
                continue;
            }
            let score = dot(query, &row.vec);
            heap.push(HeapEntry { score, idx });
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut hits: Vec<SectionHit> = heap
            .into_iter()
            .map(|e| SectionHit {
                section_id: rows[e.idx].section_id.clone(),
                article_id: rows[e.idx].article_id.clone(),
                score: e.score,
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }

    pub(crate) fn embeddings_count(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM section_embeddings", [], |row| {
                row.get(0)
            })?)
        })
    }
}
