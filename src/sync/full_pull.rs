use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::{FullPullPhase, SyncEngine, SyncEvent};
use crate::error::Result;
use crate::store::EmbeddingUpsert;

/// Report of one reconciliation sweep.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FullPullReport {
    pub total: usize,
    pub pulled: usize,
    pub skipped: usize,
    pub pruned_media: usize,
}

impl SyncEngine {
    /// Background reconciliation: mirror the server's article set into
    /// the local store. At most one sweep runs at a time; a duplicate
    /// start is a no-op unless `force` is passed.
    ///
    /// Returns `None` when another sweep already held the latch.
    pub async fn full_pull(&self, force: bool) -> Result<Option<FullPullReport>> {
        if self
            .full_pull_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
            && !force
        {
            return Ok(None);
        }
        self.full_pull_running.store(true, Ordering::SeqCst);

        let result = self.full_pull_inner().await;
        self.full_pull_running.store(false, Ordering::SeqCst);
        match result {
            Ok(report) => {
                info!(
                    pulled = report.pulled,
                    skipped = report.skipped,
                    pruned = report.pruned_media,
                    "full pull done"
                );
                self.emit(SyncEvent::FullPull(FullPullPhase::Done {
                    pulled: report.pulled,
                }));
                Ok(Some(report))
            }
            Err(err) => {
                self.emit(SyncEvent::FullPull(FullPullPhase::Error {
                    message: err.to_string(),
                }));
                Err(err)
            }
        }
    }

    async fn full_pull_inner(&self) -> Result<FullPullReport> {
        let mut report = FullPullReport::default();
        self.emit(SyncEvent::FullPull(FullPullPhase::Index));

        // Pre-scan before the index upsert bumps cached `updatedAt`, so
        // staleness is judged against what the cache actually held.
        let pre: HashMap<String, (String, bool)> = self
            .store
            .article_states()?
            .into_iter()
            .map(|s| (s.id, (s.updated_at, s.has_doc)))
            .collect();

        let rows = self.api.list_articles().await?;
        self.store.cache_articles_index(&rows)?;
        report.total = rows.len();
        self.emit(SyncEvent::FullPull(FullPullPhase::Articles {
            total: rows.len(),
            completed: 0,
        }));

        for (i, row) in rows.iter().enumerate() {
            let fresh = pre
                .get(&row.id)
                .map_or(false, |(updated_at, has_doc)| {
                    *updated_at == row.updated_at && *has_doc
                });
            if fresh {
                self.store.reindex_media_refs(&row.id);
                report.skipped += 1;
            } else {
                let article = self.api.get_article(&row.id).await?;
                self.store.cache_article(&article)?;
                match self.api.get_embeddings(&row.id, None).await {
                    Ok(resp) => {
                        let items: Vec<EmbeddingUpsert> = resp
                            .embeddings
                            .into_iter()
                            .map(|e| EmbeddingUpsert {
                                section_id: e.section_id,
                                vec: e.embedding,
                                updated_at: e.updated_at,
                            })
                            .collect();
                        if let Err(err) =
                            self.store.upsert_article_embeddings(&row.id, &items)
                        {
                            debug!(article_id = %row.id, %err, "embedding upsert failed");
                        }
                    }
                    Err(err) => {
                        debug!(article_id = %row.id, %err, "embeddings fetch failed");
                    }
                }
                report.pulled += 1;
                // Spread article fetches out so the server is not hammered.
                tokio::time::sleep(Duration::from_millis(self.config.full_pull_yield_ms)).await;
            }
            self.emit(SyncEvent::FullPull(FullPullPhase::Articles {
                total: rows.len(),
                completed: i + 1,
            }));
        }

        if let Err(err) = self.refresh_inbox().await {
            debug!(%err, "inbox refresh failed during full pull");
        }

        report.pruned_media = self
            .store
            .prune_orphan_media_assets(self.config.media_prune_limit)?;
        Ok(report)
    }
}
