use serde::Serialize;

use crate::error::StoreError;
use crate::store::Store;

/// Offline-readiness summary computed over the local store.
#[derive(Debug, Clone, Serialize)]
pub struct OfflineCoverage {
    /// Live (non-deleted) cached articles.
    pub articles_total: i64,
    /// Of those, how many hold a `docJson` tree and are readable offline.
    pub articles_with_doc: i64,
    pub media_ok: i64,
    pub media_needed: i64,
    pub media_error: i64,
    pub embeddings: i64,
    pub outbox_depth: i64,
    pub pending_uploads: i64,
    pub quick_notes_pending: i64,
}

impl OfflineCoverage {
    pub fn compute(store: &Store) -> Result<Self, StoreError> {
        let (articles_total, articles_with_doc) = store.articles_counts()?;
        let (media_ok, media_needed, media_error) = store.media_status_counts()?;
        Ok(Self {
            articles_total,
            articles_with_doc,
            media_ok,
            media_needed,
            media_error,
            embeddings: store.embeddings_count()?,
            outbox_depth: store.outbox_depth()?,
            pending_uploads: store.pending_uploads_count()?,
            quick_notes_pending: store.quick_notes_count()?,
        })
    }

    /// True when every article is readable offline and no referenced
    /// media is missing or failing.
    pub fn is_fully_cached(&self) -> bool {
        self.articles_with_doc == self.articles_total
            && self.media_needed == 0
            && self.media_error == 0
    }
}
