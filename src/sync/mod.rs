//! The sync engine: ordered outline flush, conflict copies, background
//! reconciliation, and media prefetch.

mod client;
mod conflict;
mod diag;
mod events;
mod flush;
mod full_pull;
mod prefetch;
mod scheduler;
mod session;
pub mod wire;

pub use client::{ApiTransport, HttpClient, MediaFetch};
pub use events::{FullPullPhase, SyncEvent};
pub use flush::FlushReport;
pub use full_pull::FullPullReport;
pub use prefetch::{EffectiveType, MediaPrefetcher, NetworkHints, NoHints, PrefetchReport};
pub use scheduler::SyncScheduler;
pub use session::{resolve_session, Session, UserRecord};

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::doc::StructureNode;
use crate::error::{EngineError, HttpError, Result};
use crate::store::{
    DeleteSectionsPayload, EnqueueRequest, OpType, SaveDocJsonPayload, SectionUpsertPayload, Store,
    StoredSection, StructureSnapshotPayload,
};

/// The article id reserved for quick-capture notes.
pub const INBOX_ARTICLE_ID: &str = "inbox";

/// One semantic-search result joined with the local section index.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub section_id: String,
    pub article_id: String,
    pub score: f32,
    pub title: String,
    pub text: String,
}

/// Long-lived engine value owning the flush latches and throttles. All
/// ambient state beyond the persistent stores lives here, so tests can
/// drive time and the network deterministically.
pub struct SyncEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) api: Arc<dyn ApiTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    /// One flush pass at a time, process-wide.
    pub(crate) flushing: AtomicBool,
    /// One reconciliation sweep at a time.
    pub(crate) full_pull_running: AtomicBool,
    /// articleId -> when its last flush entry started (clock ms).
    pub(crate) article_flush_started: Mutex<HashMap<String, u64>>,
    /// articleId -> when its last structure snapshot was transmitted.
    pub(crate) structure_sent_at: Mutex<HashMap<String, u64>>,
    online_tx: watch::Sender<bool>,
    visible_tx: watch::Sender<bool>,
    pub(crate) diag: diag::DiagBuffer,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, api: Arc<dyn ApiTransport>, config: EngineConfig) -> Self {
        Self::with_clock(store, api, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<Store>,
        api: Arc<dyn ApiTransport>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (online_tx, _) = watch::channel(true);
        let (visible_tx, _) = watch::channel(true);
        Self {
            store,
            api,
            clock,
            config,
            events,
            flushing: AtomicBool::new(false),
            full_pull_running: AtomicBool::new(false),
            article_flush_started: Mutex::new(HashMap::new()),
            structure_sent_at: Mutex::new(HashMap::new()),
            online_tx,
            visible_tx,
            diag: diag::DiagBuffer::default(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        self.online_tx.send_if_modified(|v| {
            let changed = *v != online;
            *v = online;
            changed
        });
    }

    pub fn online_changed(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible_tx.send_if_modified(|v| {
            let changed = *v != visible;
            *v = visible;
            changed
        });
    }

    pub fn visibility_changed(&self) -> watch::Receiver<bool> {
        self.visible_tx.subscribe()
    }

    /// Queues a per-section content edit. The section's `seq` is stamped
    /// at enqueue time so the server can reject regressions; the coalesce
    /// key makes repeated edits to one section supersede each other.
    pub fn enqueue_section_upsert(
        &self,
        article_id: &str,
        section_id: &str,
        heading_json: Value,
        body_json: Value,
    ) -> Result<String> {
        let seq = self.store.next_section_seq(article_id, section_id)?;
        let now = self.clock.now_ms();
        let payload = SectionUpsertPayload {
            section_id: section_id.to_string(),
            heading_json,
            body_json,
            seq,
            client_queued_at: Some(now),
        };
        let op_id = self.store.enqueue_op(
            EnqueueRequest {
                op_type: OpType::SectionUpsertContent,
                article_id: article_id.to_string(),
                payload: serde_json::to_value(&payload)?,
                coalesce_key: Some(format!(
                    "section_upsert_content:{article_id}:{section_id}"
                )),
            },
            now,
        )?;
        Ok(op_id)
    }

    /// Queues a section deletion. Delete wins over any queued upsert for
    /// the same section when the flush assembles its transport.
    pub fn enqueue_delete_sections(
        &self,
        article_id: &str,
        section_ids: Vec<String>,
    ) -> Result<String> {
        let now = self.clock.now_ms();
        let payload = DeleteSectionsPayload { section_ids };
        let op_id = self.store.enqueue_op(
            EnqueueRequest {
                op_type: OpType::DeleteSections,
                article_id: article_id.to_string(),
                payload: serde_json::to_value(&payload)?,
                coalesce_key: None,
            },
            now,
        )?;
        Ok(op_id)
    }

    /// Queues the article's current structural arrangement. At most one
    /// snapshot per article is ever queued (latest wins).
    pub fn enqueue_structure_snapshot(
        &self,
        article_id: &str,
        nodes: Vec<StructureNode>,
    ) -> Result<String> {
        let now = self.clock.now_ms();
        let payload = StructureSnapshotPayload { nodes };
        let op_id = self.store.enqueue_op(
            EnqueueRequest {
                op_type: OpType::StructureSnapshot,
                article_id: article_id.to_string(),
                payload: serde_json::to_value(&payload)?,
                coalesce_key: Some(format!("structure_snapshot:{article_id}")),
            },
            now,
        )?;
        Ok(op_id)
    }

    /// Queues a bulk whole-document save (latest wins per article).
    pub fn enqueue_save_doc_json(&self, article_id: &str, doc_json: Value) -> Result<String> {
        let now = self.clock.now_ms();
        let payload = SaveDocJsonPayload { doc_json };
        let op_id = self.store.enqueue_op(
            EnqueueRequest {
                op_type: OpType::SaveDocJson,
                article_id: article_id.to_string(),
                payload: serde_json::to_value(&payload)?,
                coalesce_key: Some(format!("save_doc_json:{article_id}")),
            },
            now,
        )?;
        Ok(op_id)
    }

    /// Queues a structural article op (create / move / indent / outdent /
    /// move-tree). These drain one at a time after outline ops.
    pub fn enqueue_article_op(
        &self,
        op_type: OpType,
        article_id: &str,
        payload: Value,
    ) -> Result<String> {
        debug_assert!(!op_type.is_outline());
        let now = self.clock.now_ms();
        let op_id = self.store.enqueue_op(
            EnqueueRequest {
                op_type,
                article_id: article_id.to_string(),
                payload,
                coalesce_key: None,
            },
            now,
        )?;
        Ok(op_id)
    }

    /// Edit-path entry: writes the tree locally (marking it a draft) and
    /// records it in the outline queue so a crash before the flush can be
    /// recovered at startup. The caller enqueues the matching ops.
    pub fn stage_local_doc(&self, article_id: &str, doc: &Value) -> Result<()> {
        self.store
            .update_cached_doc_json(article_id, Some(doc), None)?;
        self.store
            .set_outline_queue(article_id, doc, self.clock.now_ms())?;
        Ok(())
    }

    /// Startup recovery: replays queued offline trees whose articles still
    /// hold outline ops; entries with nothing pending are stale and
    /// dropped. Returns how many drafts were restored.
    pub fn recover_outline_queue(&self) -> Result<usize> {
        let mut restored = 0;
        for (article_id, doc, _queued_at) in self.store.all_outline_queue()? {
            if self.store.has_outline_ops(&article_id)? {
                self.store
                    .update_cached_doc_json(&article_id, Some(&doc), None)?;
                restored += 1;
            } else {
                self.store.clear_outline_queue(&article_id)?;
            }
        }
        Ok(restored)
    }

    /// Fetches and caches the server's inbox article under the reserved
    /// id, respecting the local-draft invariant.
    pub async fn refresh_inbox(&self) -> Result<()> {
        let article = self.api.get_inbox().await?;
        self.store
            .cache_article_under_id(&article, INBOX_ARTICLE_ID)?;
        Ok(())
    }

    /// Semantic search over the locally cached embeddings. Connectivity is
    /// required for the query embedding only; candidates and metadata are
    /// resolved locally.
    pub async fn semantic_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if !self.is_online() {
            return Err(EngineError::Http(HttpError::Retryable {
                status: None,
                message: "semantic search needs connectivity for the query embedding".into(),
            }));
        }
        let query_vec = self.api.query_embedding(query).await?;
        let normed = crate::store::normalize(&query_vec).ok_or_else(|| {
            EngineError::Doc("server returned a zero query embedding".into())
        })?;
        let hits = self.store.top_k_similar(&normed, k)?;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let section: Option<StoredSection> = self.store.get_section(&hit.section_id)?;
            let (title, text) = section
                .map(|s| (s.title, s.text))
                .unwrap_or_default();
            results.push(SearchHit {
                section_id: hit.section_id,
                article_id: hit.article_id,
                score: hit.score,
                title,
                text,
            });
        }
        Ok(results)
    }

    /// Ships buffered diagnostics, best-effort.
    pub async fn ship_client_log(&self) {
        let entries = self.diag.drain();
        if entries.is_empty() {
            return;
        }
        if let Err(err) = self.api.post_client_log(&entries).await {
            tracing::debug!(%err, dropped = entries.len(), "client log shipping failed");
        }
    }

    pub(crate) fn new_section_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub(crate) fn note_diag(&self, level: &str, message: &str, context: Option<Value>) {
        self.diag
            .push(level, message, context, self.clock.now_ms());
    }
}
