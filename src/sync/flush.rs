use std::collections::HashSet;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{debug, warn};

use super::wire::{
    CompactDelete, CompactRequest, CompactResponse, CompactUpsert, SaveDocJsonRequest,
    SnapshotRequest, SnapshotStatus, TreeOpKind, UpsertResult,
};
use super::{SyncEngine, SyncEvent, INBOX_ARTICLE_ID};
use crate::doc;
use crate::error::{HttpError, Result};
use crate::store::{
    DeleteSectionsPayload, OpType, OutboxOp, SaveDocJsonPayload, SectionUpsertPayload,
    StructureSnapshotPayload,
};

/// What one flush pass did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlushReport {
    pub transmitted: usize,
    pub acked: usize,
    pub dropped: usize,
    pub conflicts: usize,
    /// Structure snapshots held back because content ops reappeared.
    pub deferred_structures: usize,
    pub stopped_retryable: bool,
    pub auth_required: bool,
    pub skipped_offline: bool,
    pub already_flushing: bool,
}

enum ArticleFlushOutcome {
    Completed,
    Stop(StopReason),
}

enum StopReason {
    Retryable,
    Auth,
}

impl SyncEngine {
    /// One cooperative flush pass over the outbox.
    ///
    /// Per article, content ops are compacted and transmitted first; a
    /// structure snapshot is sent only once no `section_upsert_content` or
    /// `delete_sections` op remains queued for that article. Non-outline
    /// ops drain one at a time afterwards.
    pub async fn flush_outbox_once(&self) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        if !self.is_online() {
            report.skipped_offline = true;
            return Ok(report);
        }
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            report.already_flushing = true;
            return Ok(report);
        }
        let result = self.flush_outbox_inner(&mut report).await;
        self.flushing.store(false, Ordering::SeqCst);
        result?;
        self.emit(SyncEvent::FlushCompleted {
            transmitted: report.transmitted,
        });
        Ok(report)
    }

    async fn flush_outbox_inner(&self, report: &mut FlushReport) -> Result<()> {
        let ops = self.store.read_ops(self.config.outbox_read_limit)?;

        // Distinct articles with outline work, in arrival order.
        let mut article_ids: Vec<String> = Vec::new();
        for op in ops.iter().filter(|o| o.op_type.is_outline()) {
            if !article_ids.contains(&op.article_id) {
                article_ids.push(op.article_id.clone());
            }
        }

        for article_id in article_ids {
            let now = self.clock.now_ms();
            {
                let mut started = self.article_flush_started.lock();
                if let Some(last) = started.get(&article_id) {
                    if now.saturating_sub(*last) < self.config.article_flush_min_interval_ms {
                        continue;
                    }
                }
                started.insert(article_id.clone(), now);
            }
            match self.flush_outline_article(&article_id, report).await? {
                ArticleFlushOutcome::Completed => {
                    if !self.store.has_outline_ops(&article_id)? {
                        self.store.clear_cached_article_local_draft(&article_id)?;
                        self.store.clear_outline_queue(&article_id)?;
                    }
                }
                ArticleFlushOutcome::Stop(StopReason::Auth) => {
                    report.auth_required = true;
                    self.emit(SyncEvent::AuthRequired);
                    return Ok(());
                }
                ArticleFlushOutcome::Stop(StopReason::Retryable) => {
                    report.stopped_retryable = true;
                    return Ok(());
                }
            }
        }

        self.drain_article_ops(report).await
    }

    /// Outline flush for one article: bulk saves, then up to two compact
    /// passes, then the gated structure snapshot.
    async fn flush_outline_article(
        &self,
        article_id: &str,
        report: &mut FlushReport,
    ) -> Result<ArticleFlushOutcome> {
        let ops = self.store.outline_ops_for_article(article_id)?;
        for op in ops.iter().filter(|o| o.op_type == OpType::SaveDocJson) {
            let Ok(payload) =
                serde_json::from_value::<SaveDocJsonPayload>(op.payload.clone())
            else {
                warn!(op_id = %op.id, "corrupt save_doc_json payload; dropping");
                self.store.remove_outbox_op(&op.id)?;
                report.dropped += 1;
                continue;
            };
            report.transmitted += 1;
            match self
                .api
                .save_doc_json(
                    article_id,
                    &SaveDocJsonRequest {
                        doc_json: payload.doc_json.clone(),
                    },
                )
                .await
            {
                Ok(ack) => {
                    self.store.remove_outbox_op(&op.id)?;
                    self.store.update_cached_doc_json(
                        article_id,
                        Some(&payload.doc_json),
                        Some(&ack.updated_at),
                    )?;
                    self.store.clear_outline_queue(article_id)?;
                    report.acked += 1;
                }
                Err(err) => return self.handle_op_error(op, err, report),
            }
        }

        for _pass in 0..self.config.compact_max_passes {
            let ops = self.store.outline_ops_for_article(article_id)?;
            let (deletes, upserts) = split_content_ops(&ops);
            if deletes.is_empty() && upserts.is_empty() {
                break;
            }

            // Delete wins locally: queued upserts for doomed sections are
            // removed before the transport is assembled.
            let doomed: HashSet<&str> = deletes
                .iter()
                .flat_map(|(_, p)| p.section_ids.iter().map(String::as_str))
                .collect();
            let mut kept_upserts = Vec::new();
            for (op, payload) in upserts {
                if doomed.contains(payload.section_id.as_str()) {
                    self.store.remove_outbox_op(&op.id)?;
                    report.dropped += 1;
                } else {
                    kept_upserts.push((op, payload));
                }
            }
            if deletes.is_empty() && kept_upserts.is_empty() {
                break;
            }

            let req = CompactRequest {
                deletes: deletes
                    .iter()
                    .map(|(op, p)| CompactDelete {
                        op_id: op.id.clone(),
                        section_ids: p.section_ids.clone(),
                    })
                    .collect(),
                upserts: kept_upserts
                    .iter()
                    .map(|(op, p)| CompactUpsert {
                        op_id: op.id.clone(),
                        section_id: p.section_id.clone(),
                        heading_json: p.heading_json.clone(),
                        body_json: p.body_json.clone(),
                        seq: p.seq,
                        client_queued_at: p.client_queued_at,
                    })
                    .collect(),
            };
            report.transmitted += req.deletes.len() + req.upserts.len();

            let resp = match self.api.sync_compact(article_id, &req).await {
                Ok(resp) => resp,
                Err(err) => {
                    let sent: Vec<&OutboxOp> = deletes
                        .iter()
                        .map(|(op, _)| *op)
                        .chain(kept_upserts.iter().map(|(op, _)| *op))
                        .collect();
                    return self.handle_transport_error(&sent, err, report);
                }
            };

            let conflicted =
                self.apply_compact_acks(article_id, &kept_upserts, &resp, report)?;
            self.apply_compact_to_cache(article_id, &req, &resp)?;
            for payload in conflicted {
                self.materialize_conflict_copy(article_id, &payload)?;
            }
        }

        self.flush_structure_snapshot(article_id, report).await
    }

    /// Processes compact acks; returns the payloads that conflicted so
    /// the caller can materialize copies after the cache patch.
    fn apply_compact_acks(
        &self,
        article_id: &str,
        upserts: &[(&OutboxOp, SectionUpsertPayload)],
        resp: &CompactResponse,
        report: &mut FlushReport,
    ) -> Result<Vec<SectionUpsertPayload>> {
        for ack in &resp.delete_acks {
            self.store.remove_outbox_op(&ack.op_id)?;
            report.acked += 1;
        }
        let mut conflicted = Vec::new();
        for ack in &resp.upsert_acks {
            match ack.result {
                UpsertResult::Ok | UpsertResult::Duplicate => {
                    self.store.remove_outbox_op(&ack.op_id)?;
                    report.acked += 1;
                    if article_id == INBOX_ARTICLE_ID {
                        self.store.remove_quick_note(&ack.section_id)?;
                    }
                }
                UpsertResult::Conflict => {
                    self.store.remove_outbox_op(&ack.op_id)?;
                    report.conflicts += 1;
                    if let Some((_, payload)) =
                        upserts.iter().find(|(op, _)| op.id == ack.op_id)
                    {
                        conflicted.push(payload.clone());
                    }
                }
            }
        }
        Ok(conflicted)
    }

    /// Patches the cached tree with what the server accepted: acked
    /// upserts replace heading+body in place (children survive), acked
    /// deletions filter the subtree. The write carries the server's
    /// `updatedAt`.
    fn apply_compact_to_cache(
        &self,
        article_id: &str,
        req: &CompactRequest,
        resp: &CompactResponse,
    ) -> Result<()> {
        let Some(article) = self.store.get_cached_article(article_id)? else {
            return Ok(());
        };
        let Some(mut doc) = article.doc_json else {
            // Nothing cached to patch; the next pull fetches the tree.
            self.store
                .touch_cached_article_updated_at(article_id, &resp.updated_at)?;
            return Ok(());
        };

        let accepted: HashSet<&str> = resp
            .upsert_acks
            .iter()
            .filter(|a| a.result != UpsertResult::Conflict)
            .map(|a| a.section_id.as_str())
            .collect();
        for upsert in &req.upserts {
            if !accepted.contains(upsert.section_id.as_str()) {
                continue;
            }
            if !doc::apply_section_upsert(
                &mut doc,
                &upsert.section_id,
                upsert.heading_json.clone(),
                upsert.body_json.clone(),
            ) {
                debug!(
                    article_id,
                    section_id = %upsert.section_id,
                    "acked upsert targets a section missing from the cached tree"
                );
            }
        }

        let acked_deletes: HashSet<&str> = resp
            .delete_acks
            .iter()
            .map(|a| a.op_id.as_str())
            .collect();
        let mut doomed: HashSet<String> = HashSet::new();
        for delete in &req.deletes {
            if acked_deletes.contains(delete.op_id.as_str()) {
                doomed.extend(delete.section_ids.iter().cloned());
            }
        }
        if !doomed.is_empty() {
            doc::remove_sections(&mut doc, &doomed);
            let ids: Vec<String> = doomed.into_iter().collect();
            self.store.delete_embeddings_for_sections(&ids)?;
        }

        self.store
            .update_cached_doc_json(article_id, Some(&doc), Some(&resp.updated_at))?;
        Ok(())
    }

    /// Transmits the queued structure snapshot, but only when no content
    /// op remains for the article, and at most once per throttle window.
    async fn flush_structure_snapshot(
        &self,
        article_id: &str,
        report: &mut FlushReport,
    ) -> Result<ArticleFlushOutcome> {
        let ops = self.store.outline_ops_for_article(article_id)?;
        let content_pending = ops.iter().any(|o| {
            matches!(
                o.op_type,
                OpType::SectionUpsertContent | OpType::DeleteSections
            )
        });
        let Some(snap_op) = ops
            .iter()
            .find(|o| o.op_type == OpType::StructureSnapshot)
        else {
            return Ok(ArticleFlushOutcome::Completed);
        };
        if content_pending {
            // A content op reappeared between passes; the snapshot waits
            // for the next flush so the server never sees a section it
            // has not accepted content for.
            report.deferred_structures += 1;
            return Ok(ArticleFlushOutcome::Completed);
        }

        let now = self.clock.now_ms();
        {
            let mut sent_at = self.structure_sent_at.lock();
            if let Some(last) = sent_at.get(article_id) {
                if now.saturating_sub(*last) < self.config.structure_min_interval_ms {
                    report.deferred_structures += 1;
                    return Ok(ArticleFlushOutcome::Completed);
                }
            }
            sent_at.insert(article_id.to_string(), now);
        }

        let Ok(payload) =
            serde_json::from_value::<StructureSnapshotPayload>(snap_op.payload.clone())
        else {
            warn!(op_id = %snap_op.id, "corrupt structure_snapshot payload; dropping");
            self.store.remove_outbox_op(&snap_op.id)?;
            report.dropped += 1;
            return Ok(ArticleFlushOutcome::Completed);
        };
        let base_structure_rev = self
            .store
            .get_cached_article(article_id)?
            .map(|a| a.outline_structure_rev);

        let req = SnapshotRequest {
            op_id: snap_op.id.clone(),
            nodes: payload.nodes.clone(),
            base_structure_rev,
        };
        report.transmitted += 1;
        match self.api.structure_snapshot(article_id, &req).await {
            Ok(resp) => match resp.status {
                SnapshotStatus::Ok | SnapshotStatus::Duplicate => {
                    self.store.remove_outbox_op(&snap_op.id)?;
                    report.acked += 1;
                    if let Some(rev) = resp.new_structure_rev {
                        self.store
                            .touch_cached_article_outline_structure_rev(article_id, rev)?;
                    }
                    self.apply_structure_to_cache(
                        article_id,
                        &payload.nodes,
                        resp.updated_at.as_deref(),
                    )?;
                    Ok(ArticleFlushOutcome::Completed)
                }
                SnapshotStatus::Stale => {
                    // Leave the op queued; the next full pull refreshes
                    // the local revision and the flush resends.
                    debug!(
                        article_id,
                        current = ?resp.current_structure_rev,
                        "structure snapshot stale"
                    );
                    self.store
                        .mark_outbox_error(&snap_op.id, "stale structure rev", now)?;
                    Ok(ArticleFlushOutcome::Completed)
                }
            },
            Err(err) => self.handle_op_error(snap_op, err, report),
        }
    }

    /// Reshapes the cached tree to the acked snapshot.
    fn apply_structure_to_cache(
        &self,
        article_id: &str,
        nodes: &[doc::StructureNode],
        updated_at: Option<&str>,
    ) -> Result<()> {
        let Some(article) = self.store.get_cached_article(article_id)? else {
            return Ok(());
        };
        let Some(mut tree) = article.doc_json else {
            if let Some(updated_at) = updated_at {
                self.store
                    .touch_cached_article_updated_at(article_id, updated_at)?;
            }
            return Ok(());
        };
        doc::apply_structure(&mut tree, nodes);
        self.store
            .update_cached_doc_json(article_id, Some(&tree), updated_at)?;
        Ok(())
    }

    /// Drains non-outline ops one at a time.
    async fn drain_article_ops(&self, report: &mut FlushReport) -> Result<()> {
        let ops = self.store.read_ops(self.config.outbox_read_limit)?;
        for op in ops.into_iter().filter(|o| !o.op_type.is_outline()) {
            report.transmitted += 1;
            let sent = match op.op_type {
                OpType::CreateArticle => {
                    self.api.create_article(&op.payload).await.map(|_| ())
                }
                OpType::MoveArticleUp | OpType::MoveArticleDown => {
                    self.api
                        .tree_op(&op.article_id, TreeOpKind::Move, &op.payload)
                        .await
                }
                OpType::IndentArticle => {
                    self.api
                        .tree_op(&op.article_id, TreeOpKind::Indent, &op.payload)
                        .await
                }
                OpType::OutdentArticle => {
                    self.api
                        .tree_op(&op.article_id, TreeOpKind::Outdent, &op.payload)
                        .await
                }
                OpType::MoveArticleTree => {
                    self.api
                        .tree_op(&op.article_id, TreeOpKind::MoveTree, &op.payload)
                        .await
                }
                _ => unreachable!("outline ops were drained above"),
            };
            match sent {
                Ok(()) => {
                    self.store.remove_outbox_op(&op.id)?;
                    report.acked += 1;
                }
                Err(err) => match self.handle_op_error(&op, err, report)? {
                    ArticleFlushOutcome::Completed => {}
                    ArticleFlushOutcome::Stop(StopReason::Auth) => {
                        report.auth_required = true;
                        self.emit(SyncEvent::AuthRequired);
                        return Ok(());
                    }
                    ArticleFlushOutcome::Stop(StopReason::Retryable) => {
                        report.stopped_retryable = true;
                        return Ok(());
                    }
                },
            }
        }
        Ok(())
    }

    /// Retry/drop taxonomy for one failed op.
    fn handle_op_error(
        &self,
        op: &OutboxOp,
        err: HttpError,
        report: &mut FlushReport,
    ) -> Result<ArticleFlushOutcome> {
        let now = self.clock.now_ms();
        match err {
            HttpError::Auth { .. } => {
                self.store.mark_outbox_error(&op.id, &err.to_string(), now)?;
                Ok(ArticleFlushOutcome::Stop(StopReason::Auth))
            }
            HttpError::Retryable { .. } => {
                self.store.mark_outbox_error(&op.id, &err.to_string(), now)?;
                Ok(ArticleFlushOutcome::Stop(StopReason::Retryable))
            }
            HttpError::Permanent { .. } if err.is_gone() => {
                self.store.remove_outbox_op(&op.id)?;
                report.dropped += 1;
                Ok(ArticleFlushOutcome::Completed)
            }
            HttpError::Permanent { status } => {
                warn!(op_id = %op.id, op_type = op.op_type.as_str(), status,
                      "dropping op on permanent failure");
                self.store.remove_outbox_op(&op.id)?;
                report.dropped += 1;
                self.note_diag(
                    "warn",
                    "dropped op on permanent http failure",
                    Some(serde_json::json!({
                        "opType": op.op_type.as_str(),
                        "articleId": op.article_id,
                        "status": status,
                    })),
                );
                Ok(ArticleFlushOutcome::Completed)
            }
        }
    }

    /// Same taxonomy applied to every op carried by a failed transport.
    fn handle_transport_error(
        &self,
        ops: &[&OutboxOp],
        err: HttpError,
        report: &mut FlushReport,
    ) -> Result<ArticleFlushOutcome> {
        let now = self.clock.now_ms();
        match err {
            HttpError::Auth { .. } => {
                for op in ops {
                    self.store.mark_outbox_error(&op.id, &err.to_string(), now)?;
                }
                Ok(ArticleFlushOutcome::Stop(StopReason::Auth))
            }
            HttpError::Retryable { .. } => {
                for op in ops {
                    self.store.mark_outbox_error(&op.id, &err.to_string(), now)?;
                }
                Ok(ArticleFlushOutcome::Stop(StopReason::Retryable))
            }
            HttpError::Permanent { status } => {
                let silent = err.is_gone();
                for op in ops {
                    if !silent {
                        warn!(op_id = %op.id, status, "dropping op on permanent failure");
                    }
                    self.store.remove_outbox_op(&op.id)?;
                    report.dropped += 1;
                }
                Ok(ArticleFlushOutcome::Completed)
            }
        }
    }
}

fn split_content_ops(
    ops: &[OutboxOp],
) -> (
    Vec<(&OutboxOp, DeleteSectionsPayload)>,
    Vec<(&OutboxOp, SectionUpsertPayload)>,
) {
    let mut deletes = Vec::new();
    let mut upserts = Vec::new();
    for op in ops {
        match op.op_type {
            OpType::DeleteSections => {
                if let Ok(payload) =
                    serde_json::from_value::<DeleteSectionsPayload>(op.payload.clone())
                {
                    deletes.push((op, payload));
                }
            }
            OpType::SectionUpsertContent => {
                if let Ok(payload) =
                    serde_json::from_value::<SectionUpsertPayload>(op.payload.clone())
                {
                    upserts.push((op, payload));
                }
            }
            _ => {}
        }
    }
    (deletes, upserts)
}
