//! Offline quick-capture notes for the reserved `inbox` article.
//!
//! Notes captured while offline (or before the inbox is known) buffer in
//! the store and are later emitted as ordinary content upserts against
//! `articleId = "inbox"`. The outbox drain removes a pending note once
//! the server acknowledges its upsert.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::doc;
use crate::error::Result;
use crate::store::{QuickNote, Store};
use crate::sync::{SyncEngine, INBOX_ARTICLE_ID};

pub struct QuickNotesBridge {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl QuickNotesBridge {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Buffers a note under a generated section id and returns it.
    pub fn capture(&self, text: &str) -> Result<String> {
        let section_id = Uuid::new_v4().to_string();
        self.store.add_quick_note(&QuickNote {
            section_id: section_id.clone(),
            text: text.to_string(),
            created_at_ms: self.clock.now_ms(),
        })?;
        Ok(section_id)
    }

    /// The inbox tree as the UI should read it: pending notes overlaid on
    /// top of the cached document, newest first (matching the server's
    /// top-of-list insertion).
    pub fn overlay_inbox_doc(&self, cached: Option<&Value>) -> Result<Value> {
        let mut tree = cached.cloned().unwrap_or_else(doc::empty_doc);
        let existing: HashSet<String> = doc::extract_sections(&tree)
            .into_iter()
            .map(|s| s.section_id)
            .collect();
        // Oldest to newest, each inserted at the top, so the newest note
        // ends up first.
        for note in self.store.list_quick_notes()? {
            if existing.contains(&note.section_id) {
                continue;
            }
            let section = doc::build_section(
                &note.section_id,
                doc::heading_with_text(&note.text),
                doc::body_with_text(""),
            );
            if let Some(content) = doc::content_mut(&mut tree) {
                content.insert(0, section);
            }
        }
        Ok(tree)
    }

    /// Emits every pending note, oldest first, as a content upsert against
    /// the inbox. Fresh sections get `seq = 1`, so concurrent captures
    /// from multiple devices order deterministically on the server.
    pub fn enqueue_pending_for_sync(&self, engine: &SyncEngine) -> Result<usize> {
        let notes = self.store.list_quick_notes()?;
        for note in &notes {
            engine.enqueue_section_upsert(
                INBOX_ARTICLE_ID,
                &note.section_id,
                doc::heading_with_text(&note.text),
                doc::body_with_text(""),
            )?;
        }
        Ok(notes.len())
    }
}
